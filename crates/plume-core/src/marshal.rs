//! Conversion between host datums and script values, driven by declared types.

use plume_rt::json as rt_json;
use serde_json::{Map, Number, Value as JsonValue};

use crate::datum::{self, ArrayDatum, Datum, Oid, RowDatum};
use crate::error::{PlumeError, Result};
use crate::host::{Catalog, QueryResult, RowSet};
use crate::types::{self, RowDescriptor, TypeCategory};
use crate::value::{MAX_SAFE_INTEGER, ScriptValue};

/// How strictly an object is matched against a row type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RowCheck {
    /// Unknown keys are ignored.
    Lenient,
    /// Every key must name a live column (set-returning rows).
    Exact,
}

pub struct Marshaler<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: Catalog + ?Sized> Marshaler<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    pub fn to_script(&self, datum: &Datum, type_id: Oid) -> Result<ScriptValue> {
        self.to_script_with(datum, type_id, None)
    }

    /// `row` describes anonymous records; named composites come from the catalog.
    pub fn to_script_with(
        &self,
        datum: &Datum,
        type_id: Oid,
        row: Option<&RowDescriptor>,
    ) -> Result<ScriptValue> {
        Ok(match datum {
            Datum::Null => ScriptValue::Null,
            Datum::Bool(v) => ScriptValue::Bool(*v),
            Datum::Int2(v) => ScriptValue::Number(*v as f64),
            Datum::Int4(v) => ScriptValue::Number(*v as f64),
            Datum::Oid(v) => ScriptValue::Number(*v as f64),
            Datum::Int8(v) => ScriptValue::BigInt(*v),
            Datum::Float4(v) => ScriptValue::Number(*v as f64),
            Datum::Float8(v) => ScriptValue::Number(*v),
            Datum::Numeric(text) => ScriptValue::Number(text.trim().parse::<f64>().map_err(|_| {
                PlumeError::Conversion(format!("invalid numeric value \"{text}\""))
            })?),
            Datum::Text(text) if matches!(type_id, types::JSON | types::JSONB) => {
                parse_json_text(text)?
            }
            Datum::Text(text) => ScriptValue::String(text.clone()),
            Datum::Json(text) => parse_json_text(text)?,
            Datum::Bytea(bytes) => ScriptValue::Bytes(bytes.clone()),
            Datum::Date(days) => ScriptValue::Date(datum::date_to_unix_millis(*days)),
            Datum::Timestamp(micros) => ScriptValue::Date(datum::timestamp_to_unix_millis(*micros)),
            Datum::Array(array) => {
                let element_type = match self.element_type(type_id) {
                    Some(element) => element,
                    None => array.element_type,
                };
                self.array_to_script(array, element_type)?
            }
            Datum::Row(row_value) => match row {
                Some(desc) => self.to_script_row(row_value, desc)?,
                None => {
                    let desc = self.row_descriptor(row_value.type_id)?;
                    self.to_script_row(row_value, &desc)?
                }
            },
        })
    }

    pub fn to_script_row(&self, row: &RowDatum, desc: &RowDescriptor) -> Result<ScriptValue> {
        let mut pairs = Vec::with_capacity(desc.attributes.len());
        for (idx, attr) in desc.live_attributes() {
            let value = row.values.get(idx).unwrap_or(&Datum::Null);
            pairs.push((attr.name.clone(), self.to_script(value, attr.type_id)?));
        }
        Ok(ScriptValue::Object(pairs))
    }

    fn array_to_script(&self, array: &ArrayDatum, element_type: Oid) -> Result<ScriptValue> {
        if array.dims.is_empty() || array.values.is_empty() {
            return Ok(ScriptValue::Array(Vec::new()));
        }
        let mut flat = Vec::with_capacity(array.values.len());
        for (idx, value) in array.values.iter().enumerate() {
            if array.nulls.get(idx).copied().unwrap_or(false) {
                flat.push(ScriptValue::Null);
            } else {
                flat.push(self.to_script(value, element_type)?);
            }
        }
        Ok(nest(flat, &array.dims))
    }

    pub fn rows_to_script(&self, set: &RowSet) -> Result<Vec<ScriptValue>> {
        let mut out = Vec::with_capacity(set.rows.len());
        for row in &set.rows {
            let mut pairs = Vec::with_capacity(set.columns.len());
            for (idx, column) in set.columns.iter().enumerate() {
                let value = row.get(idx).unwrap_or(&Datum::Null);
                pairs.push((column.name.clone(), self.to_script(value, column.type_id)?));
            }
            out.push(ScriptValue::Object(pairs));
        }
        Ok(out)
    }

    /// Row sequence for queries, affected-row count for everything else.
    pub fn result_to_script(&self, result: &QueryResult) -> Result<ScriptValue> {
        match result {
            QueryResult::Rows(set) => Ok(ScriptValue::Array(self.rows_to_script(set)?)),
            QueryResult::Affected(count) => Ok(ScriptValue::Number(*count as f64)),
        }
    }

    pub fn from_script(&self, value: &ScriptValue, type_id: Oid) -> Result<Datum> {
        if value.is_nullish() {
            return Ok(Datum::Null);
        }
        match type_id {
            types::VOID => return Ok(Datum::Null),
            types::UNKNOWN | types::ANYELEMENT | types::ANYNONARRAY => {
                return infer_datum(value);
            }
            _ => {}
        }
        let desc = types::resolve(self.catalog, type_id, None)?;
        match desc.category {
            TypeCategory::Array => {
                let element = desc.element_type.ok_or_else(|| {
                    PlumeError::type_resolution(type_id, "could not determine array element type")
                })?;
                self.array_from_script(value, type_id, element)
            }
            TypeCategory::Composite => {
                let row = self.row_descriptor(type_id)?;
                Ok(Datum::Row(self.from_script_row(value, &row, RowCheck::Lenient)?))
            }
            TypeCategory::Pseudo => infer_datum(value),
            TypeCategory::Scalar => scalar_from_script(value, type_id),
        }
    }

    pub fn from_script_row(
        &self,
        value: &ScriptValue,
        desc: &RowDescriptor,
        check: RowCheck,
    ) -> Result<RowDatum> {
        let pairs: &[(String, ScriptValue)] = match value {
            ScriptValue::Object(pairs) => pairs,
            ScriptValue::Array(items) if items.is_empty() => &[],
            other => {
                return Err(PlumeError::ArgumentType(format!(
                    "expected an object for a row value, got {}",
                    other.kind_name()
                )));
            }
        };
        if check == RowCheck::Exact {
            for (key, _) in pairs {
                if !desc.has_column(key) {
                    return Err(PlumeError::FieldMismatch(format!(
                        "\"{key}\" is not a column of the result row"
                    )));
                }
            }
        }
        let mut values = Vec::with_capacity(desc.attributes.len());
        for attr in &desc.attributes {
            if attr.dropped {
                values.push(Datum::Null);
                continue;
            }
            let field = pairs
                .iter()
                .find(|(name, _)| *name == attr.name)
                .map(|(_, value)| value);
            values.push(match field {
                Some(field) => self.from_script(field, attr.type_id)?,
                None => Datum::Null,
            });
        }
        Ok(RowDatum {
            type_id: desc.type_id,
            values,
        })
    }

    fn array_from_script(&self, value: &ScriptValue, type_id: Oid, element: Oid) -> Result<Datum> {
        let items: Vec<ScriptValue> = match value {
            ScriptValue::Array(items) => items.clone(),
            ScriptValue::Object(pairs) if pairs.is_empty() => Vec::new(),
            ScriptValue::Buffer(buffer) => (0..buffer.len())
                .filter_map(|idx| buffer.get(idx))
                .map(|v| ScriptValue::Number(v as f64))
                .collect(),
            other => {
                return Err(PlumeError::ArgumentType(format!(
                    "value for array type {type_id} must be an array, got {}",
                    other.kind_name()
                )));
            }
        };
        let descend = !matches!(element, types::JSON | types::JSONB);
        let mut dims = Vec::new();
        let mut flat = Vec::new();
        flatten(&items, descend, 0, &mut dims, &mut flat)?;
        let mut values = Vec::with_capacity(flat.len());
        let mut nulls = Vec::with_capacity(flat.len());
        for item in &flat {
            let datum = self.from_script(item, element)?;
            nulls.push(datum.is_null());
            values.push(datum);
        }
        if values.is_empty() {
            dims.clear();
        }
        let lower_bounds = dims.iter().map(|_| 1).collect();
        Ok(Datum::Array(ArrayDatum {
            element_type: element,
            dims,
            lower_bounds,
            values,
            nulls,
        }))
    }

    fn element_type(&self, type_id: Oid) -> Option<Oid> {
        self.catalog
            .type_info(type_id)
            .ok()
            .filter(|info| info.category == TypeCategory::Array)
            .and_then(|info| info.element)
    }

    fn row_descriptor(&self, type_id: Oid) -> Result<RowDescriptor> {
        self.catalog
            .row_descriptor(type_id)
            .map_err(|err| PlumeError::type_resolution(type_id, err.message))
    }
}

fn nest(flat: Vec<ScriptValue>, dims: &[usize]) -> ScriptValue {
    if dims.len() <= 1 {
        return ScriptValue::Array(flat);
    }
    let stride: usize = dims[1..].iter().product();
    let mut out = Vec::with_capacity(dims[0]);
    let mut rest = flat.into_iter();
    for _ in 0..dims[0] {
        let chunk: Vec<ScriptValue> = rest.by_ref().take(stride).collect();
        out.push(nest(chunk, &dims[1..]));
    }
    ScriptValue::Array(out)
}

fn flatten(
    items: &[ScriptValue],
    descend: bool,
    depth: usize,
    dims: &mut Vec<usize>,
    out: &mut Vec<ScriptValue>,
) -> Result<()> {
    match dims.get(depth) {
        Some(expected) if *expected != items.len() => {
            return Err(PlumeError::Conversion(
                "multidimensional arrays must have sub-arrays with matching dimensions".to_string(),
            ));
        }
        Some(_) => {}
        None => dims.push(items.len()),
    }
    let nested = descend && items.first().is_some_and(|first| matches!(first, ScriptValue::Array(_)));
    for item in items {
        match (nested, item) {
            (true, ScriptValue::Array(inner)) => flatten(inner, descend, depth + 1, dims, out)?,
            (true, _) | (false, ScriptValue::Array(_)) if descend => {
                return Err(PlumeError::Conversion(
                    "multidimensional arrays must have sub-arrays with matching dimensions"
                        .to_string(),
                ));
            }
            _ => out.push(item.clone()),
        }
    }
    Ok(())
}

fn scalar_from_script(value: &ScriptValue, type_id: Oid) -> Result<Datum> {
    match type_id {
        types::BOOL => Ok(Datum::Bool(value.truthy())),
        types::INT2 => {
            let v = integer_from_script(value, type_id, i16::MIN as i64, i16::MAX as i64)?;
            Ok(Datum::Int2(v as i16))
        }
        types::INT4 => {
            let v = integer_from_script(value, type_id, i32::MIN as i64, i32::MAX as i64)?;
            Ok(Datum::Int4(v as i32))
        }
        types::OID => {
            let v = integer_from_script(value, type_id, 0, u32::MAX as i64)?;
            Ok(Datum::Oid(v as u32))
        }
        types::INT8 => int8_from_script(value).map(Datum::Int8),
        types::FLOAT4 => Ok(Datum::Float4(number_from_script(value, type_id)? as f32)),
        types::FLOAT8 => Ok(Datum::Float8(number_from_script(value, type_id)?)),
        types::NUMERIC => numeric_from_script(value).map(Datum::Numeric),
        types::BYTEA => bytes_from_script(value).map(Datum::Bytea),
        types::JSON => Ok(Datum::Json(rt_json::encode(&script_to_json(value)))),
        types::JSONB => Ok(Datum::Json(rt_json::encode(&rt_json::sort_keys(
            script_to_json(value),
        )))),
        types::DATE => {
            let days = match value {
                ScriptValue::String(text) => datum::parse_date(text),
                other => millis_of(other).and_then(datum::unix_millis_to_date),
            };
            days.map(Datum::Date).ok_or_else(|| {
                PlumeError::Conversion(format!("cannot convert {} to date", value.kind_name()))
            })
        }
        types::TIMESTAMP | types::TIMESTAMPTZ => {
            let micros = match value {
                ScriptValue::String(text) => datum::parse_timestamp(text),
                other => millis_of(other).and_then(datum::unix_millis_to_timestamp),
            };
            micros.map(Datum::Timestamp).ok_or_else(|| {
                PlumeError::Conversion(format!("cannot convert {} to timestamp", value.kind_name()))
            })
        }
        _ => text_from_script(value).map(Datum::Text),
    }
}

fn millis_of(value: &ScriptValue) -> Option<f64> {
    match value {
        ScriptValue::Date(ms) | ScriptValue::Number(ms) => Some(*ms),
        ScriptValue::BigInt(ms) => Some(*ms as f64),
        _ => None,
    }
}

fn integer_from_script(value: &ScriptValue, type_id: Oid, min: i64, max: i64) -> Result<i64> {
    let name = type_name(type_id);
    let v = match value {
        ScriptValue::BigInt(v) => *v,
        ScriptValue::Bool(v) => *v as i64,
        ScriptValue::String(text) => {
            let parsed = text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    PlumeError::Conversion(format!("invalid input syntax for type {name}: \"{text}\""))
                })?;
            bounded_integer(parsed, min, max, &name)?
        }
        ScriptValue::Number(v) if v.is_finite() => bounded_integer(*v, min, max, &name)?,
        other => {
            return Err(PlumeError::Conversion(format!(
                "cannot convert {} to {name}",
                other.kind_name()
            )));
        }
    };
    if v < min || v > max {
        return Err(PlumeError::Conversion(format!("value {v} is out of range for type {name}")));
    }
    Ok(v)
}

fn bounded_integer(v: f64, min: i64, max: i64, name: &str) -> Result<i64> {
    let truncated = v.trunc();
    if truncated < min as f64 || truncated > max as f64 {
        return Err(PlumeError::Conversion(format!("value {v} is out of range for type {name}")));
    }
    Ok(truncated as i64)
}

/// Big integers pass through; plain numbers must stay within the exactly representable range.
fn int8_from_script(value: &ScriptValue) -> Result<i64> {
    match value {
        ScriptValue::BigInt(v) => Ok(*v),
        ScriptValue::Bool(v) => Ok(*v as i64),
        ScriptValue::Number(v) if v.is_finite() => {
            let truncated = v.trunc();
            if truncated.abs() > MAX_SAFE_INTEGER {
                return Err(PlumeError::Conversion(format!(
                    "number {v} cannot be converted to bigint without losing precision"
                )));
            }
            Ok(truncated as i64)
        }
        ScriptValue::String(text) => text.trim().parse::<i64>().map_err(|_| {
            PlumeError::Conversion(format!("invalid input syntax for type bigint: \"{text}\""))
        }),
        other => Err(PlumeError::Conversion(format!(
            "cannot convert {} to bigint",
            other.kind_name()
        ))),
    }
}

fn number_from_script(value: &ScriptValue, type_id: Oid) -> Result<f64> {
    match value {
        ScriptValue::Number(v) => Ok(*v),
        ScriptValue::BigInt(v) => Ok(*v as f64),
        ScriptValue::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        ScriptValue::String(text) => text.trim().parse::<f64>().map_err(|_| {
            PlumeError::Conversion(format!(
                "invalid input syntax for type {}: \"{text}\"",
                type_name(type_id)
            ))
        }),
        other => Err(PlumeError::Conversion(format!(
            "cannot convert {} to {}",
            other.kind_name(),
            type_name(type_id)
        ))),
    }
}

fn numeric_from_script(value: &ScriptValue) -> Result<String> {
    match value {
        ScriptValue::Number(v) => Ok(format_number(*v)),
        ScriptValue::BigInt(v) => Ok(v.to_string()),
        ScriptValue::String(text) => {
            let trimmed = text.trim();
            trimmed.parse::<f64>().map_err(|_| {
                PlumeError::Conversion(format!("invalid input syntax for type numeric: \"{text}\""))
            })?;
            Ok(trimmed.to_string())
        }
        other => Err(PlumeError::Conversion(format!(
            "cannot convert {} to numeric",
            other.kind_name()
        ))),
    }
}

fn bytes_from_script(value: &ScriptValue) -> Result<Vec<u8>> {
    match value {
        ScriptValue::Bytes(bytes) => Ok(bytes.clone()),
        ScriptValue::Buffer(buffer) => Ok(buffer.bytes.clone()),
        ScriptValue::String(text) => Ok(text.as_bytes().to_vec()),
        other => Err(PlumeError::Conversion(format!(
            "cannot convert {} to bytea",
            other.kind_name()
        ))),
    }
}

fn text_from_script(value: &ScriptValue) -> Result<String> {
    match value {
        ScriptValue::String(text) => Ok(text.clone()),
        ScriptValue::Number(v) => Ok(format_number(*v)),
        ScriptValue::BigInt(v) => Ok(v.to_string()),
        ScriptValue::Bool(v) => Ok(v.to_string()),
        ScriptValue::Date(ms) => Ok(format_date_value(*ms)),
        ScriptValue::Bytes(bytes) => String::from_utf8(bytes.clone()).map_err(|_| {
            PlumeError::Conversion("byte string is not valid UTF-8 text".to_string())
        }),
        other => Ok(rt_json::encode(&script_to_json(other))),
    }
}

fn type_name(type_id: Oid) -> String {
    types::builtin_type(type_id)
        .map(|info| info.name)
        .unwrap_or_else(|| type_id.to_string())
}

/// Prints integral values without a fractional part.
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if v.fract() == 0.0 && v.abs() < 1e18 {
        return format!("{}", v as i64);
    }
    format!("{v}")
}

fn format_date_value(ms: f64) -> String {
    datum::unix_millis_to_timestamp(ms)
        .and_then(datum::format_timestamp)
        .unwrap_or_else(|| "Invalid Date".to_string())
}

/// Best-effort host value for a parameter whose type the host cannot infer.
pub fn infer_datum(value: &ScriptValue) -> Result<Datum> {
    Ok(match value {
        ScriptValue::Undefined | ScriptValue::Null => Datum::Null,
        ScriptValue::Bool(v) => Datum::Bool(*v),
        ScriptValue::Number(v) if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER => {
            Datum::Int8(*v as i64)
        }
        ScriptValue::Number(v) => Datum::Float8(*v),
        ScriptValue::BigInt(v) => Datum::Int8(*v),
        ScriptValue::String(text) => Datum::Text(text.clone()),
        ScriptValue::Bytes(bytes) => Datum::Bytea(bytes.clone()),
        ScriptValue::Buffer(buffer) => Datum::Bytea(buffer.bytes.clone()),
        ScriptValue::Date(ms) => Datum::Timestamp(datum::unix_millis_to_timestamp(*ms).ok_or_else(
            || PlumeError::Conversion("invalid date value".to_string()),
        )?),
        other => Datum::Json(rt_json::encode(&script_to_json(other))),
    })
}

pub fn parse_json_text(text: &str) -> Result<ScriptValue> {
    let value = rt_json::parse(text).map_err(PlumeError::Conversion)?;
    Ok(json_to_script(&value))
}

pub fn json_to_script(value: &JsonValue) -> ScriptValue {
    match value {
        JsonValue::Null => ScriptValue::Null,
        JsonValue::Bool(v) => ScriptValue::Bool(*v),
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) if (v.unsigned_abs() as f64) <= MAX_SAFE_INTEGER => ScriptValue::Number(v as f64),
            Some(v) => ScriptValue::BigInt(v),
            None => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(text) => ScriptValue::String(text.clone()),
        JsonValue::Array(items) => ScriptValue::Array(items.iter().map(json_to_script).collect()),
        JsonValue::Object(map) => ScriptValue::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_script(value)))
                .collect(),
        ),
    }
}

pub fn script_to_json(value: &ScriptValue) -> JsonValue {
    match value {
        ScriptValue::Undefined | ScriptValue::Null => JsonValue::Null,
        ScriptValue::Bool(v) => JsonValue::Bool(*v),
        ScriptValue::Number(v) => {
            if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER {
                JsonValue::Number(Number::from(*v as i64))
            } else {
                Number::from_f64(*v).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
        }
        ScriptValue::BigInt(v) => JsonValue::Number(Number::from(*v)),
        ScriptValue::String(text) => JsonValue::String(text.clone()),
        ScriptValue::Bytes(bytes) => JsonValue::String(match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => plume_rt::bytes::encode_base64(bytes),
        }),
        ScriptValue::Buffer(buffer) => JsonValue::Array(
            (0..buffer.len())
                .filter_map(|idx| buffer.get(idx))
                .map(|v| JsonValue::Number(Number::from(v)))
                .collect(),
        ),
        ScriptValue::Date(ms) => JsonValue::String(format_date_value(*ms)),
        ScriptValue::Array(items) => JsonValue::Array(items.iter().map(script_to_json).collect()),
        ScriptValue::Object(pairs) => {
            let mut map = Map::new();
            for (key, value) in pairs {
                if matches!(value, ScriptValue::Undefined) {
                    continue;
                }
                map.insert(key.clone(), script_to_json(value));
            }
            JsonValue::Object(map)
        }
    }
}
