//! Type descriptor resolution and the builtin type table.

use crate::datum::Oid;
use crate::error::{PlumeError, Result};
use crate::host::Catalog;

pub const BOOL: Oid = 16;
pub const BYTEA: Oid = 17;
pub const NAME: Oid = 19;
pub const INT8: Oid = 20;
pub const INT2: Oid = 21;
pub const INT4: Oid = 23;
pub const TEXT: Oid = 25;
pub const OID: Oid = 26;
pub const JSON: Oid = 114;
pub const XML: Oid = 142;
pub const FLOAT4: Oid = 700;
pub const FLOAT8: Oid = 701;
pub const UNKNOWN: Oid = 705;
pub const BPCHAR: Oid = 1042;
pub const VARCHAR: Oid = 1043;
pub const DATE: Oid = 1082;
pub const TIMESTAMP: Oid = 1114;
pub const TIMESTAMPTZ: Oid = 1184;
pub const NUMERIC: Oid = 1700;
pub const JSONB: Oid = 3802;
pub const RECORD: Oid = 2249;
pub const ANYARRAY: Oid = 2277;
pub const VOID: Oid = 2278;
pub const TRIGGER: Oid = 2279;
pub const ANYELEMENT: Oid = 2283;
pub const ANYNONARRAY: Oid = 2776;

pub const BOOL_ARRAY: Oid = 1000;
pub const BYTEA_ARRAY: Oid = 1001;
pub const NAME_ARRAY: Oid = 1003;
pub const INT2_ARRAY: Oid = 1005;
pub const INT4_ARRAY: Oid = 1007;
pub const TEXT_ARRAY: Oid = 1009;
pub const BPCHAR_ARRAY: Oid = 1014;
pub const VARCHAR_ARRAY: Oid = 1015;
pub const INT8_ARRAY: Oid = 1016;
pub const FLOAT4_ARRAY: Oid = 1021;
pub const FLOAT8_ARRAY: Oid = 1022;
pub const OID_ARRAY: Oid = 1028;
pub const JSON_ARRAY: Oid = 199;
pub const XML_ARRAY: Oid = 143;
pub const DATE_ARRAY: Oid = 1182;
pub const TIMESTAMP_ARRAY: Oid = 1115;
pub const TIMESTAMPTZ_ARRAY: Oid = 1185;
pub const NUMERIC_ARRAY: Oid = 1231;
pub const JSONB_ARRAY: Oid = 3807;
pub const RECORD_ARRAY: Oid = 2287;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeCategory {
    Scalar,
    Array,
    Composite,
    Pseudo,
}

/// Catalog entry for one type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeInfo {
    pub oid: Oid,
    pub name: String,
    pub category: TypeCategory,
    pub element: Option<Oid>,
    pub array_type: Option<Oid>,
    /// Fixed width in bytes, or -1 for variable length.
    pub len: i16,
    pub by_value: bool,
    pub align: char,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeDescriptor {
    pub type_id: Oid,
    pub element_type: Option<Oid>,
    pub category: TypeCategory,
    pub storage_width: i16,
    pub pass_by_value: bool,
    pub alignment: char,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub type_id: Oid,
    pub dropped: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, type_id: Oid) -> Self {
        Self {
            name: name.into(),
            type_id,
            dropped: false,
        }
    }
}

/// Column layout of a composite type or an anonymous record.
#[derive(Clone, Debug, PartialEq)]
pub struct RowDescriptor {
    pub type_id: Oid,
    pub attributes: Vec<Attribute>,
}

impl RowDescriptor {
    pub fn new(type_id: Oid, attributes: Vec<Attribute>) -> Self {
        Self {
            type_id,
            attributes,
        }
    }

    pub fn live_attributes(&self) -> impl Iterator<Item = (usize, &Attribute)> {
        self.attributes
            .iter()
            .enumerate()
            .filter(|(_, attr)| !attr.dropped)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.live_attributes().any(|(_, attr)| attr.name == name)
    }
}

struct Builtin {
    oid: Oid,
    name: &'static str,
    len: i16,
    by_value: bool,
    align: char,
    array: Oid,
}

const BUILTINS: &[Builtin] = &[
    Builtin { oid: BOOL, name: "bool", len: 1, by_value: true, align: 'c', array: BOOL_ARRAY },
    Builtin { oid: BYTEA, name: "bytea", len: -1, by_value: false, align: 'i', array: BYTEA_ARRAY },
    Builtin { oid: NAME, name: "name", len: 64, by_value: false, align: 'c', array: NAME_ARRAY },
    Builtin { oid: INT8, name: "int8", len: 8, by_value: true, align: 'd', array: INT8_ARRAY },
    Builtin { oid: INT2, name: "int2", len: 2, by_value: true, align: 's', array: INT2_ARRAY },
    Builtin { oid: INT4, name: "int4", len: 4, by_value: true, align: 'i', array: INT4_ARRAY },
    Builtin { oid: TEXT, name: "text", len: -1, by_value: false, align: 'i', array: TEXT_ARRAY },
    Builtin { oid: OID, name: "oid", len: 4, by_value: true, align: 'i', array: OID_ARRAY },
    Builtin { oid: JSON, name: "json", len: -1, by_value: false, align: 'i', array: JSON_ARRAY },
    Builtin { oid: XML, name: "xml", len: -1, by_value: false, align: 'i', array: XML_ARRAY },
    Builtin { oid: FLOAT4, name: "float4", len: 4, by_value: true, align: 'i', array: FLOAT4_ARRAY },
    Builtin { oid: FLOAT8, name: "float8", len: 8, by_value: true, align: 'd', array: FLOAT8_ARRAY },
    Builtin { oid: BPCHAR, name: "bpchar", len: -1, by_value: false, align: 'i', array: BPCHAR_ARRAY },
    Builtin { oid: VARCHAR, name: "varchar", len: -1, by_value: false, align: 'i', array: VARCHAR_ARRAY },
    Builtin { oid: DATE, name: "date", len: 4, by_value: true, align: 'i', array: DATE_ARRAY },
    Builtin { oid: TIMESTAMP, name: "timestamp", len: 8, by_value: true, align: 'd', array: TIMESTAMP_ARRAY },
    Builtin { oid: TIMESTAMPTZ, name: "timestamptz", len: 8, by_value: true, align: 'd', array: TIMESTAMPTZ_ARRAY },
    Builtin { oid: NUMERIC, name: "numeric", len: -1, by_value: false, align: 'i', array: NUMERIC_ARRAY },
    Builtin { oid: JSONB, name: "jsonb", len: -1, by_value: false, align: 'i', array: JSONB_ARRAY },
];

const PSEUDO: &[(Oid, &str)] = &[
    (UNKNOWN, "unknown"),
    (RECORD, "record"),
    (ANYARRAY, "anyarray"),
    (VOID, "void"),
    (TRIGGER, "trigger"),
    (ANYELEMENT, "anyelement"),
    (ANYNONARRAY, "anynonarray"),
];

const ALIASES: &[(&str, &str)] = &[
    ("boolean", "bool"),
    ("smallint", "int2"),
    ("integer", "int4"),
    ("int", "int4"),
    ("bigint", "int8"),
    ("real", "float4"),
    ("double precision", "float8"),
    ("float", "float8"),
    ("decimal", "numeric"),
    ("character varying", "varchar"),
    ("character", "bpchar"),
    ("char", "bpchar"),
    ("timestamp without time zone", "timestamp"),
    ("timestamp with time zone", "timestamptz"),
];

/// Builtin catalog entry, including the `_name` array types and pseudo-types.
pub fn builtin_type(oid: Oid) -> Option<TypeInfo> {
    if let Some(entry) = BUILTINS.iter().find(|entry| entry.oid == oid) {
        return Some(TypeInfo {
            oid,
            name: entry.name.to_string(),
            category: TypeCategory::Scalar,
            element: None,
            array_type: Some(entry.array),
            len: entry.len,
            by_value: entry.by_value,
            align: entry.align,
        });
    }
    if let Some(entry) = BUILTINS.iter().find(|entry| entry.array == oid) {
        return Some(TypeInfo {
            oid,
            name: format!("_{}", entry.name),
            category: TypeCategory::Array,
            element: Some(entry.oid),
            array_type: None,
            len: -1,
            by_value: false,
            align: if entry.align == 'd' { 'd' } else { 'i' },
        });
    }
    if oid == RECORD_ARRAY {
        return Some(TypeInfo {
            oid,
            name: "_record".to_string(),
            category: TypeCategory::Array,
            element: Some(RECORD),
            array_type: None,
            len: -1,
            by_value: false,
            align: 'd',
        });
    }
    PSEUDO
        .iter()
        .find(|(pseudo, _)| *pseudo == oid)
        .map(|(oid, name)| TypeInfo {
            oid: *oid,
            name: name.to_string(),
            category: TypeCategory::Pseudo,
            element: None,
            array_type: if *oid == RECORD { Some(RECORD_ARRAY) } else { None },
            len: -1,
            by_value: false,
            align: 'd',
        })
}

/// Resolves a builtin type name such as `integer`, `varchar(20)` or `text[]`.
pub fn builtin_type_by_name(name: &str) -> Option<Oid> {
    let (base, array_depth) = split_type_name(name);
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == base)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(base.as_str());
    let scalar = BUILTINS
        .iter()
        .find(|entry| entry.name == canonical)
        .map(|entry| entry.oid)
        .or_else(|| {
            PSEUDO
                .iter()
                .find(|(_, pseudo)| *pseudo == canonical)
                .map(|(oid, _)| *oid)
        })?;
    match array_depth {
        0 => Some(scalar),
        _ => array_type_of(scalar),
    }
}

pub fn array_type_of(element: Oid) -> Option<Oid> {
    builtin_type(element).and_then(|info| info.array_type)
}

/// Lower-cases, strips a type modifier and counts trailing `[]` pairs.
pub fn split_type_name(name: &str) -> (String, usize) {
    let mut base = name.trim().to_ascii_lowercase();
    let mut depth = 0;
    while let Some(stripped) = base.strip_suffix("[]") {
        base = stripped.trim_end().to_string();
        depth += 1;
    }
    if let Some(open) = base.find('(') {
        base.truncate(open);
    }
    let collapsed = base.split_whitespace().collect::<Vec<_>>().join(" ");
    (collapsed, depth)
}

pub fn is_polymorphic(type_id: Oid) -> bool {
    matches!(type_id, ANYELEMENT | ANYARRAY | ANYNONARRAY)
}

/// Resolves `type_id` to a descriptor; `record` requires the caller's row descriptor.
pub fn resolve<C: Catalog + ?Sized>(
    catalog: &C,
    type_id: Oid,
    row: Option<&RowDescriptor>,
) -> Result<TypeDescriptor> {
    if type_id == RECORD {
        let Some(row) = row else {
            return Err(PlumeError::type_resolution(
                type_id,
                "record type has not been assigned a row descriptor",
            ));
        };
        return Ok(TypeDescriptor {
            type_id: row.type_id,
            element_type: None,
            category: TypeCategory::Composite,
            storage_width: -1,
            pass_by_value: false,
            alignment: 'd',
        });
    }
    let info = catalog
        .type_info(type_id)
        .map_err(|err| PlumeError::type_resolution(type_id, err.message))?;
    if info.category != TypeCategory::Array {
        return Ok(TypeDescriptor {
            type_id,
            element_type: None,
            category: info.category,
            storage_width: info.len,
            pass_by_value: info.by_value,
            alignment: info.align,
        });
    }
    let Some(element) = info.element else {
        return Err(PlumeError::type_resolution(
            type_id,
            "could not determine array element type",
        ));
    };
    let element_info = catalog
        .type_info(element)
        .map_err(|err| PlumeError::type_resolution(element, err.message))?;
    if element_info.category == TypeCategory::Array {
        return Err(PlumeError::type_resolution(
            type_id,
            "array element type is itself an array",
        ));
    }
    Ok(TypeDescriptor {
        type_id,
        element_type: Some(element),
        category: TypeCategory::Array,
        storage_width: element_info.len,
        pass_by_value: element_info.by_value,
        alignment: element_info.align,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_accept_aliases_modifiers_and_arrays() {
        assert_eq!(builtin_type_by_name("integer"), Some(INT4));
        assert_eq!(builtin_type_by_name(" Double   Precision "), Some(FLOAT8));
        assert_eq!(builtin_type_by_name("varchar(20)"), Some(VARCHAR));
        assert_eq!(builtin_type_by_name("text[]"), Some(TEXT_ARRAY));
        assert_eq!(builtin_type_by_name("bigint []"), Some(INT8_ARRAY));
        assert_eq!(builtin_type_by_name("trigger"), Some(TRIGGER));
        assert_eq!(builtin_type_by_name("point"), None);
    }

    #[test]
    fn builtin_arrays_point_at_their_elements() {
        let info = builtin_type(INT4_ARRAY).expect("int4[] is builtin");
        assert_eq!(info.category, TypeCategory::Array);
        assert_eq!(info.element, Some(INT4));
        assert_eq!(info.name, "_int4");
        assert_eq!(array_type_of(TEXT), Some(TEXT_ARRAY));
        assert_eq!(builtin_type(RECORD).map(|info| info.category), Some(TypeCategory::Pseudo));
    }
}
