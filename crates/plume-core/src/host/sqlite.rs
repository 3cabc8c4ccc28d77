//! Reference host on SQLite: catalog tables, statements, savepoints and cursors.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Statement, params};

use crate::datum::{self, Datum, Oid, RowDatum};
use crate::error::HostError;
use crate::marshal::{Marshaler, json_to_script, script_to_json};
use crate::types::{self, Attribute, RowDescriptor, TypeCategory, TypeInfo};

use super::{
    ArgMode, Catalog, Column, Executor, FetchDirection, HostResult, LogLevel, PlanId, QueryResult,
    RelationInfo, RoutineDefinition, RoutineKind, RoutineMetadata, RowSet, SubtransactionId,
};

/// Role every new connection starts as; it may run any routine.
pub const SUPERUSER: Oid = 10;
/// Grantee standing for every role.
pub const PUBLIC: Oid = 0;
const FIRST_ROUTINE_OID: Oid = 16_384;
const FIRST_COMPOSITE_OID: Oid = 100_000;

const CATALOG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS plume_routines (
    oid INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    source TEXT NOT NULL,
    language TEXT NOT NULL,
    kind TEXT NOT NULL,
    returns_set INTEGER NOT NULL,
    arg_types TEXT NOT NULL,
    arg_modes TEXT NOT NULL,
    arg_names TEXT NOT NULL,
    return_type INTEGER NOT NULL,
    owner INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (name, arg_types)
);
CREATE TABLE IF NOT EXISTS plume_grants (
    routine INTEGER NOT NULL,
    role INTEGER NOT NULL,
    PRIMARY KEY (routine, role)
);
CREATE TABLE IF NOT EXISTS plume_types (
    oid INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    array_oid INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS plume_type_attributes (
    type_oid INTEGER NOT NULL,
    position INTEGER NOT NULL,
    name TEXT NOT NULL,
    type_id INTEGER NOT NULL,
    dropped INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (type_oid, position)
);
CREATE TABLE IF NOT EXISTS plume_modules (
    path TEXT PRIMARY KEY,
    source TEXT NOT NULL
);
"#;

impl From<rusqlite::Error> for HostError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                HostError::with_sqlstate(err.to_string(), "23000")
            }
            _ => HostError::new(err.to_string()),
        }
    }
}

/// Message a script sent through `plume.log`.
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub level: LogLevel,
    pub message: String,
}

struct Plan {
    sql: String,
}

/// A portal over a fully materialized result.
///
/// `position` follows server cursor rules: 0 is before the first row and `len + 1` after the last.
struct Cursor {
    set: RowSet,
    position: usize,
}

impl Cursor {
    fn step(&mut self, direction: FetchDirection, count: u64, mut sink: impl FnMut(usize)) -> u64 {
        let len = self.set.rows.len();
        let mut moved = 0;
        for _ in 0..count {
            match direction {
                FetchDirection::Forward => {
                    if self.position >= len {
                        self.position = len + 1;
                        break;
                    }
                    self.position += 1;
                }
                FetchDirection::Backward => {
                    if self.position <= 1 {
                        self.position = 0;
                        break;
                    }
                    self.position -= 1;
                }
            }
            sink(self.position - 1);
            moved += 1;
        }
        moved
    }
}

pub struct SqliteHost {
    conn: Connection,
    role: Oid,
    plans: HashMap<PlanId, Plan>,
    next_plan: PlanId,
    cursors: HashMap<String, Cursor>,
    next_cursor: u64,
    savepoints: Vec<SubtransactionId>,
    next_savepoint: SubtransactionId,
    notices: Vec<Notice>,
}

impl SqliteHost {
    pub fn open(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|err| HostError::new(format!("db open failed: {err}")))?;
        log::debug!("opened database {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> HostResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| HostError::new(format!("db open failed: {err}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> HostResult<Self> {
        conn.execute_batch(CATALOG_SCHEMA)?;
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn,
            role: SUPERUSER,
            plans: HashMap::new(),
            next_plan: 1,
            cursors: HashMap::new(),
            next_cursor: 1,
            savepoints: Vec::new(),
            next_savepoint: 1,
            notices: Vec::new(),
        })
    }

    pub fn set_role(&mut self, role: Oid) {
        self.role = role;
    }

    /// Messages scripts logged since the last call.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Creates a routine or replaces the one with the same name and parameter types.
    pub fn create_routine(&mut self, def: &RoutineDefinition) -> HostResult<Oid> {
        let mut arg_types = Vec::with_capacity(def.args.len());
        for arg in &def.args {
            arg_types.push(self.type_by_name(&arg.type_name)?);
        }
        let return_type = self.type_by_name(&def.returns)?;
        let type_list = join_oids(&arg_types);
        let modes: String = def.args.iter().map(|arg| arg.mode.code()).collect();
        let names = def
            .args
            .iter()
            .map(|arg| arg.name.clone().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");

        let existing: Option<Oid> = self
            .conn
            .query_row(
                "SELECT oid FROM plume_routines WHERE name = ?1 AND arg_types = ?2",
                params![def.name, type_list],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(oid) = existing {
            self.conn.execute(
                "UPDATE plume_routines SET source = ?1, kind = ?2, returns_set = ?3, \
                 arg_modes = ?4, arg_names = ?5, return_type = ?6, version = version + 1 \
                 WHERE oid = ?7",
                params![
                    def.source,
                    def.kind.as_str(),
                    def.returns_set,
                    modes,
                    names,
                    return_type,
                    oid
                ],
            )?;
            log::debug!("replaced routine {} ({oid})", def.name);
            return Ok(oid);
        }

        let oid: Oid = self.conn.query_row(
            "SELECT COALESCE(MAX(oid) + 1, ?1) FROM plume_routines",
            params![FIRST_ROUTINE_OID],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO plume_routines (oid, name, source, language, kind, returns_set, \
             arg_types, arg_modes, arg_names, return_type, owner) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                oid,
                def.name,
                def.source,
                crate::bridge::LANGUAGE,
                def.kind.as_str(),
                def.returns_set,
                type_list,
                modes,
                names,
                return_type,
                self.role
            ],
        )?;
        log::debug!("created routine {} ({oid})", def.name);
        Ok(oid)
    }

    pub fn routine_version(&self, oid: Oid) -> HostResult<u32> {
        self.conn
            .query_row(
                "SELECT version FROM plume_routines WHERE oid = ?1",
                params![oid],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| HostError::new(format!("cache lookup failed for function {oid}")))
    }

    pub fn grant_execute(&mut self, routine: Oid, role: Oid) -> HostResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO plume_grants (routine, role) VALUES (?1, ?2)",
            params![routine, role],
        )?;
        Ok(())
    }

    pub fn revoke_execute(&mut self, routine: Oid, role: Oid) -> HostResult<()> {
        self.conn.execute(
            "DELETE FROM plume_grants WHERE routine = ?1 AND role = ?2",
            params![routine, role],
        )?;
        Ok(())
    }

    pub fn define_module(&mut self, path: &str, source: &str) -> HostResult<()> {
        self.conn.execute(
            "INSERT INTO plume_modules (path, source) VALUES (?1, ?2) \
             ON CONFLICT (path) DO UPDATE SET source = excluded.source",
            params![path, source],
        )?;
        Ok(())
    }

    /// Registers a named composite type; `fields` are `(name, type name)` pairs.
    pub fn define_composite(&mut self, name: &str, fields: &[(&str, &str)]) -> HostResult<Oid> {
        let mut attributes = Vec::with_capacity(fields.len());
        for (field, type_name) in fields {
            attributes.push(Attribute::new(*field, self.type_by_name(type_name)?));
        }
        self.store_composite(name, &attributes)
    }

    /// Marks an attribute dropped; its slot stays in the row layout.
    pub fn drop_attribute(&mut self, type_name: &str, attribute: &str) -> HostResult<()> {
        let oid = self.type_by_name(type_name)?;
        let changed = self.conn.execute(
            "UPDATE plume_type_attributes SET dropped = 1 WHERE type_oid = ?1 AND name = ?2",
            params![oid, attribute],
        )?;
        if changed == 0 {
            return Err(HostError::new(format!(
                "column \"{attribute}\" of type {type_name} does not exist"
            )));
        }
        Ok(())
    }

    /// Describes a table and registers its row type under the table's name.
    pub fn relation(&mut self, table: &str) -> HostResult<RelationInfo> {
        let columns: Vec<(String, Option<String>)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
            let rows = stmt.query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        if columns.is_empty() {
            return Err(HostError::with_sqlstate(
                format!("relation \"{table}\" does not exist"),
                "42P01",
            ));
        }
        let attributes: Vec<Attribute> = columns
            .into_iter()
            .map(|(name, decl)| {
                let type_id = decl.as_deref().and_then(decltype_oid).unwrap_or(types::TEXT);
                Attribute::new(name, type_id)
            })
            .collect();
        let oid = self.store_composite(table, &attributes)?;
        Ok(RelationInfo {
            oid,
            name: table.to_string(),
            schema: "main".to_string(),
            row: RowDescriptor::new(oid, attributes),
        })
    }

    /// Writes `row` into `table`, e.g. the row a BEFORE trigger let through.
    pub fn insert_row(&mut self, table: &str, row: &RowDatum) -> HostResult<u64> {
        let relation = self.relation(table)?;
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (idx, attr) in relation.row.live_attributes() {
            names.push(quote_ident(&attr.name));
            values.push(row.values.get(idx).cloned().unwrap_or(Datum::Null));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|n| format!("${n}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders.join(", ")
        );
        match self.run(&sql, &values)? {
            QueryResult::Affected(count) => Ok(count),
            QueryResult::Rows(set) => Ok(set.rows.len() as u64),
        }
    }

    fn store_composite(&mut self, name: &str, attributes: &[Attribute]) -> HostResult<Oid> {
        let existing: Option<Oid> = self
            .conn
            .query_row(
                "SELECT oid FROM plume_types WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let oid = match existing {
            Some(oid) => {
                self.conn.execute(
                    "DELETE FROM plume_type_attributes WHERE type_oid = ?1",
                    params![oid],
                )?;
                oid
            }
            None => {
                let oid: Oid = self.conn.query_row(
                    "SELECT COALESCE(MAX(array_oid) + 1, ?1) FROM plume_types",
                    params![FIRST_COMPOSITE_OID],
                    |row| row.get(0),
                )?;
                self.conn.execute(
                    "INSERT INTO plume_types (oid, name, array_oid) VALUES (?1, ?2, ?3)",
                    params![oid, name, oid + 1],
                )?;
                oid
            }
        };
        for (position, attr) in attributes.iter().enumerate() {
            self.conn.execute(
                "INSERT INTO plume_type_attributes (type_oid, position, name, type_id, dropped) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![oid, position as i64, attr.name, attr.type_id, attr.dropped],
            )?;
        }
        Ok(oid)
    }

    fn composite_by_oid(&self, oid: Oid) -> HostResult<Option<(Oid, String, Oid)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT oid, name, array_oid FROM plume_types WHERE oid = ?1 OR array_oid = ?1",
                params![oid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?)
    }

    fn routines_named(&self, name: &str) -> HostResult<Vec<RoutineMetadata>> {
        let oids: Vec<Oid> = {
            let mut stmt = self
                .conn
                .prepare("SELECT oid FROM plume_routines WHERE name = ?1 ORDER BY oid")?;
            let rows = stmt.query_map(params![name], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        oids.into_iter().map(|oid| self.routine(oid)).collect()
    }

    fn run(&self, sql: &str, params: &[Datum]) -> HostResult<QueryResult> {
        let mut stmt = self.conn.prepare(sql)?;
        self.bind(&mut stmt, params)?;
        if stmt.column_count() == 0 {
            let affected = stmt.raw_execute()?;
            return Ok(QueryResult::Affected(affected as u64));
        }
        let declared: Vec<(String, Option<Oid>)> = stmt
            .columns()
            .iter()
            .map(|column| {
                (
                    column.name().to_string(),
                    column.decl_type().and_then(decltype_oid),
                )
            })
            .collect();
        let mut raw_rows: Vec<Vec<SqlValue>> = Vec::new();
        {
            let mut rows = stmt.raw_query();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(declared.len());
                for idx in 0..declared.len() {
                    values.push(row.get::<_, SqlValue>(idx)?);
                }
                raw_rows.push(values);
            }
        }
        let columns: Vec<Column> = declared
            .into_iter()
            .enumerate()
            .map(|(idx, (name, declared))| Column {
                name,
                type_id: declared.unwrap_or_else(|| infer_column_type(&raw_rows, idx)),
            })
            .collect();
        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let mut row = Vec::with_capacity(columns.len());
            for (value, column) in raw.into_iter().zip(&columns) {
                row.push(self.sql_to_datum(value, column.type_id)?);
            }
            rows.push(row);
        }
        Ok(QueryResult::Rows(RowSet { columns, rows }))
    }

    /// Binds `$N`/`?N` placeholders by number and bare `?` by position.
    fn bind(&self, stmt: &mut Statement<'_>, params: &[Datum]) -> HostResult<()> {
        for idx in 1..=stmt.parameter_count() {
            let slot = stmt
                .parameter_name(idx)
                .and_then(|name| name.get(1..))
                .and_then(|digits| digits.parse::<usize>().ok())
                .unwrap_or(idx);
            let value = slot
                .checked_sub(1)
                .and_then(|pos| params.get(pos))
                .ok_or_else(|| HostError::new(format!("there is no parameter ${slot}")))?;
            stmt.raw_bind_parameter(idx, self.datum_to_sql(value)?)?;
        }
        Ok(())
    }

    fn datum_to_sql(&self, value: &Datum) -> HostResult<SqlValue> {
        Ok(match value {
            Datum::Null => SqlValue::Null,
            Datum::Bool(v) => SqlValue::Integer(*v as i64),
            Datum::Int2(v) => SqlValue::Integer(*v as i64),
            Datum::Int4(v) => SqlValue::Integer(*v as i64),
            Datum::Int8(v) => SqlValue::Integer(*v),
            Datum::Oid(v) => SqlValue::Integer(*v as i64),
            Datum::Float4(v) => SqlValue::Real(*v as f64),
            Datum::Float8(v) => SqlValue::Real(*v),
            Datum::Numeric(text) => match text.parse::<f64>() {
                Ok(v) => SqlValue::Real(v),
                Err(_) => SqlValue::Text(text.clone()),
            },
            Datum::Text(text) | Datum::Json(text) => SqlValue::Text(text.clone()),
            Datum::Bytea(bytes) => SqlValue::Blob(bytes.clone()),
            Datum::Date(days) => SqlValue::Text(
                datum::format_date(*days)
                    .ok_or_else(|| HostError::new("date out of range"))?,
            ),
            Datum::Timestamp(micros) => SqlValue::Text(
                datum::format_timestamp(*micros)
                    .ok_or_else(|| HostError::new("timestamp out of range"))?,
            ),
            Datum::Array(array) => {
                let array_type = self
                    .type_info(array.element_type)
                    .ok()
                    .and_then(|info| info.array_type)
                    .unwrap_or(types::TEXT_ARRAY);
                let script = Marshaler::new(self)
                    .to_script(value, array_type)
                    .map_err(|err| HostError::new(err.to_string()))?;
                SqlValue::Text(plume_rt::json::encode(&script_to_json(&script)))
            }
            Datum::Row(row) => {
                let script = Marshaler::new(self)
                    .to_script(value, row.type_id)
                    .map_err(|err| HostError::new(err.to_string()))?;
                SqlValue::Text(plume_rt::json::encode(&script_to_json(&script)))
            }
        })
    }

    fn sql_to_datum(&self, value: SqlValue, type_id: Oid) -> HostResult<Datum> {
        let invalid = |value: &SqlValue| {
            HostError::with_sqlstate(
                format!("cannot read {value:?} as type {type_id}"),
                "22P02",
            )
        };
        if matches!(value, SqlValue::Null) {
            return Ok(Datum::Null);
        }
        Ok(match type_id {
            types::BOOL => match &value {
                SqlValue::Integer(v) => Datum::Bool(*v != 0),
                SqlValue::Text(text) => match text.to_ascii_lowercase().as_str() {
                    "t" | "true" | "1" | "yes" | "on" => Datum::Bool(true),
                    "f" | "false" | "0" | "no" | "off" => Datum::Bool(false),
                    _ => return Err(invalid(&value)),
                },
                _ => return Err(invalid(&value)),
            },
            types::INT2 => Datum::Int2(
                i16::try_from(integer_of(&value).ok_or_else(|| invalid(&value))?)
                    .map_err(|_| HostError::with_sqlstate("smallint out of range", "22003"))?,
            ),
            types::INT4 => Datum::Int4(
                i32::try_from(integer_of(&value).ok_or_else(|| invalid(&value))?)
                    .map_err(|_| HostError::with_sqlstate("integer out of range", "22003"))?,
            ),
            types::OID => Datum::Oid(
                u32::try_from(integer_of(&value).ok_or_else(|| invalid(&value))?)
                    .map_err(|_| HostError::with_sqlstate("OID out of range", "22003"))?,
            ),
            types::INT8 => Datum::Int8(integer_of(&value).ok_or_else(|| invalid(&value))?),
            types::FLOAT4 => Datum::Float4(float_of(&value).ok_or_else(|| invalid(&value))? as f32),
            types::FLOAT8 => Datum::Float8(float_of(&value).ok_or_else(|| invalid(&value))?),
            types::NUMERIC => Datum::Numeric(match &value {
                SqlValue::Integer(v) => v.to_string(),
                SqlValue::Real(v) => crate::marshal::format_number(*v),
                SqlValue::Text(text) => text.clone(),
                _ => return Err(invalid(&value)),
            }),
            types::BYTEA => match value {
                SqlValue::Blob(bytes) => Datum::Bytea(bytes),
                SqlValue::Text(text) => Datum::Bytea(text.into_bytes()),
                other => return Err(invalid(&other)),
            },
            types::JSON | types::JSONB => Datum::Json(text_of(value)),
            types::DATE => {
                let text = text_of(value);
                datum::parse_date(&text).map(Datum::Date).ok_or_else(|| {
                    HostError::with_sqlstate(format!("invalid date \"{text}\""), "22007")
                })?
            }
            types::TIMESTAMP | types::TIMESTAMPTZ => {
                let text = text_of(value);
                datum::parse_timestamp(&text)
                    .map(Datum::Timestamp)
                    .ok_or_else(|| {
                        HostError::with_sqlstate(format!("invalid timestamp \"{text}\""), "22007")
                    })?
            }
            _ => match self.type_info(type_id) {
                Ok(info) if info.category != TypeCategory::Scalar => {
                    let text = text_of(value);
                    let json = plume_rt::json::parse(&text).map_err(HostError::new)?;
                    Marshaler::new(self)
                        .from_script(&json_to_script(&json), type_id)
                        .map_err(|err| HostError::new(err.to_string()))?
                }
                _ => Datum::Text(text_of(value)),
            },
        })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn join_oids(oids: &[Oid]) -> String {
    oids.iter()
        .map(|oid| oid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn split_list(raw: &str) -> Vec<&str> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(',').collect()
    }
}

fn integer_of(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Integer(v) => Some(*v),
        SqlValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
        SqlValue::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn float_of(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(v) => Some(*v as f64),
        SqlValue::Real(v) => Some(*v),
        SqlValue::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(value: SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => crate::marshal::format_number(v),
        SqlValue::Text(text) => text,
        SqlValue::Blob(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

fn infer_column_type(rows: &[Vec<SqlValue>], idx: usize) -> Oid {
    let sample = rows
        .iter()
        .filter_map(|row| row.get(idx))
        .find(|value| !matches!(value, SqlValue::Null));
    match sample {
        Some(SqlValue::Integer(_)) => types::INT8,
        Some(SqlValue::Real(_)) => types::FLOAT8,
        Some(SqlValue::Blob(_)) => types::BYTEA,
        _ => types::TEXT,
    }
}

/// Maps a declared SQLite column type to a type id.
pub fn decltype_oid(decl: &str) -> Option<Oid> {
    let lowered = decl.trim().to_ascii_lowercase();
    if let Some(element) = lowered.strip_suffix("[]") {
        return decltype_oid(element).and_then(types::array_type_of);
    }
    let (base, _) = types::split_type_name(&lowered);
    match base.as_str() {
        "integer" | "int" | "int4" | "mediumint" => Some(types::INT4),
        "real" | "double" | "double precision" | "float" => Some(types::FLOAT8),
        "blob" => Some(types::BYTEA),
        "clob" => Some(types::TEXT),
        "datetime" => Some(types::TIMESTAMP),
        _ => types::builtin_type_by_name(&base),
    }
}

impl Catalog for SqliteHost {
    fn current_role(&self) -> Oid {
        self.role
    }

    fn routine(&self, oid: Oid) -> HostResult<RoutineMetadata> {
        let row = self
            .conn
            .query_row(
                "SELECT name, source, language, kind, returns_set, arg_types, arg_modes, \
                 arg_names, return_type, owner FROM plume_routines WHERE oid = ?1",
                params![oid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Oid>(8)?,
                        row.get::<_, Oid>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((name, source, language, kind, returns_set, arg_types, modes, names, ret, owner)) =
            row
        else {
            return Err(HostError::new(format!("cache lookup failed for function {oid}")));
        };
        let arg_types = split_list(&arg_types)
            .into_iter()
            .map(|raw| {
                raw.parse::<Oid>()
                    .map_err(|_| HostError::new(format!("corrupt argument type list for {name}")))
            })
            .collect::<HostResult<Vec<_>>>()?;
        let arg_modes = modes
            .chars()
            .map(|code| ArgMode::parse(&code.to_string()).unwrap_or(ArgMode::In))
            .collect();
        let arg_names = if arg_types.is_empty() {
            Vec::new()
        } else {
            names
                .split(',')
                .map(|name| (!name.is_empty()).then(|| name.to_string()))
                .collect()
        };
        Ok(RoutineMetadata {
            oid,
            kind: RoutineKind::parse(&kind).unwrap_or(RoutineKind::Function),
            name,
            source,
            language,
            returns_set,
            arg_types,
            arg_modes,
            arg_names,
            return_type: ret,
            owner,
        })
    }

    fn lookup_routine(&self, signature: &str) -> HostResult<Oid> {
        let signature = signature.trim();
        let (name, wanted) = match signature.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.trim_end().strip_suffix(')').ok_or_else(|| {
                    HostError::new(format!("invalid function signature \"{signature}\""))
                })?;
                let mut wanted = Vec::new();
                for type_name in inner.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    wanted.push(self.type_by_name(type_name)?);
                }
                (name.trim(), Some(wanted))
            }
            None => (signature, None),
        };
        let candidates: Vec<RoutineMetadata> = self
            .routines_named(name)?
            .into_iter()
            .filter(|meta| match &wanted {
                Some(wanted) => {
                    let inputs: Vec<Oid> =
                        meta.input_args().iter().map(|(_, type_id)| *type_id).collect();
                    &inputs == wanted
                }
                None => true,
            })
            .collect();
        match candidates.as_slice() {
            [only] => Ok(only.oid),
            [] => Err(HostError::with_sqlstate(
                format!("function {signature} does not exist"),
                "42883",
            )),
            _ => Err(HostError::with_sqlstate(
                format!("function name \"{name}\" is not unique"),
                "42725",
            )),
        }
    }

    fn has_execute_privilege(&self, role: Oid, routine: Oid) -> HostResult<bool> {
        if role == SUPERUSER {
            return Ok(true);
        }
        let owner: Option<Oid> = self
            .conn
            .query_row(
                "SELECT owner FROM plume_routines WHERE oid = ?1",
                params![routine],
                |row| row.get(0),
            )
            .optional()?;
        if owner == Some(role) {
            return Ok(true);
        }
        let granted: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM plume_grants WHERE routine = ?1 AND role IN (?2, ?3)",
            params![routine, role, PUBLIC],
            |row| row.get(0),
        )?;
        Ok(granted > 0)
    }

    fn type_info(&self, type_id: Oid) -> HostResult<TypeInfo> {
        if let Some(info) = types::builtin_type(type_id) {
            return Ok(info);
        }
        let Some((oid, name, array_oid)) = self.composite_by_oid(type_id)? else {
            return Err(HostError::new(format!("cache lookup failed for type {type_id}")));
        };
        if type_id == array_oid {
            return Ok(TypeInfo {
                oid: array_oid,
                name: format!("_{name}"),
                category: TypeCategory::Array,
                element: Some(oid),
                array_type: None,
                len: -1,
                by_value: false,
                align: 'd',
            });
        }
        Ok(TypeInfo {
            oid,
            name,
            category: TypeCategory::Composite,
            element: None,
            array_type: Some(array_oid),
            len: -1,
            by_value: false,
            align: 'd',
        })
    }

    fn type_by_name(&self, name: &str) -> HostResult<Oid> {
        if let Some(oid) = types::builtin_type_by_name(name) {
            return Ok(oid);
        }
        let (base, depth) = types::split_type_name(name);
        let found: Option<(Oid, Oid)> = self
            .conn
            .query_row(
                "SELECT oid, array_oid FROM plume_types WHERE name = ?1",
                params![base],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match (found, depth) {
            (Some((oid, _)), 0) => Ok(oid),
            (Some((_, array_oid)), _) => Ok(array_oid),
            (None, _) => Err(HostError::with_sqlstate(
                format!("type \"{name}\" does not exist"),
                "42704",
            )),
        }
    }

    fn row_descriptor(&self, type_id: Oid) -> HostResult<RowDescriptor> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type_id, dropped FROM plume_type_attributes \
             WHERE type_oid = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map(params![type_id], |row| {
            Ok(Attribute {
                name: row.get(0)?,
                type_id: row.get(1)?,
                dropped: row.get(2)?,
            })
        })?;
        let attributes = rows.collect::<Result<Vec<_>, _>>()?;
        if attributes.is_empty() {
            return Err(HostError::new(format!("type {type_id} is not composite")));
        }
        Ok(RowDescriptor::new(type_id, attributes))
    }

    fn module_source(&self, path: &str) -> HostResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT source FROM plume_modules WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl Executor for SqliteHost {
    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn describe_params(&mut self, query: &str) -> HostResult<Vec<Oid>> {
        let stmt = self.conn.prepare(query)?;
        Ok(vec![types::UNKNOWN; stmt.parameter_count()])
    }

    fn execute(&mut self, query: &str, params: &[Datum]) -> HostResult<QueryResult> {
        self.run(query, params)
    }

    fn prepare(&mut self, query: &str, param_types: &[Oid]) -> HostResult<PlanId> {
        let expected = self.conn.prepare(query)?.parameter_count();
        if !param_types.is_empty() && param_types.len() != expected {
            return Err(HostError::new(format!(
                "query has {expected} parameters but {} types were given",
                param_types.len()
            )));
        }
        let id = self.next_plan;
        self.next_plan += 1;
        self.plans.insert(
            id,
            Plan {
                sql: query.to_string(),
            },
        );
        Ok(id)
    }

    fn execute_plan(&mut self, plan: PlanId, params: &[Datum]) -> HostResult<QueryResult> {
        let sql = self
            .plans
            .get(&plan)
            .map(|plan| plan.sql.clone())
            .ok_or_else(|| HostError::new(format!("plan {plan} does not exist")))?;
        self.run(&sql, params)
    }

    fn free_plan(&mut self, plan: PlanId) -> HostResult<()> {
        self.plans
            .remove(&plan)
            .map(|_| ())
            .ok_or_else(|| HostError::new(format!("plan {plan} does not exist")))
    }

    fn open_cursor(&mut self, plan: PlanId, params: &[Datum]) -> HostResult<String> {
        let set = match self.execute_plan(plan, params)? {
            QueryResult::Rows(set) => set,
            QueryResult::Affected(_) => {
                return Err(HostError::new("cannot open a cursor on a statement without rows"));
            }
        };
        let name = format!("plume_cursor_{}", self.next_cursor);
        self.next_cursor += 1;
        self.cursors
            .insert(name.clone(), Cursor { set, position: 0 });
        Ok(name)
    }

    fn fetch(&mut self, portal: &str, direction: FetchDirection, count: u64) -> HostResult<RowSet> {
        let cursor = self
            .cursors
            .get_mut(portal)
            .ok_or_else(|| HostError::new(format!("cursor \"{portal}\" does not exist")))?;
        let mut picked = Vec::new();
        cursor.step(direction, count, |idx| picked.push(idx));
        Ok(RowSet {
            columns: cursor.set.columns.clone(),
            rows: picked
                .into_iter()
                .map(|idx| cursor.set.rows[idx].clone())
                .collect(),
        })
    }

    fn move_cursor(&mut self, portal: &str, direction: FetchDirection, count: u64) -> HostResult<u64> {
        let cursor = self
            .cursors
            .get_mut(portal)
            .ok_or_else(|| HostError::new(format!("cursor \"{portal}\" does not exist")))?;
        Ok(cursor.step(direction, count, |_| {}))
    }

    fn close_cursor(&mut self, portal: &str) -> HostResult<()> {
        self.cursors
            .remove(portal)
            .map(|_| ())
            .ok_or_else(|| HostError::new(format!("cursor \"{portal}\" does not exist")))
    }

    fn begin_subtransaction(&mut self) -> HostResult<SubtransactionId> {
        let id = self.next_savepoint;
        self.next_savepoint += 1;
        self.conn.execute_batch(&format!("SAVEPOINT sp_{id}"))?;
        self.savepoints.push(id);
        Ok(id)
    }

    fn release_subtransaction(&mut self, id: SubtransactionId) -> HostResult<()> {
        if self.savepoints.last() != Some(&id) {
            return Err(HostError::new(format!("savepoint sp_{id} is not the innermost one")));
        }
        self.conn.execute_batch(&format!("RELEASE SAVEPOINT sp_{id}"))?;
        self.savepoints.pop();
        Ok(())
    }

    fn rollback_subtransaction(&mut self, id: SubtransactionId) -> HostResult<()> {
        if self.savepoints.last() != Some(&id) {
            return Err(HostError::new(format!("savepoint sp_{id} is not the innermost one")));
        }
        self.conn.execute_batch(&format!(
            "ROLLBACK TO SAVEPOINT sp_{id}; RELEASE SAVEPOINT sp_{id}"
        ))?;
        self.savepoints.pop();
        Ok(())
    }

    fn commit(&mut self) -> HostResult<()> {
        self.conn.execute_batch("COMMIT; BEGIN")?;
        self.savepoints.clear();
        self.cursors.clear();
        Ok(())
    }

    fn rollback(&mut self) -> HostResult<()> {
        self.conn.execute_batch("ROLLBACK; BEGIN")?;
        self.savepoints.clear();
        self.cursors.clear();
        Ok(())
    }

    fn emit_log(&mut self, level: LogLevel, message: &str) -> HostResult<()> {
        match level {
            LogLevel::Error => {
                return Err(HostError::with_sqlstate(message, "P0001"));
            }
            LogLevel::Warning => log::warn!(target: "plume::notice", "{message}"),
            LogLevel::Notice | LogLevel::Info | LogLevel::Log => {
                log::info!(target: "plume::notice", "{message}")
            }
            _ => log::debug!(target: "plume::notice", "{}: {message}", level.name()),
        }
        self.notices.push(Notice {
            level,
            message: message.to_string(),
        });
        Ok(())
    }
}
