//! Lua state ownership, value conversion and protected calls.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, LightUserData, Lua, LuaOptions, MetaMethod, MultiValue, StdLib, Table,
    UserData, UserDataMethods, Value,
};

use crate::api;
use crate::bridge::Session;
use crate::cache::{RoutineCache, RoutineKey};
use crate::compiler;
use crate::config::RuntimeConfig;
use crate::datum::{self, Oid};
use crate::error::{PlumeError, Result};
use crate::host::RoutineMetadata;
use crate::interrupt::InterruptHandle;
use crate::marshal::{format_number, script_to_json};
use crate::value::{BufferKind, MAX_SAFE_INTEGER, ScriptValue, TypedBuffer};

pub const ARRAY_TAG: &str = "array";
pub const OBJECT_TAG: &str = "object";
const TAG_FIELD: &str = "__plume";
pub(crate) const ARRAY_META: &str = "plume.array_meta";
pub(crate) const OBJECT_META: &str = "plume.object_meta";
const MAX_DEPTH: usize = 64;
const HOOK_INTERVAL: u32 = 1000;

/// Why the instruction hook stopped the running call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cancellation {
    Interrupted,
    Timeout,
}

impl Cancellation {
    fn error(self) -> PlumeError {
        match self {
            Self::Interrupted => PlumeError::Interrupted,
            Self::Timeout => PlumeError::Timeout,
        }
    }
}

/// One isolated Lua state bound to a single role.
pub struct ScriptContext {
    lua: Lua,
    role: Oid,
    routines: Rc<RefCell<RoutineCache>>,
    deadline: Rc<Cell<Option<Instant>>>,
    cancelled: Rc<Cell<Option<Cancellation>>>,
}

impl ScriptContext {
    pub(crate) fn new(
        role: Oid,
        config: &RuntimeConfig,
        session: Rc<Session>,
        interrupt: InterruptHandle,
    ) -> Result<Self> {
        let libs =
            StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH | StdLib::COROUTINE;
        let lua = Lua::new_with(libs, LuaOptions::new()).map_err(convert_error)?;
        lua.set_memory_limit(config.memory_limit_bytes())
            .map_err(convert_error)?;

        let deadline = Rc::new(Cell::new(None::<Instant>));
        let cancelled = Rc::new(Cell::new(None::<Cancellation>));
        let hook_deadline = Rc::clone(&deadline);
        let hook_cancelled = Rc::clone(&cancelled);
        // Once tripped, every later tick raises again so `pcall` cannot swallow it.
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
            move |_lua, _debug| {
                let tripped = hook_cancelled.get().or_else(|| {
                    if interrupt.is_raised() {
                        Some(Cancellation::Interrupted)
                    } else if hook_deadline.get().is_some_and(|at| Instant::now() >= at) {
                        Some(Cancellation::Timeout)
                    } else {
                        None
                    }
                });
                match tripped {
                    Some(cause) => {
                        hook_cancelled.set(Some(cause));
                        Err(mlua::Error::external(cause.error()))
                    }
                    None => Ok(()),
                }
            },
        );

        install_metatables(&lua).map_err(convert_error)?;
        let routines = Rc::new(RefCell::new(RoutineCache::default()));
        api::install(&lua, session, Rc::clone(&routines)).map_err(convert_error)?;
        log::debug!("created script context for role {role}");
        Ok(Self {
            lua,
            role,
            routines,
            deadline,
            cancelled,
        })
    }

    pub fn role(&self) -> Oid {
        self.role
    }

    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    pub fn routines(&self) -> Ref<'_, RoutineCache> {
        self.routines.borrow()
    }

    pub(crate) fn routine_function(
        &self,
        key: RoutineKey,
        meta: &RoutineMetadata,
    ) -> Result<Function<'_>> {
        self.routines.borrow_mut().function(&self.lua, key, meta)
    }

    pub(crate) fn inline_function(&self, source: &str) -> Result<Function<'_>> {
        compiler::compile_inline(&self.lua, source)
    }

    /// Runs `function` and converts whatever it returns.
    pub(crate) fn call(&self, function: &Function, args: &[ScriptValue]) -> Result<ScriptValue> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(to_lua(&self.lua, arg).map_err(convert_error)?);
        }
        let returned = function.call::<_, Value>(MultiValue::from_vec(values));
        if let Some(cause) = self.cancelled.get() {
            return Err(cause.error());
        }
        from_lua(&returned.map_err(convert_error)?)
    }

    /// Starts the clock for a new top-level call and forgets any earlier cancellation.
    pub(crate) fn arm_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.cancelled.set(None);
        self.deadline.replace(Instant::now().checked_add(timeout))
    }

    pub(crate) fn restore_deadline(&self, previous: Option<Instant>) {
        self.deadline.set(previous);
    }

    pub(crate) fn collect_garbage(&self) {
        self.lua.expire_registry_values();
    }
}

impl Drop for ScriptContext {
    fn drop(&mut self) {
        log::debug!(
            "releasing script context for role {} ({} bytes in use)",
            self.role,
            self.lua.used_memory()
        );
    }
}

fn install_metatables(lua: &Lua) -> mlua::Result<()> {
    for (name, tag) in [(ARRAY_META, ARRAY_TAG), (OBJECT_META, OBJECT_TAG)] {
        let meta = lua.create_table()?;
        meta.raw_set(TAG_FIELD, tag)?;
        lua.set_named_registry_value(name, meta)?;
    }
    Ok(())
}

pub(crate) fn tag_table(lua: &Lua, table: &Table, meta_name: &str) -> mlua::Result<()> {
    let meta: Table = lua.named_registry_value(meta_name)?;
    table.set_metatable(Some(meta));
    Ok(())
}

/// The value scripts see as the global `null`.
pub(crate) fn null_value<'lua>() -> Value<'lua> {
    Value::LightUserData(LightUserData(std::ptr::null_mut()))
}

pub(crate) fn to_lua<'lua>(lua: &'lua Lua, value: &ScriptValue) -> mlua::Result<Value<'lua>> {
    Ok(match value {
        ScriptValue::Undefined => Value::Nil,
        ScriptValue::Null => null_value(),
        ScriptValue::Bool(v) => Value::Boolean(*v),
        ScriptValue::Number(v) if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER => {
            Value::Integer(*v as i64)
        }
        ScriptValue::Number(v) => Value::Number(*v),
        ScriptValue::BigInt(v) => Value::UserData(lua.create_userdata(LuaInt8(*v))?),
        ScriptValue::String(text) => Value::String(lua.create_string(text)?),
        ScriptValue::Bytes(bytes) => Value::String(lua.create_string(bytes)?),
        ScriptValue::Buffer(buffer) => {
            Value::UserData(lua.create_userdata(LuaBuffer(buffer.clone()))?)
        }
        ScriptValue::Date(ms) => Value::UserData(lua.create_userdata(LuaDate(*ms))?),
        ScriptValue::Array(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.raw_set(idx + 1, to_lua(lua, item)?)?;
            }
            tag_table(lua, &table, ARRAY_META)?;
            Value::Table(table)
        }
        ScriptValue::Object(pairs) => {
            let table = lua.create_table()?;
            for (key, item) in pairs {
                if matches!(item, ScriptValue::Undefined) {
                    continue;
                }
                table.raw_set(key.as_str(), to_lua(lua, item)?)?;
            }
            tag_table(lua, &table, OBJECT_META)?;
            Value::Table(table)
        }
    })
}

pub(crate) fn from_lua(value: &Value) -> Result<ScriptValue> {
    convert_value(value, 0)
}

fn convert_value(value: &Value, depth: usize) -> Result<ScriptValue> {
    if depth > MAX_DEPTH {
        return Err(PlumeError::Conversion(format!(
            "value nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    Ok(match value {
        Value::Nil => ScriptValue::Undefined,
        Value::Boolean(v) => ScriptValue::Bool(*v),
        Value::LightUserData(ptr) if ptr.0.is_null() => ScriptValue::Null,
        Value::Integer(v) if (v.unsigned_abs() as f64) <= MAX_SAFE_INTEGER => {
            ScriptValue::Number(*v as f64)
        }
        Value::Integer(v) => ScriptValue::BigInt(*v),
        Value::Number(v) => ScriptValue::Number(*v),
        Value::String(text) => {
            let bytes = text.as_bytes();
            match std::str::from_utf8(bytes) {
                Ok(text) => ScriptValue::String(text.to_string()),
                Err(_) => ScriptValue::Bytes(bytes.to_vec()),
            }
        }
        Value::Table(table) => table_value(table, depth)?,
        Value::UserData(data) => {
            if let Ok(date) = data.borrow::<LuaDate>() {
                ScriptValue::Date(date.0)
            } else if let Ok(buffer) = data.borrow::<LuaBuffer>() {
                ScriptValue::Buffer(buffer.0.clone())
            } else if let Ok(int) = data.borrow::<LuaInt8>() {
                ScriptValue::BigInt(int.0)
            } else {
                return Err(PlumeError::Conversion(
                    "cannot convert userdata to a value".to_string(),
                ));
            }
        }
        other => {
            return Err(PlumeError::Conversion(format!(
                "cannot convert {} to a value",
                other.type_name()
            )));
        }
    })
}

fn table_tag(table: &Table) -> Result<Option<String>> {
    let Some(meta) = table.get_metatable() else {
        return Ok(None);
    };
    meta.raw_get::<_, Option<String>>(TAG_FIELD)
        .map_err(convert_error)
}

/// Tagged tables keep their shape; untagged ones are arrays when keyed `1..n`.
fn table_value(table: &Table, depth: usize) -> Result<ScriptValue> {
    let len = table.raw_len();
    match table_tag(table)?.as_deref() {
        Some(ARRAY_TAG) => return array_items(table, len, depth),
        Some(OBJECT_TAG) => return object_pairs(table, depth),
        _ => {}
    }
    let count = table.clone().pairs::<Value, Value>().count();
    if len > 0 && count == len {
        array_items(table, len, depth)
    } else {
        object_pairs(table, depth)
    }
}

fn array_items(table: &Table, len: usize, depth: usize) -> Result<ScriptValue> {
    let mut items = Vec::with_capacity(len);
    for idx in 1..=len {
        let item: Value = table.raw_get(idx).map_err(convert_error)?;
        items.push(convert_value(&item, depth + 1)?);
    }
    Ok(ScriptValue::Array(items))
}

fn object_pairs(table: &Table, depth: usize) -> Result<ScriptValue> {
    let mut pairs = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, item) = pair.map_err(convert_error)?;
        if matches!(item, Value::Function(_)) {
            continue;
        }
        let key = match key {
            Value::String(text) => text.to_string_lossy().into_owned(),
            Value::Integer(v) => v.to_string(),
            Value::Number(v) => format_number(v),
            other => {
                return Err(PlumeError::Conversion(format!(
                    "object keys must be strings, got {}",
                    other.type_name()
                )));
            }
        };
        pairs.push((key, convert_value(&item, depth + 1)?));
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(ScriptValue::Object(pairs))
}

/// Text used when a value is written to a log message.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::LightUserData(ptr) if ptr.0.is_null() => "null".to_string(),
        Value::Boolean(v) => v.to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Number(v) => format_number(*v),
        Value::String(text) => text.to_string_lossy().into_owned(),
        Value::Table(_) | Value::UserData(_) => match from_lua(value) {
            Ok(ScriptValue::Date(ms)) => iso_string(ms),
            Ok(converted) => plume_rt::json::encode(&script_to_json(&converted)),
            Err(_) => value.type_name().to_string(),
        },
        other => other.type_name().to_string(),
    }
}

fn iso_string(ms: f64) -> String {
    datum::unix_millis_to_timestamp(ms)
        .and_then(datum::format_timestamp)
        .unwrap_or_else(|| "Invalid Date".to_string())
}

/// Maps a Lua failure back to the error that caused it.
pub(crate) fn convert_error(err: mlua::Error) -> PlumeError {
    let mut current = &err;
    let mut traceback = None;
    while let mlua::Error::CallbackError {
        traceback: trace,
        cause,
    } = current
    {
        if traceback.is_none() {
            traceback = Some(trace.clone());
        }
        current = cause.as_ref();
    }
    match current {
        mlua::Error::ExternalError(inner) => match inner.downcast_ref::<PlumeError>() {
            Some(plume) => plume.clone(),
            None => PlumeError::Execution {
                message: inner.to_string(),
                stack: traceback,
            },
        },
        mlua::Error::MemoryError(_) => PlumeError::OutOfMemory,
        mlua::Error::RuntimeError(message) => match message.split_once("\nstack traceback:") {
            Some((head, rest)) => PlumeError::Execution {
                message: head.to_string(),
                stack: Some(format!("stack traceback:{rest}")),
            },
            None => PlumeError::Execution {
                message: message.clone(),
                stack: traceback,
            },
        },
        other => PlumeError::Execution {
            message: other.to_string(),
            stack: traceback,
        },
    }
}

/// Raises `err` inside the guest.
pub(crate) fn external(err: PlumeError) -> mlua::Error {
    mlua::Error::external(err)
}

/// Instant in time, exposed to scripts as `plume.date`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LuaDate(pub f64);

impl UserData for LuaDate {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("time", |_, this, ()| Ok(this.0));
        methods.add_method("iso", |_, this, ()| Ok(iso_string(this.0)));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(iso_string(this.0)));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: mlua::AnyUserData| {
            Ok(other.borrow::<LuaDate>()?.0 == this.0)
        });
        methods.add_meta_method(MetaMethod::Lt, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 < other.borrow::<LuaDate>()?.0)
        });
        methods.add_meta_method(MetaMethod::Le, |_, this, other: mlua::AnyUserData| {
            Ok(this.0 <= other.borrow::<LuaDate>()?.0)
        });
    }
}

/// A 64-bit integer from an `int8` value. Integer arithmetic on it is checked.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LuaInt8(pub i64);

#[derive(Clone, Copy)]
enum Operand {
    Int(i64),
    Float(f64),
}

impl Operand {
    fn of(value: &Value) -> mlua::Result<Self> {
        match value {
            Value::Integer(v) => Ok(Self::Int(*v)),
            Value::Number(v) => Ok(Self::Float(*v)),
            Value::UserData(data) => match data.borrow::<LuaInt8>() {
                Ok(int) => Ok(Self::Int(int.0)),
                Err(_) => Err(arithmetic_error(value)),
            },
            other => Err(arithmetic_error(other)),
        }
    }

    fn float(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

fn arithmetic_error(value: &Value) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "attempt to perform arithmetic on a {} value",
        value.type_name()
    ))
}

fn bigint_overflow() -> mlua::Error {
    external(PlumeError::Conversion("bigint out of range".to_string()))
}

fn int8_value(lua: &Lua, v: i64) -> mlua::Result<Value<'_>> {
    Ok(Value::UserData(lua.create_userdata(LuaInt8(v))?))
}

fn arithmetic<'lua>(
    lua: &'lua Lua,
    lhs: &Value<'lua>,
    rhs: &Value<'lua>,
    int: impl Fn(i64, i64) -> mlua::Result<i64>,
    float: impl Fn(f64, f64) -> f64,
) -> mlua::Result<Value<'lua>> {
    match (Operand::of(lhs)?, Operand::of(rhs)?) {
        (Operand::Int(a), Operand::Int(b)) => int8_value(lua, int(a, b)?),
        (a, b) => Ok(Value::Number(float(a.float(), b.float()))),
    }
}

fn floor_div(a: i64, b: i64) -> mlua::Result<i64> {
    if b == 0 {
        return Err(mlua::Error::RuntimeError("attempt to perform 'n//0'".to_string()));
    }
    let quotient = a.checked_div(b).ok_or_else(bigint_overflow)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        quotient.checked_sub(1).ok_or_else(bigint_overflow)
    } else {
        Ok(quotient)
    }
}

fn floor_mod(a: i64, b: i64) -> mlua::Result<i64> {
    if b == 0 {
        return Err(mlua::Error::RuntimeError("attempt to perform 'n%%0'".to_string()));
    }
    let rem = a.wrapping_rem(b);
    Ok(if rem != 0 && (rem < 0) != (b < 0) { rem + b } else { rem })
}

fn float_mod(a: f64, b: f64) -> f64 {
    let rem = a % b;
    if rem != 0.0 && (rem < 0.0) != (b < 0.0) {
        rem + b
    } else {
        rem
    }
}

fn concat_piece(value: &Value) -> mlua::Result<String> {
    match value {
        Value::String(text) => Ok(text.to_string_lossy().into_owned()),
        Value::Integer(v) => Ok(v.to_string()),
        Value::Number(v) => Ok(format_number(*v)),
        Value::UserData(data) => match data.borrow::<LuaInt8>() {
            Ok(int) => Ok(int.0.to_string()),
            Err(_) => Err(concat_error(value)),
        },
        other => Err(concat_error(other)),
    }
}

fn concat_error(value: &Value) -> mlua::Error {
    mlua::Error::RuntimeError(format!(
        "attempt to concatenate a {} value",
        value.type_name()
    ))
}

fn compare(lhs: &Value, rhs: &Value) -> mlua::Result<std::cmp::Ordering> {
    let ordering = match (Operand::of(lhs)?, Operand::of(rhs)?) {
        (Operand::Int(a), Operand::Int(b)) => Some(a.cmp(&b)),
        (a, b) => a.float().partial_cmp(&b.float()),
    };
    ordering.ok_or_else(|| mlua::Error::RuntimeError("attempt to compare with NaN".to_string()))
}

impl UserData for LuaInt8 {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("toNumber", |_, this, ()| Ok(this.0 as f64));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
        methods.add_meta_method(MetaMethod::Unm, |lua, this, ()| {
            int8_value(lua, this.0.checked_neg().ok_or_else(bigint_overflow)?)
        });
        methods.add_meta_function(MetaMethod::Add, |lua, (a, b): (Value, Value)| {
            arithmetic(lua, &a, &b, |a, b| a.checked_add(b).ok_or_else(bigint_overflow), |a, b| a + b)
        });
        methods.add_meta_function(MetaMethod::Sub, |lua, (a, b): (Value, Value)| {
            arithmetic(lua, &a, &b, |a, b| a.checked_sub(b).ok_or_else(bigint_overflow), |a, b| a - b)
        });
        methods.add_meta_function(MetaMethod::Mul, |lua, (a, b): (Value, Value)| {
            arithmetic(lua, &a, &b, |a, b| a.checked_mul(b).ok_or_else(bigint_overflow), |a, b| a * b)
        });
        methods.add_meta_function(MetaMethod::IDiv, |lua, (a, b): (Value, Value)| {
            arithmetic(lua, &a, &b, floor_div, |a, b| (a / b).floor())
        });
        methods.add_meta_function(MetaMethod::Mod, |lua, (a, b): (Value, Value)| {
            arithmetic(lua, &a, &b, floor_mod, float_mod)
        });
        methods.add_meta_function(MetaMethod::Div, |_, (a, b): (Value, Value)| {
            Ok(Operand::of(&a)?.float() / Operand::of(&b)?.float())
        });
        methods.add_meta_function(MetaMethod::Pow, |_, (a, b): (Value, Value)| {
            Ok(Operand::of(&a)?.float().powf(Operand::of(&b)?.float()))
        });
        methods.add_meta_function(MetaMethod::Concat, |_, (a, b): (Value, Value)| {
            Ok(concat_piece(&a)? + &concat_piece(&b)?)
        });
        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (Value, Value)| {
            Ok(matches!(compare(&a, &b), Ok(std::cmp::Ordering::Equal)))
        });
        methods.add_meta_function(MetaMethod::Lt, |_, (a, b): (Value, Value)| {
            Ok(compare(&a, &b)?.is_lt())
        });
        methods.add_meta_function(MetaMethod::Le, |_, (a, b): (Value, Value)| {
            Ok(compare(&a, &b)?.is_le())
        });
    }
}

/// Typed binary buffer, exposed to scripts as `plume.buffer`.
#[derive(Clone, Debug)]
pub(crate) struct LuaBuffer(pub TypedBuffer);

impl LuaBuffer {
    pub(crate) fn new(kind: BufferKind, len: usize) -> Self {
        Self(TypedBuffer::zeroed(kind, len))
    }
}

impl UserData for LuaBuffer {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("get", |_, this, idx: usize| {
            Ok(idx.checked_sub(1).and_then(|idx| this.0.get(idx)))
        });
        methods.add_method_mut("set", |_, this, (idx, value): (usize, i64)| {
            let stored = idx.checked_sub(1).is_some_and(|idx| this.0.set(idx, value));
            if stored {
                Ok(())
            } else {
                Err(mlua::Error::RuntimeError(format!(
                    "buffer index {idx} is out of range"
                )))
            }
        });
        methods.add_method("bytes", |lua, this, ()| lua.create_string(&this.0.bytes));
        methods.add_method("kind", |_, this, ()| Ok(this.0.kind.as_str()));
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("[object {}Array]", buffer_label(this.0.kind)))
        });
    }
}

fn buffer_label(kind: BufferKind) -> &'static str {
    match kind {
        BufferKind::Uint8 => "Uint8",
        BufferKind::Int8 => "Int8",
        BufferKind::Uint16 => "Uint16",
        BufferKind::Int16 => "Int16",
        BufferKind::Uint32 => "Uint32",
        BufferKind::Int32 => "Int32",
    }
}
