//! The `plume` table every script context sees.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Function, Lua, MetaMethod, Table, UserData, UserDataMethods, Value, Variadic};

use crate::bridge::Session;
use crate::cache::{RoutineCache, RoutineKey};
use crate::datum;
use crate::engine::{
    self, ARRAY_META, LuaBuffer, LuaDate, OBJECT_META, external, from_lua, tag_table, to_lua,
};
use crate::error::PlumeError;
use crate::host::{LogLevel, PlanId};
use crate::marshal::{parse_json_text, script_to_json};
use crate::value::{BufferKind, ScriptValue};
use crate::window::WindowHandle;

const MODULES: &str = "plume.modules";

const SUBTRANSACTION_PRELUDE: &str = r#"
local begin, finish = ...
return function(fn)
  if type(fn) ~= "function" then
    error("subtransaction expects a function", 2)
  end
  local id = begin()
  local result = table.pack(pcall(fn))
  if result[1] then
    finish(id, true)
    return table.unpack(result, 2, result.n)
  end
  finish(id, false)
  error(result[2], 0)
end
"#;

pub(crate) fn install(
    lua: &Lua,
    session: Rc<Session>,
    routines: Rc<RefCell<RoutineCache>>,
) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set("null", engine::null_value())?;
    for level in LogLevel::ALL {
        globals.set(level.name(), level as i64)?;
    }
    lua.set_named_registry_value(MODULES, lua.create_table()?)?;

    let plume = lua.create_table()?;
    plume.set("version", env!("CARGO_PKG_VERSION"))?;

    let s = Rc::clone(&session);
    plume.set(
        "log",
        lua.create_function(move |_, (level, parts): (i64, Variadic<Value>)| {
            let message: Vec<String> = parts.iter().map(engine::display).collect();
            s.log(level, &message.join(" ")).map_err(external)
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "execute",
        lua.create_function(move |lua, (query, rest): (String, Variadic<Value>)| {
            let params = collect_params(&rest)?;
            let result = s.execute(&query, &params).map_err(external)?;
            to_lua(lua, &result)
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "prepare",
        lua.create_function(move |_, (query, type_names): (String, Option<Vec<String>>)| {
            let type_names = type_names.unwrap_or_default();
            let plan = s.prepare(&query, &type_names).map_err(external)?;
            Ok(PlanHandle {
                session: Rc::clone(&s),
                plan,
            })
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "commit",
        lua.create_function(move |_, ()| s.commit().map_err(external))?,
    )?;
    let s = Rc::clone(&session);
    plume.set(
        "rollback",
        lua.create_function(move |_, ()| s.rollback().map_err(external))?,
    )?;

    let s = Rc::clone(&session);
    let begin = lua.create_function(move |_, ()| s.begin_subtransaction().map_err(external))?;
    let s = Rc::clone(&session);
    let finish = lua.create_function(move |_, (id, commit): (u64, bool)| {
        s.finish_subtransaction(id, commit).map_err(external)
    })?;
    let subtransaction: Function = lua
        .load(SUBTRANSACTION_PRELUDE)
        .set_name("=plume.subtransaction")
        .call((begin, finish))?;
    plume.set("subtransaction", subtransaction)?;

    let s = Rc::clone(&session);
    plume.set(
        "findRoutine",
        lua.create_function(move |lua, signature: String| {
            let meta = s.find_routine(&signature).map_err(external)?;
            let key = RoutineKey::declared(&meta);
            routines
                .borrow_mut()
                .function(lua, key, &meta)
                .map_err(external)
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "publishRow",
        lua.create_function(move |_, value: Value| {
            let value = from_lua(&value).map_err(external)?;
            s.publish_row(&value).map_err(external)
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "getWindowFrame",
        lua.create_function(move |_, ()| {
            s.window_available().map_err(external)?;
            Ok(WindowHandle {
                session: Rc::clone(&s),
            })
        })?,
    )?;

    let s = Rc::clone(&session);
    plume.set(
        "loadModule",
        lua.create_function(move |lua, path: String| {
            let loaded: Table = lua.named_registry_value(MODULES)?;
            let cached: Value = loaded.raw_get(path.as_str())?;
            if !matches!(cached, Value::Nil) {
                return Ok(cached);
            }
            let source = s.module_source(&path).map_err(external)?;
            let name = format!("={path}");
            let value: Value = lua.load(source.as_str()).set_name(name.as_str()).eval()?;
            let value = match value {
                Value::Nil => Value::Boolean(true),
                other => other,
            };
            loaded.raw_set(path.as_str(), value.clone())?;
            log::debug!("loaded module {path}");
            Ok(value)
        })?,
    )?;

    plume.set("json", json_table(lua)?)?;

    plume.set(
        "date",
        lua.create_function(|_, value: Value| {
            let ms = match value {
                Value::Nil => chrono::Utc::now().timestamp_millis() as f64,
                Value::Integer(ms) => ms as f64,
                Value::Number(ms) => ms,
                Value::String(text) => {
                    let text = text.to_str()?;
                    datum::parse_timestamp(text)
                        .map(datum::timestamp_to_unix_millis)
                        .ok_or_else(|| {
                            external(PlumeError::Conversion(format!("invalid date \"{text}\"")))
                        })?
                }
                other => {
                    return Err(external(PlumeError::Conversion(format!(
                        "cannot build a date from {}",
                        other.type_name()
                    ))));
                }
            };
            Ok(LuaDate(ms))
        })?,
    )?;

    plume.set(
        "buffer",
        lua.create_function(|_, (kind, init): (String, Value)| {
            let kind = BufferKind::parse(&kind).ok_or_else(|| {
                external(PlumeError::ArgumentType(format!("unknown buffer kind {kind}")))
            })?;
            match init {
                Value::Integer(len) if len >= 0 => Ok(LuaBuffer::new(kind, len as usize)),
                Value::Table(items) => {
                    let items: Vec<i64> = items.sequence_values().collect::<mlua::Result<_>>()?;
                    let mut buffer = LuaBuffer::new(kind, items.len());
                    for (idx, item) in items.into_iter().enumerate() {
                        buffer.0.set(idx, item);
                    }
                    Ok(buffer)
                }
                other => Err(external(PlumeError::ArgumentType(format!(
                    "buffer size must be a non-negative integer or a list, got {}",
                    other.type_name()
                )))),
            }
        })?,
    )?;

    plume.set(
        "array",
        lua.create_function(|lua, table: Option<Table>| {
            let table = match table {
                Some(table) => table,
                None => lua.create_table()?,
            };
            tag_table(lua, &table, ARRAY_META)?;
            Ok(table)
        })?,
    )?;
    plume.set(
        "object",
        lua.create_function(|lua, table: Option<Table>| {
            let table = match table {
                Some(table) => table,
                None => lua.create_table()?,
            };
            tag_table(lua, &table, OBJECT_META)?;
            Ok(table)
        })?,
    )?;

    globals.set("plume", plume)?;
    Ok(())
}

fn json_table(lua: &Lua) -> mlua::Result<Table<'_>> {
    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|_, value: Value| {
            let value = from_lua(&value).map_err(external)?;
            Ok(plume_rt::json::encode(&script_to_json(&value)))
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value = parse_json_text(&text).map_err(external)?;
            to_lua(lua, &value)
        })?,
    )?;
    Ok(json)
}

/// Query parameters given either as varargs or as a single list.
fn collect_params(rest: &Variadic<Value>) -> mlua::Result<Vec<ScriptValue>> {
    if rest.len() == 1 {
        match from_lua(&rest[0]).map_err(external)? {
            ScriptValue::Array(items) => return Ok(items),
            ScriptValue::Object(pairs) if pairs.is_empty() => return Ok(Vec::new()),
            single => return Ok(vec![single]),
        }
    }
    rest.iter()
        .map(|value| from_lua(value).map_err(external))
        .collect()
}

struct PlanHandle {
    session: Rc<Session>,
    plan: PlanId,
}

impl UserData for PlanHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("execute", |lua, this, rest: Variadic<Value>| {
            let params = collect_params(&rest)?;
            let result = this
                .session
                .execute_plan(this.plan, &params)
                .map_err(external)?;
            to_lua(lua, &result)
        });
        methods.add_method("cursor", |_, this, rest: Variadic<Value>| {
            let params = collect_params(&rest)?;
            let portal = this
                .session
                .open_cursor(this.plan, &params)
                .map_err(external)?;
            Ok(CursorHandle {
                session: Rc::clone(&this.session),
                portal,
            })
        });
        methods.add_method("free", |_, this, ()| {
            this.session.free_plan(this.plan).map_err(external)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok("[object Plan]"));
    }
}

struct CursorHandle {
    session: Rc<Session>,
    portal: String,
}

impl UserData for CursorHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("fetch", |lua, this, count: Option<i64>| {
            let rows = this
                .session
                .fetch(&this.portal, count)
                .map_err(external)?;
            to_lua(lua, &rows)
        });
        methods.add_method("move", |_, this, count: i64| {
            this.session
                .move_cursor(&this.portal, count)
                .map_err(external)
        });
        methods.add_method("close", |_, this, ()| {
            this.session.close_cursor(&this.portal).map_err(external)
        });
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok("[object Cursor]"));
    }
}
