//! Script-facing view of the host window frame for the current row.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{UserData, UserDataFields, UserDataMethods};

use crate::bridge::Session;
use crate::datum::Oid;
use crate::engine::{external, to_lua};
use crate::error::{PlumeError, Result};
use crate::host::{PartitionLocal, SeekType, WindowArg, WindowFrame};
use crate::marshal::Marshaler;
use crate::value::ScriptValue;

/// Capacity of the partition-local slot when the first use names no size.
pub const DEFAULT_PARTITION_LOCAL_CAPACITY: usize = 1000;

/// The live frame of a window call and the declared types of its arguments.
pub(crate) struct WindowBinding {
    pub frame: Rc<RefCell<dyn WindowFrame>>,
    pub arg_types: Vec<Oid>,
}

#[derive(Copy, Clone)]
enum Scope {
    Partition,
    Frame,
}

impl Session {
    fn with_window<T>(&self, op: impl FnOnce(&WindowBinding) -> Result<T>) -> Result<T> {
        let active = self.active.borrow();
        let binding = active
            .as_ref()
            .and_then(|call| call.window.as_ref())
            .ok_or_else(|| {
                PlumeError::WindowContext("window functions can only be used in window calls".to_string())
            })?;
        op(binding)
    }

    pub(crate) fn window_available(&self) -> Result<()> {
        self.with_window(|_| Ok(()))
    }

    fn arg_type(binding: &WindowBinding, argno: i64) -> Result<(usize, Oid)> {
        usize::try_from(argno)
            .ok()
            .and_then(|idx| binding.arg_types.get(idx).map(|type_id| (idx, *type_id)))
            .ok_or_else(|| {
                PlumeError::ArgumentType(format!("window argument {argno} is out of range"))
            })
    }

    fn window_value(&self, arg: WindowArg, type_id: Oid) -> Result<ScriptValue> {
        match arg {
            WindowArg::OutOfRange => Ok(ScriptValue::Undefined),
            WindowArg::Value(datum) => {
                let host = self.host.borrow();
                Marshaler::new(&*host).to_script(&datum, type_id)
            }
        }
    }

    fn window_arg(
        &self,
        scope: Scope,
        argno: i64,
        relpos: i64,
        seek: i64,
        set_mark: bool,
    ) -> Result<ScriptValue> {
        let seek = SeekType::from_code(seek)
            .ok_or_else(|| PlumeError::ArgumentType(format!("invalid seek type {seek}")))?;
        let (arg, type_id) = self.with_window(|binding| {
            let (idx, type_id) = Self::arg_type(binding, argno)?;
            let mut frame = binding.frame.borrow_mut();
            let arg = match scope {
                Scope::Partition => frame.arg_in_partition(idx, relpos, seek, set_mark)?,
                Scope::Frame => frame.arg_in_frame(idx, relpos, seek, set_mark)?,
            };
            Ok((arg, type_id))
        })?;
        self.window_value(arg, type_id)
    }

    fn window_current_arg(&self, argno: i64) -> Result<ScriptValue> {
        let (datum, type_id) = self.with_window(|binding| {
            let (idx, type_id) = Self::arg_type(binding, argno)?;
            let datum = binding.frame.borrow().arg_current(idx)?;
            Ok((datum, type_id))
        })?;
        self.window_value(WindowArg::Value(datum), type_id)
    }
}

/// Reads the partition-local value, fixing the slot's capacity on first use.
pub fn read_partition_local(local: &mut PartitionLocal, size: Option<i64>) -> Result<ScriptValue> {
    let requested = match size {
        Some(n) if n < 0 => {
            return Err(PlumeError::ArgumentType(
                "allocation size cannot be negative".to_string(),
            ));
        }
        Some(0) | None => DEFAULT_PARTITION_LOCAL_CAPACITY,
        Some(n) => n as usize,
    };
    if local.capacity.is_none() {
        local.capacity = Some(requested);
    }
    match &local.payload {
        None => Ok(ScriptValue::Undefined),
        Some(bytes) => bincode::deserialize(bytes).map_err(|err| {
            PlumeError::Conversion(format!("corrupt partition-local value: {err}"))
        }),
    }
}

/// Stores `value`; an oversized value leaves the previous one in place.
pub fn write_partition_local(local: &mut PartitionLocal, value: &ScriptValue) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|err| {
        PlumeError::Conversion(format!("cannot store partition-local value: {err}"))
    })?;
    let capacity = *local
        .capacity
        .get_or_insert(DEFAULT_PARTITION_LOCAL_CAPACITY);
    if bytes.len() > capacity {
        return Err(PlumeError::WindowStorageOverflow {
            needed: bytes.len(),
            capacity,
        });
    }
    local.payload = Some(bytes);
    Ok(())
}

/// Handle returned by `plume.getWindowFrame()`.
pub(crate) struct WindowHandle {
    pub session: Rc<Session>,
}

impl WindowHandle {
    fn frame<T>(&self, op: impl FnOnce(&mut dyn WindowFrame) -> Result<T>) -> Result<T> {
        self.session
            .with_window(|binding| op(&mut *binding.frame.borrow_mut()))
    }
}

impl UserData for WindowHandle {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(fields: &mut F) {
        fields.add_field_method_get("SEEK_CURRENT", |_, _| Ok(0));
        fields.add_field_method_get("SEEK_HEAD", |_, _| Ok(1));
        fields.add_field_method_get("SEEK_TAIL", |_, _| Ok(2));
    }

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("getCurrentPosition", |_, this, ()| {
            this.frame(|frame| Ok(frame.current_position()))
                .map_err(external)
        });
        methods.add_method("getPartitionRowCount", |_, this, ()| {
            this.frame(|frame| Ok(frame.partition_row_count()))
                .map_err(external)
        });
        methods.add_method("setMarkPosition", |_, this, pos: i64| {
            this.frame(|frame| Ok(frame.set_mark_position(pos)?))
                .map_err(external)
        });
        methods.add_method("rowsArePeers", |_, this, (a, b): (i64, i64)| {
            this.frame(|frame| Ok(frame.rows_are_peers(a, b)?))
                .map_err(external)
        });
        methods.add_method(
            "getFuncArgInPartition",
            |lua, this, (argno, relpos, seek, set_mark): (i64, i64, i64, Option<bool>)| {
                let value = this
                    .session
                    .window_arg(Scope::Partition, argno, relpos, seek, set_mark.unwrap_or(false))
                    .map_err(external)?;
                to_lua(lua, &value)
            },
        );
        methods.add_method(
            "getFuncArgInFrame",
            |lua, this, (argno, relpos, seek, set_mark): (i64, i64, i64, Option<bool>)| {
                let value = this
                    .session
                    .window_arg(Scope::Frame, argno, relpos, seek, set_mark.unwrap_or(false))
                    .map_err(external)?;
                to_lua(lua, &value)
            },
        );
        methods.add_method("getFuncArgCurrent", |lua, this, argno: i64| {
            let value = this.session.window_current_arg(argno).map_err(external)?;
            to_lua(lua, &value)
        });
        methods.add_method("getPartitionLocal", |lua, this, size: Option<i64>| {
            let value = this
                .frame(|frame| read_partition_local(frame.partition_local(), size))
                .map_err(external)?;
            to_lua(lua, &value)
        });
        methods.add_method("setPartitionLocal", |_, this, value: mlua::Value| {
            let value = crate::engine::from_lua(&value).map_err(external)?;
            this.frame(|frame| write_partition_local(frame.partition_local(), &value))
                .map_err(external)
        });
        methods.add_meta_method(mlua::MetaMethod::ToString, |_, _, ()| {
            Ok("[object Window]")
        });
    }
}
