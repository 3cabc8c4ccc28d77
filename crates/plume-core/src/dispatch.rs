//! One routine invocation, from catalog lookup to the marshaled result.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::bridge::{ActiveCall, LANGUAGE, RowAccumulator, Session};
use crate::cache::{ContextCache, RoutineKey};
use crate::compiler::INLINE_BLOCK_NAME;
use crate::config::RuntimeConfig;
use crate::datum::{Datum, Oid, RowDatum};
use crate::engine::ScriptContext;
use crate::error::{PlumeError, Result};
use crate::host::{
    Catalog, RoutineKind, RoutineMetadata, TriggerData, TriggerEvent, TriggerLevel, TriggerWhen,
    WindowFrame,
};
use crate::interrupt::InterruptHandle;
use crate::marshal::{Marshaler, RowCheck};
use crate::types::{self, RowDescriptor, TypeCategory};
use crate::value::ScriptValue;
use crate::window::WindowBinding;

pub enum CallKind {
    Function,
    Trigger(TriggerData),
    Window(Rc<RefCell<dyn WindowFrame>>),
}

/// A host request to run one routine.
pub struct CallRequest {
    pub routine: Oid,
    /// Input arguments only, in declaration order.
    pub args: Vec<Datum>,
    /// Actual argument types at the call site, used to resolve polymorphic parameters.
    pub arg_types: Option<Vec<Oid>>,
    pub return_type: Option<Oid>,
    /// Row layout the call site expects for a `record` result.
    pub result_descriptor: Option<RowDescriptor>,
    pub nonatomic: bool,
    pub kind: CallKind,
}

impl CallRequest {
    pub fn new(routine: Oid, args: Vec<Datum>) -> Self {
        Self {
            routine,
            args,
            arg_types: None,
            return_type: None,
            result_descriptor: None,
            nonatomic: false,
            kind: CallKind::Function,
        }
    }

    pub fn trigger(routine: Oid, data: TriggerData) -> Self {
        Self {
            kind: CallKind::Trigger(data),
            ..Self::new(routine, Vec::new())
        }
    }

    pub fn window(routine: Oid, frame: Rc<RefCell<dyn WindowFrame>>) -> Self {
        Self {
            kind: CallKind::Window(frame),
            ..Self::new(routine, Vec::new())
        }
    }

    pub fn with_arg_types(mut self, arg_types: Vec<Oid>) -> Self {
        self.arg_types = Some(arg_types);
        self
    }

    pub fn with_return_type(mut self, return_type: Oid) -> Self {
        self.return_type = Some(return_type);
        self
    }

    pub fn with_result_descriptor(mut self, row: RowDescriptor) -> Self {
        self.result_descriptor = Some(row);
        self
    }

    /// Allows `plume.commit()`/`plume.rollback()` when the routine is a procedure.
    pub fn nonatomic(mut self) -> Self {
        self.nonatomic = true;
        self
    }
}

/// What a trigger asks the host to do with the pending row.
#[derive(Clone, Debug, PartialEq)]
pub enum TriggerAction {
    Proceed,
    Replace(RowDatum),
    Skip,
}

impl TriggerAction {
    pub fn apply(self, pending: Option<RowDatum>) -> Option<RowDatum> {
        match self {
            TriggerAction::Proceed => pending,
            TriggerAction::Replace(row) => Some(row),
            TriggerAction::Skip => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CallOutcome {
    Value(Datum),
    Rows(Vec<Datum>),
    Trigger(TriggerAction),
    Void,
}

impl CallOutcome {
    pub fn into_value(self) -> Option<Datum> {
        match self {
            CallOutcome::Value(datum) => Some(datum),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Datum>> {
        match self {
            CallOutcome::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

struct ResolvedCall {
    arg_types: Vec<Oid>,
    return_type: Oid,
    row: Option<RowDescriptor>,
}

/// Installs the active call on the session and undoes everything on the way out.
struct CallScope<'s> {
    session: &'s Session,
    context: &'s ScriptContext,
    previous: Option<ActiveCall>,
    deadline: Option<Instant>,
    depth: usize,
}

impl<'s> CallScope<'s> {
    fn enter(
        session: &'s Session,
        context: &'s ScriptContext,
        call: ActiveCall,
        timeout: Duration,
    ) -> Self {
        let depth = call.subtransaction_depth;
        let previous = session.active.replace(Some(call));
        let deadline = context.arm_deadline(timeout);
        Self {
            session,
            context,
            previous,
            deadline,
            depth,
        }
    }

    fn take(&mut self) -> Option<ActiveCall> {
        self.session.active.borrow_mut().take()
    }
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        self.session.unwind_subtransactions(self.depth);
        self.session.active.replace(self.previous.take());
        self.context.restore_deadline(self.deadline);
        self.context.collect_garbage();
    }
}

pub(crate) struct Dispatcher<'a> {
    pub session: &'a Rc<Session>,
    pub contexts: &'a mut ContextCache,
    pub config: &'a RuntimeConfig,
    pub interrupt: &'a InterruptHandle,
}

impl Dispatcher<'_> {
    pub(crate) fn call(&mut self, request: CallRequest) -> Result<CallOutcome> {
        let CallRequest {
            routine,
            args,
            arg_types,
            return_type,
            result_descriptor,
            nonatomic,
            kind,
        } = request;

        let (meta, role, resolved) = {
            let host = self.session.host.borrow();
            let meta = host.routine(routine)?;
            let role = host.current_role();
            let resolved = resolve_call(
                &*host,
                &meta,
                arg_types.as_deref(),
                return_type,
                result_descriptor,
            )?;
            (meta, role, resolved)
        };
        check_kind(&meta, &kind)?;
        if matches!(kind, CallKind::Function) && args.len() != resolved.arg_types.len() {
            return Err(PlumeError::ArgumentType(format!(
                "{} expects {} arguments but {} were passed",
                meta.name,
                resolved.arg_types.len(),
                args.len()
            )));
        }
        let nonatomic = nonatomic && meta.kind == RoutineKind::Procedure;

        self.ensure_context(role)?;
        let context = self
            .contexts
            .get(role)
            .ok_or_else(|| PlumeError::execution(format!("no script context for role {role}")))?;

        let function =
            context.routine_function(RoutineKey::new(&meta, resolved.arg_types.clone()), &meta)?;

        let (script_args, window) = {
            let host = self.session.host.borrow();
            bind_args(&Marshaler::new(&*host), &kind, &args, &resolved)?
        };

        let call = ActiveCall {
            routine: meta.name.clone(),
            nonatomic,
            rows: meta.returns_set.then(|| RowAccumulator {
                return_type: resolved.return_type,
                row: resolved.row.clone(),
                rows: Vec::new(),
            }),
            window,
            subtransaction_depth: self.session.subtransaction_depth(),
        };
        self.interrupt.clear();
        log::debug!("calling {} for role {role}", meta.name);
        let (returned, finished) = {
            let mut scope =
                CallScope::enter(self.session, context, call, self.config.execution_timeout());
            let returned = context.call(&function, &script_args);
            (returned, scope.take())
        };
        let returned = returned?;

        let host = self.session.host.borrow();
        let marshaler = Marshaler::new(&*host);
        if let CallKind::Trigger(data) = &kind {
            return trigger_action(&marshaler, data, &returned).map(CallOutcome::Trigger);
        }
        if meta.returns_set {
            let mut rows = finished.and_then(|call| call.rows).ok_or_else(|| {
                PlumeError::execution(format!("{} lost its result set", meta.name))
            })?;
            collect_final(&*host, &mut rows, returned)?;
            return Ok(CallOutcome::Rows(rows.rows));
        }
        if resolved.return_type == types::VOID {
            return Ok(CallOutcome::Void);
        }
        return_value(&marshaler, &resolved, &returned).map(CallOutcome::Value)
    }

    pub(crate) fn inline(&mut self, source: &str, nonatomic: bool) -> Result<()> {
        let role = self.session.host.borrow().current_role();
        self.ensure_context(role)?;
        let context = self
            .contexts
            .get(role)
            .ok_or_else(|| PlumeError::execution(format!("no script context for role {role}")))?;
        let function = context.inline_function(source)?;
        let call = ActiveCall {
            routine: INLINE_BLOCK_NAME.to_string(),
            nonatomic,
            rows: None,
            window: None,
            subtransaction_depth: self.session.subtransaction_depth(),
        };
        self.interrupt.clear();
        let _scope = CallScope::enter(self.session, context, call, self.config.execution_timeout());
        context.call(&function, &[])?;
        Ok(())
    }

    fn ensure_context(&mut self, role: Oid) -> Result<()> {
        if self.contexts.contains(role) {
            return Ok(());
        }
        let context = ScriptContext::new(
            role,
            self.config,
            Rc::clone(self.session),
            self.interrupt.clone(),
        )?;
        let context = self.contexts.insert(context);
        if let Some(name) = &self.config.start_proc {
            if let Err(err) = run_start_proc(self.session, context, name, self.config) {
                log::warn!("start proc {name} failed: {err}");
            }
        }
        Ok(())
    }
}

fn run_start_proc(
    session: &Session,
    context: &ScriptContext,
    name: &str,
    config: &RuntimeConfig,
) -> Result<()> {
    let meta = {
        let host = session.host.borrow();
        let oid = host.lookup_routine(name)?;
        host.routine(oid)?
    };
    if meta.language != LANGUAGE {
        return Err(PlumeError::ArgumentType(format!(
            "start proc {name} is not written in {LANGUAGE}"
        )));
    }
    let function = context.routine_function(RoutineKey::declared(&meta), &meta)?;
    let call = ActiveCall {
        routine: meta.name.clone(),
        nonatomic: false,
        rows: None,
        window: None,
        subtransaction_depth: session.subtransaction_depth(),
    };
    let _scope = CallScope::enter(session, context, call, config.execution_timeout());
    context.call(&function, &[])?;
    log::debug!("ran start proc {name} for role {}", context.role());
    Ok(())
}

fn check_kind(meta: &RoutineMetadata, kind: &CallKind) -> Result<()> {
    if meta.language != LANGUAGE {
        return Err(PlumeError::ArgumentType(format!(
            "function {} is not written in {LANGUAGE}",
            meta.signature()
        )));
    }
    match kind {
        CallKind::Trigger(_) if !meta.is_trigger() => Err(PlumeError::ArgumentType(format!(
            "function {} must return type trigger",
            meta.name
        ))),
        CallKind::Trigger(_) => Ok(()),
        _ if meta.is_trigger() => Err(PlumeError::ArgumentType(format!(
            "trigger function {} can only be called as a trigger",
            meta.name
        ))),
        CallKind::Window(_) if meta.kind != RoutineKind::Window => Err(
            PlumeError::WindowContext(format!("{} is not a window function", meta.name)),
        ),
        _ => Ok(()),
    }
}

fn type_name<C: Catalog + ?Sized>(catalog: &C, type_id: Oid) -> String {
    catalog
        .type_info(type_id)
        .map(|info| info.name)
        .unwrap_or_else(|_| type_id.to_string())
}

/// Binds polymorphic parameters to the call site and deduces the result type.
fn resolve_call<C: Catalog + ?Sized>(
    catalog: &C,
    meta: &RoutineMetadata,
    call_types: Option<&[Oid]>,
    return_type: Option<Oid>,
    row: Option<RowDescriptor>,
) -> Result<ResolvedCall> {
    let mut element: Option<Oid> = None;
    let mut arg_types = Vec::new();
    for (idx, (_, declared)) in meta.input_args().into_iter().enumerate() {
        if !types::is_polymorphic(declared) {
            arg_types.push(declared);
            continue;
        }
        let actual = call_types
            .and_then(|call_types| call_types.get(idx).copied())
            .filter(|actual| !types::is_polymorphic(*actual))
            .ok_or_else(|| {
                PlumeError::type_resolution(
                    declared,
                    format!(
                        "could not determine actual type of argument {} declared {}",
                        idx + 1,
                        type_name(catalog, declared)
                    ),
                )
            })?;
        let info = catalog
            .type_info(actual)
            .map_err(|err| PlumeError::type_resolution(actual, err.message))?;
        let bound = match declared {
            types::ANYARRAY => info
                .element
                .filter(|_| info.category == TypeCategory::Array)
                .ok_or_else(|| {
                    PlumeError::ArgumentType(format!(
                        "argument {} declared anyarray is not an array but type {}",
                        idx + 1,
                        info.name
                    ))
                })?,
            types::ANYNONARRAY if info.category == TypeCategory::Array => {
                return Err(PlumeError::ArgumentType(format!(
                    "argument {} declared anynonarray is an array but type {}",
                    idx + 1,
                    info.name
                )));
            }
            _ => actual,
        };
        match element {
            Some(existing) if existing != bound => {
                return Err(PlumeError::ArgumentType(format!(
                    "arguments declared anyelement are not all alike: {} versus {}",
                    type_name(catalog, existing),
                    type_name(catalog, bound)
                )));
            }
            _ => element = Some(bound),
        }
        arg_types.push(actual);
    }

    let return_type = if types::is_polymorphic(meta.return_type) {
        match return_type.filter(|call_site| !types::is_polymorphic(*call_site)) {
            Some(call_site) => call_site,
            None => {
                let element = element.ok_or_else(|| {
                    PlumeError::type_resolution(
                        meta.return_type,
                        "could not determine polymorphic result type",
                    )
                })?;
                if meta.return_type == types::ANYARRAY {
                    catalog
                        .type_info(element)
                        .ok()
                        .and_then(|info| info.array_type)
                        .ok_or_else(|| {
                            PlumeError::type_resolution(element, "could not find array type")
                        })?
                } else {
                    element
                }
            }
        }
    } else {
        meta.return_type
    };

    let row = match row.or_else(|| meta.output_descriptor()) {
        Some(row) => Some(row),
        None if return_type == types::RECORD => None,
        None => match catalog.type_info(return_type) {
            Ok(info) if info.category == TypeCategory::Composite => Some(
                catalog
                    .row_descriptor(return_type)
                    .map_err(|err| PlumeError::type_resolution(return_type, err.message))?,
            ),
            _ => None,
        },
    };

    Ok(ResolvedCall {
        arg_types,
        return_type,
        row,
    })
}

fn bind_args<C: Catalog + ?Sized>(
    marshaler: &Marshaler<'_, C>,
    kind: &CallKind,
    args: &[Datum],
    resolved: &ResolvedCall,
) -> Result<(Vec<ScriptValue>, Option<WindowBinding>)> {
    match kind {
        CallKind::Function => {
            let values = args
                .iter()
                .zip(&resolved.arg_types)
                .map(|(datum, type_id)| marshaler.to_script(datum, *type_id))
                .collect::<Result<Vec<_>>>()?;
            Ok((values, None))
        }
        CallKind::Window(frame) => {
            let mut values = Vec::with_capacity(resolved.arg_types.len());
            {
                let frame = frame.borrow();
                for (idx, type_id) in resolved.arg_types.iter().enumerate() {
                    let datum = frame.arg_current(idx)?;
                    values.push(marshaler.to_script(&datum, *type_id)?);
                }
            }
            let binding = WindowBinding {
                frame: Rc::clone(frame),
                arg_types: resolved.arg_types.clone(),
            };
            Ok((values, Some(binding)))
        }
        CallKind::Trigger(data) => {
            let relation = &data.relation.row;
            let row_value = |row: &Option<RowDatum>| match row {
                Some(row) => marshaler.to_script_row(row, relation),
                None => Ok(ScriptValue::Undefined),
            };
            let mut values = args
                .iter()
                .zip(&resolved.arg_types)
                .map(|(datum, type_id)| marshaler.to_script(datum, *type_id))
                .collect::<Result<Vec<_>>>()?;
            values.push(row_value(&data.new_row)?);
            values.push(row_value(&data.old_row)?);
            values.push(ScriptValue::string(data.name.as_str()));
            values.push(ScriptValue::string(data.when.as_str()));
            values.push(ScriptValue::string(data.level.as_str()));
            values.push(ScriptValue::string(data.event.as_str()));
            values.push(ScriptValue::Number(data.relation.oid as f64));
            values.push(ScriptValue::string(data.relation.name.as_str()));
            values.push(ScriptValue::string(data.relation.schema.as_str()));
            values.push(ScriptValue::Array(
                data.args.iter().map(|arg| ScriptValue::string(arg.as_str())).collect(),
            ));
            Ok((values, None))
        }
    }
}

fn trigger_action<C: Catalog + ?Sized>(
    marshaler: &Marshaler<'_, C>,
    data: &TriggerData,
    value: &ScriptValue,
) -> Result<TriggerAction> {
    let writes_row = data.level == TriggerLevel::Row
        && data.when != TriggerWhen::After
        && matches!(data.event, TriggerEvent::Insert | TriggerEvent::Update);
    if !writes_row {
        return Ok(TriggerAction::Proceed);
    }
    match value {
        ScriptValue::Undefined | ScriptValue::Bool(true) => Ok(TriggerAction::Proceed),
        ScriptValue::Null | ScriptValue::Bool(false) => Ok(TriggerAction::Skip),
        ScriptValue::Object(_) => Ok(TriggerAction::Replace(marshaler.from_script_row(
            value,
            &data.relation.row,
            RowCheck::Exact,
        )?)),
        other => Err(PlumeError::ArgumentType(format!(
            "trigger must return a row, null or nothing, got {}",
            other.kind_name()
        ))),
    }
}

/// Appends what a set-returning routine returned after its published rows.
fn collect_final<C: Catalog + ?Sized>(
    catalog: &C,
    rows: &mut RowAccumulator,
    value: ScriptValue,
) -> Result<()> {
    match value {
        ScriptValue::Undefined | ScriptValue::Null => Ok(()),
        ScriptValue::Array(items) => {
            for item in &items {
                rows.accept(catalog, item)?;
            }
            Ok(())
        }
        other if rows.row.is_none() => rows.accept(catalog, &other),
        other => Err(PlumeError::ArgumentType(format!(
            "set-returning function must return an array of rows, got {}",
            other.kind_name()
        ))),
    }
}

fn return_value<C: Catalog + ?Sized>(
    marshaler: &Marshaler<'_, C>,
    resolved: &ResolvedCall,
    value: &ScriptValue,
) -> Result<Datum> {
    if value.is_nullish() {
        return Ok(Datum::Null);
    }
    match &resolved.row {
        Some(desc) => Ok(Datum::Row(marshaler.from_script_row(
            value,
            desc,
            RowCheck::Exact,
        )?)),
        None if resolved.return_type == types::RECORD => Err(PlumeError::type_resolution(
            types::RECORD,
            "function returning record called in context that cannot accept type record",
        )),
        None => marshaler.from_script(value, resolved.return_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_actions_resolve_the_pending_row() {
        let pending = RowDatum {
            type_id: 100_000,
            values: vec![Datum::Int4(1)],
        };
        let replaced = RowDatum {
            type_id: 100_000,
            values: vec![Datum::Int4(2)],
        };
        assert_eq!(TriggerAction::Proceed.apply(Some(pending.clone())), Some(pending.clone()));
        assert_eq!(
            TriggerAction::Replace(replaced.clone()).apply(Some(pending.clone())),
            Some(replaced)
        );
        assert_eq!(TriggerAction::Skip.apply(Some(pending)), None);
    }
}
