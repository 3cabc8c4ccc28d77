//! Query and transaction operations scripts reach through `plume.*`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::datum::{Datum, Oid};
use crate::error::{HostError, PlumeError, Result};
use crate::host::{
    Catalog, FetchDirection, Host, LogLevel, PlanId, RoutineMetadata, SubtransactionId,
};
use crate::marshal::{self, Marshaler, RowCheck};
use crate::types::{self, RowDescriptor};
use crate::value::ScriptValue;
use crate::window::WindowBinding;

pub const LANGUAGE: &str = "plume";

pub(crate) type SharedHost = Rc<RefCell<dyn Host>>;

struct PlanEntry {
    param_types: Vec<Oid>,
}

/// Rows collected by a set-returning call, marshaled as they arrive.
pub(crate) struct RowAccumulator {
    pub return_type: Oid,
    pub row: Option<RowDescriptor>,
    pub rows: Vec<Datum>,
}

impl RowAccumulator {
    pub(crate) fn accept<C: Catalog + ?Sized>(
        &mut self,
        catalog: &C,
        value: &ScriptValue,
    ) -> Result<()> {
        let marshaler = Marshaler::new(catalog);
        let datum = match &self.row {
            Some(desc) if value.is_nullish() => Datum::Row(marshaler.from_script_row(
                &ScriptValue::Object(Vec::new()),
                desc,
                RowCheck::Exact,
            )?),
            Some(desc) => Datum::Row(marshaler.from_script_row(value, desc, RowCheck::Exact)?),
            None => marshaler.from_script(value, self.return_type)?,
        };
        self.rows.push(datum);
        Ok(())
    }
}

/// State of the routine currently running on this session.
pub(crate) struct ActiveCall {
    pub routine: String,
    pub nonatomic: bool,
    pub rows: Option<RowAccumulator>,
    pub window: Option<WindowBinding>,
    pub subtransaction_depth: usize,
}

/// Everything a script callback may touch, shared by every context of one runtime.
pub struct Session {
    pub(crate) host: SharedHost,
    plans: RefCell<HashMap<PlanId, PlanEntry>>,
    cursors: RefCell<HashSet<String>>,
    subtransactions: RefCell<Vec<SubtransactionId>>,
    pub(crate) active: RefCell<Option<ActiveCall>>,
    executed: Cell<u64>,
}

impl Session {
    pub(crate) fn new(host: SharedHost) -> Self {
        Self {
            host,
            plans: RefCell::new(HashMap::new()),
            cursors: RefCell::new(HashSet::new()),
            subtransactions: RefCell::new(Vec::new()),
            active: RefCell::new(None),
            executed: Cell::new(0),
        }
    }

    pub(crate) fn statements_executed(&self) -> u64 {
        self.executed.get()
    }

    /// Runs `op` inside an internal subtransaction so a failure leaves no partial effects.
    fn guarded<T>(&self, op: impl FnOnce(&mut dyn Host) -> Result<T>) -> Result<T> {
        let mut host = self.host.borrow_mut();
        if !host.in_transaction() {
            return Err(PlumeError::Transaction(
                "queries require an open transaction".to_string(),
            ));
        }
        let id = host.begin_subtransaction()?;
        match op(&mut *host) {
            Ok(value) => {
                host.release_subtransaction(id)?;
                self.executed.set(self.executed.get() + 1);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = host.rollback_subtransaction(id) {
                    log::warn!("failed to roll back statement subtransaction: {rollback}");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn execute(&self, query: &str, params: &[ScriptValue]) -> Result<ScriptValue> {
        self.guarded(|host| {
            let datums = if params.is_empty() {
                Vec::new()
            } else {
                let param_types = host.describe_params(query)?;
                if param_types.len() != params.len() {
                    return Err(PlumeError::ArgumentType(format!(
                        "query expected {} parameters but {} were passed instead",
                        param_types.len(),
                        params.len()
                    )));
                }
                marshal_params(&*host, params, &param_types)?
            };
            let result = host.execute(query, &datums)?;
            Marshaler::new(&*host).result_to_script(&result)
        })
    }

    pub(crate) fn prepare(&self, query: &str, type_names: &[String]) -> Result<PlanId> {
        let mut host = self.host.borrow_mut();
        let param_types = if type_names.is_empty() {
            host.describe_params(query)?
        } else {
            type_names
                .iter()
                .map(|name| host.type_by_name(name))
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        let plan = host.prepare(query, &param_types)?;
        self.plans
            .borrow_mut()
            .insert(plan, PlanEntry { param_types });
        log::debug!("prepared plan {plan}");
        Ok(plan)
    }

    fn plan_params(&self, plan: PlanId, params: &[ScriptValue]) -> Result<Vec<Oid>> {
        let plans = self.plans.borrow();
        let entry = plans
            .get(&plan)
            .ok_or_else(|| PlumeError::InvalidHandle("plan has already been freed".to_string()))?;
        if entry.param_types.len() != params.len() {
            return Err(PlumeError::ArgumentType(format!(
                "plan expected {} arguments but {} were passed instead",
                entry.param_types.len(),
                params.len()
            )));
        }
        Ok(entry.param_types.clone())
    }

    pub(crate) fn execute_plan(&self, plan: PlanId, params: &[ScriptValue]) -> Result<ScriptValue> {
        let param_types = self.plan_params(plan, params)?;
        self.guarded(|host| {
            let datums = marshal_params(&*host, params, &param_types)?;
            let result = host.execute_plan(plan, &datums)?;
            Marshaler::new(&*host).result_to_script(&result)
        })
    }

    pub(crate) fn open_cursor(&self, plan: PlanId, params: &[ScriptValue]) -> Result<String> {
        let param_types = self.plan_params(plan, params)?;
        let portal = self.guarded(|host| {
            let datums = marshal_params(&*host, params, &param_types)?;
            Ok(host.open_cursor(plan, &datums)?)
        })?;
        self.cursors.borrow_mut().insert(portal.clone());
        Ok(portal)
    }

    pub(crate) fn free_plan(&self, plan: PlanId) -> Result<()> {
        if self.plans.borrow_mut().remove(&plan).is_none() {
            return Err(PlumeError::InvalidHandle(
                "plan has already been freed".to_string(),
            ));
        }
        self.host.borrow_mut().free_plan(plan)?;
        Ok(())
    }

    fn check_cursor(&self, portal: &str) -> Result<()> {
        if self.cursors.borrow().contains(portal) {
            Ok(())
        } else {
            Err(PlumeError::InvalidHandle(format!("cursor {portal} is closed")))
        }
    }

    /// One row (or `Undefined` at the end) when `count` is absent, otherwise an array.
    pub(crate) fn fetch(&self, portal: &str, count: Option<i64>) -> Result<ScriptValue> {
        self.check_cursor(portal)?;
        let (direction, amount) = match count {
            None => (FetchDirection::Forward, 1),
            Some(n) if n < 0 => (FetchDirection::Backward, n.unsigned_abs()),
            Some(n) => (FetchDirection::Forward, n as u64),
        };
        let mut host = self.host.borrow_mut();
        let set = host.fetch(portal, direction, amount)?;
        let mut rows = Marshaler::new(&*host).rows_to_script(&set)?;
        match count {
            None => Ok(if rows.is_empty() {
                ScriptValue::Undefined
            } else {
                rows.swap_remove(0)
            }),
            Some(_) => Ok(ScriptValue::Array(rows)),
        }
    }

    pub(crate) fn move_cursor(&self, portal: &str, count: i64) -> Result<()> {
        self.check_cursor(portal)?;
        let direction = if count < 0 {
            FetchDirection::Backward
        } else {
            FetchDirection::Forward
        };
        self.host
            .borrow_mut()
            .move_cursor(portal, direction, count.unsigned_abs())?;
        Ok(())
    }

    pub(crate) fn close_cursor(&self, portal: &str) -> Result<()> {
        if !self.cursors.borrow_mut().remove(portal) {
            return Err(PlumeError::InvalidHandle(format!("cursor {portal} is closed")));
        }
        self.host.borrow_mut().close_cursor(portal)?;
        Ok(())
    }

    fn check_termination(&self, action: &str) -> Result<()> {
        let nonatomic = self
            .active
            .borrow()
            .as_ref()
            .is_some_and(|call| call.nonatomic);
        if !nonatomic {
            return Err(PlumeError::Transaction(
                "invalid transaction termination".to_string(),
            ));
        }
        if !self.subtransactions.borrow().is_empty() {
            return Err(PlumeError::Transaction(format!(
                "cannot {action} while a subtransaction is active"
            )));
        }
        Ok(())
    }

    pub(crate) fn commit(&self) -> Result<()> {
        self.check_termination("commit")?;
        self.host.borrow_mut().commit()?;
        self.cursors.borrow_mut().clear();
        Ok(())
    }

    pub(crate) fn rollback(&self) -> Result<()> {
        self.check_termination("roll back")?;
        self.host.borrow_mut().rollback()?;
        self.cursors.borrow_mut().clear();
        Ok(())
    }

    pub(crate) fn begin_subtransaction(&self) -> Result<SubtransactionId> {
        let mut host = self.host.borrow_mut();
        if !host.in_transaction() {
            return Err(PlumeError::Transaction(
                "subtransactions require an open transaction".to_string(),
            ));
        }
        let id = host.begin_subtransaction()?;
        self.subtransactions.borrow_mut().push(id);
        Ok(id)
    }

    /// Releases or rolls back `id`, which must be the innermost open subtransaction.
    pub(crate) fn finish_subtransaction(&self, id: SubtransactionId, commit: bool) -> Result<()> {
        {
            let mut stack = self.subtransactions.borrow_mut();
            if stack.last() != Some(&id) {
                return Err(PlumeError::Transaction(format!(
                    "subtransaction {id} is not the innermost open subtransaction"
                )));
            }
            stack.pop();
        }
        let mut host = self.host.borrow_mut();
        if commit {
            host.release_subtransaction(id)?;
        } else {
            host.rollback_subtransaction(id)?;
        }
        Ok(())
    }

    pub(crate) fn subtransaction_depth(&self) -> usize {
        self.subtransactions.borrow().len()
    }

    /// Rolls back subtransactions a failed call left open above `depth`.
    pub(crate) fn unwind_subtransactions(&self, depth: usize) {
        loop {
            let id = {
                let mut stack = self.subtransactions.borrow_mut();
                if stack.len() <= depth {
                    break;
                }
                stack.pop()
            };
            let Some(id) = id else { break };
            log::debug!("rolling back abandoned subtransaction {id}");
            if let Err(err) = self.host.borrow_mut().rollback_subtransaction(id) {
                log::warn!("failed to roll back subtransaction {id}: {err}");
            }
        }
    }

    pub(crate) fn log(&self, level: i64, message: &str) -> Result<()> {
        let level = LogLevel::from_code(level).ok_or_else(|| {
            PlumeError::ArgumentType(format!("invalid log level {level}"))
        })?;
        self.host.borrow_mut().emit_log(level, message)?;
        Ok(())
    }

    /// Resolves a routine a script asked for by signature, checking the caller may run it.
    pub(crate) fn find_routine(&self, signature: &str) -> Result<RoutineMetadata> {
        let host = self.host.borrow();
        let oid = host.lookup_routine(signature)?;
        let role = host.current_role();
        if !host.has_execute_privilege(role, oid)? {
            return Err(PlumeError::Host(HostError::with_sqlstate(
                format!("permission denied for function {signature}"),
                "42501",
            )));
        }
        let meta = host.routine(oid)?;
        if meta.language != LANGUAGE {
            return Err(PlumeError::ArgumentType(format!(
                "function {} is not written in {LANGUAGE}",
                meta.signature()
            )));
        }
        if meta.is_trigger() {
            return Err(PlumeError::ArgumentType(format!(
                "trigger function {} can only be called as a trigger",
                meta.name
            )));
        }
        Ok(meta)
    }

    pub(crate) fn module_source(&self, path: &str) -> Result<String> {
        self.host
            .borrow()
            .module_source(path)?
            .ok_or_else(|| PlumeError::Host(HostError::new(format!("module {path} not found"))))
    }

    pub(crate) fn publish_row(&self, value: &ScriptValue) -> Result<()> {
        let mut active = self.active.borrow_mut();
        let accumulator = active
            .as_mut()
            .and_then(|call| call.rows.as_mut())
            .ok_or_else(|| {
                PlumeError::execution("publishRow called in context that cannot accept a set")
            })?;
        let host = self.host.borrow();
        accumulator.accept(&*host, value)
    }

    pub(crate) fn reset(&self) {
        let plans: Vec<PlanId> = self.plans.borrow_mut().drain().map(|(id, _)| id).collect();
        let mut host = self.host.borrow_mut();
        for plan in plans {
            if let Err(err) = host.free_plan(plan) {
                log::warn!("failed to free plan {plan}: {err}");
            }
        }
        for portal in self.cursors.borrow_mut().drain() {
            if let Err(err) = host.close_cursor(&portal) {
                log::debug!("cursor {portal} was already gone: {err}");
            }
        }
    }
}

/// Converts call parameters; `unknown` slots take the value's own shape.
fn marshal_params<C: Catalog + ?Sized>(
    catalog: &C,
    params: &[ScriptValue],
    param_types: &[Oid],
) -> Result<Vec<Datum>> {
    let marshaler = Marshaler::new(catalog);
    params
        .iter()
        .zip(param_types)
        .map(|(value, type_id)| {
            if *type_id == types::UNKNOWN {
                marshal::infer_datum(value)
            } else {
                marshaler.from_script(value, *type_id)
            }
        })
        .collect()
}
