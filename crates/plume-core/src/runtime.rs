//! Host-facing entry points: one `Runtime` per database connection.

use std::cell::{Ref, RefCell, RefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use serde::Serialize;

use crate::bridge::{LANGUAGE, Session, SharedHost};
use crate::cache::ContextCache;
use crate::compiler;
use crate::config::RuntimeConfig;
use crate::datum::{Datum, Oid};
use crate::dispatch::{CallOutcome, CallRequest, Dispatcher};
use crate::error::{PlumeError, Result};
use crate::host::window::WindowPartition;
use crate::host::{Catalog, Host, WindowFrame};
use crate::interrupt::InterruptHandle;

#[derive(Clone, Debug, Serialize)]
pub struct ContextInfo {
    pub role: Oid,
    pub used_memory: usize,
    pub routines: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuntimeInfo {
    pub version: &'static str,
    pub language: &'static str,
    pub engine: &'static str,
    pub memory_limit_mb: u64,
    pub execution_timeout_secs: u64,
    pub contexts: Vec<ContextInfo>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RuntimeStats {
    pub contexts_created: u64,
    pub compilations: u64,
    pub cache_hits: u64,
    pub statements: u64,
}

pub struct Runtime<H: Host + 'static> {
    host: Rc<RefCell<H>>,
    session: Rc<Session>,
    contexts: ContextCache,
    config: RuntimeConfig,
    interrupt: InterruptHandle,
}

impl<H: Host + 'static> Runtime<H> {
    /// Validates `config`; no script context exists until the first call.
    pub fn new(host: H, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let host = Rc::new(RefCell::new(host));
        let shared: SharedHost = host.clone();
        log::debug!(
            "runtime ready: memory limit {} MB, timeout {}s",
            config.memory_limit_mb,
            config.execution_timeout_secs
        );
        Ok(Self {
            host,
            session: Rc::new(Session::new(shared)),
            contexts: ContextCache::default(),
            config,
            interrupt: InterruptHandle::new(),
        })
    }

    pub fn host(&self) -> Ref<'_, H> {
        self.host.borrow()
    }

    pub fn host_mut(&self) -> RefMut<'_, H> {
        self.host.borrow_mut()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn dispatcher(&mut self) -> Dispatcher<'_> {
        Dispatcher {
            session: &self.session,
            contexts: &mut self.contexts,
            config: &self.config,
            interrupt: &self.interrupt,
        }
    }

    /// Runs one routine; panics below this point come back as execution errors.
    pub fn call(&mut self, request: CallRequest) -> Result<CallOutcome> {
        let mut dispatcher = self.dispatcher();
        guard(move || dispatcher.call(request))
    }

    /// Runs an anonymous code block in the current role's context.
    pub fn inline(&mut self, source: &str, nonatomic: bool) -> Result<()> {
        let mut dispatcher = self.dispatcher();
        guard(move || dispatcher.inline(source, nonatomic))
    }

    /// Checks that a routine compiles, without running or caching it.
    pub fn validate(&self, routine: Oid) -> Result<()> {
        let meta = self.host.borrow().routine(routine)?;
        if meta.language != LANGUAGE {
            return Err(PlumeError::ArgumentType(format!(
                "function {} is not written in {LANGUAGE}",
                meta.signature()
            )));
        }
        compiler::check(&meta)
    }

    /// Evaluates a window routine once per row of `partition`.
    pub fn evaluate_window(
        &mut self,
        routine: Oid,
        partition: WindowPartition,
    ) -> Result<Vec<Datum>> {
        let len = partition.len();
        let partition = Rc::new(RefCell::new(partition));
        let frame: Rc<RefCell<dyn WindowFrame>> = partition.clone();
        let mut out = Vec::with_capacity(len);
        for pos in 0..len {
            partition.borrow_mut().set_current(pos);
            let outcome = self.call(CallRequest::window(routine, Rc::clone(&frame)))?;
            out.push(outcome.into_value().unwrap_or(Datum::Null));
        }
        Ok(out)
    }

    /// Drops every context, compiled routine and open plan.
    pub fn reset(&mut self) {
        self.contexts.clear();
        self.session.reset();
        log::debug!("runtime reset");
    }

    pub fn info(&self) -> RuntimeInfo {
        let mut contexts: Vec<ContextInfo> = self
            .contexts
            .iter()
            .map(|context| ContextInfo {
                role: context.role(),
                used_memory: context.used_memory(),
                routines: context.routines().len(),
            })
            .collect();
        contexts.sort_by_key(|context| context.role);
        RuntimeInfo {
            version: env!("CARGO_PKG_VERSION"),
            language: LANGUAGE,
            engine: "Lua 5.4",
            memory_limit_mb: self.config.memory_limit_mb,
            execution_timeout_secs: self.config.execution_timeout_secs,
            contexts,
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            contexts_created: self.contexts.created(),
            compilations: self.contexts.compilations(),
            cache_hits: self.contexts.hits(),
            statements: self.session.statements_executed(),
        }
    }

    /// Releases all script state and hands the host back.
    pub fn into_host(mut self) -> Option<H> {
        self.reset();
        let Runtime { host, session, .. } = self;
        drop(session);
        Rc::try_unwrap(host).ok().map(RefCell::into_inner)
    }
}

fn guard<T>(op: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(op)) {
        Ok(result) => result,
        Err(payload) => {
            let err = PlumeError::from_panic(payload.as_ref());
            log::error!("{err}");
            Err(err)
        }
    }
}
