//! Per-role script contexts and the compiled routines each one holds.

use std::collections::HashMap;

use mlua::{Function, Lua, RegistryKey};
use sha2::{Digest, Sha256};

use crate::compiler;
use crate::datum::Oid;
use crate::engine::{self, ScriptContext};
use crate::error::Result;
use crate::host::RoutineMetadata;

/// Identity of a compiled routine inside one context.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RoutineKey {
    pub oid: Oid,
    pub trigger: bool,
    pub arg_types: Vec<Oid>,
}

impl RoutineKey {
    pub fn new(meta: &RoutineMetadata, arg_types: Vec<Oid>) -> Self {
        Self {
            oid: meta.oid,
            trigger: meta.is_trigger(),
            arg_types,
        }
    }

    /// Key for a routine called with its declared input types.
    pub fn declared(meta: &RoutineMetadata) -> Self {
        let arg_types = meta.input_args().iter().map(|(_, type_id)| *type_id).collect();
        Self::new(meta, arg_types)
    }
}

/// Digest of everything that changes the compiled function.
pub fn version_stamp(meta: &RoutineMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meta.name.as_bytes());
    hasher.update([0]);
    for (name, type_id) in meta.input_args() {
        hasher.update(name.unwrap_or("").as_bytes());
        hasher.update(type_id.to_le_bytes());
    }
    hasher.update(meta.return_type.to_le_bytes());
    hasher.update([meta.returns_set as u8]);
    hasher.update([0]);
    hasher.update(meta.source.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

struct CachedRoutine {
    name: String,
    stamp: String,
    function: RegistryKey,
}

#[derive(Default)]
pub struct RoutineCache {
    entries: HashMap<RoutineKey, CachedRoutine>,
    compilations: u64,
    hits: u64,
}

impl RoutineCache {
    /// Returns the cached function, compiling on first use or after a redefinition.
    pub(crate) fn function<'lua>(
        &mut self,
        lua: &'lua Lua,
        key: RoutineKey,
        meta: &RoutineMetadata,
    ) -> Result<Function<'lua>> {
        let stamp = version_stamp(meta);
        if let Some(entry) = self.entries.get(&key) {
            if entry.stamp == stamp {
                self.hits += 1;
                return lua
                    .registry_value::<Function>(&entry.function)
                    .map_err(engine::convert_error);
            }
            log::debug!("routine {} changed since it was compiled; recompiling", entry.name);
        }
        let function = compiler::compile(lua, meta)?;
        let handle = lua
            .create_registry_value(function.clone())
            .map_err(engine::convert_error)?;
        self.compilations += 1;
        let entry = CachedRoutine {
            name: meta.name.clone(),
            stamp,
            function: handle,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            if let Err(err) = lua.remove_registry_value(previous.function) {
                log::warn!("failed to release compiled routine {}: {err}", previous.name);
            }
        }
        Ok(function)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Contexts keyed by role; a context is never shared between roles.
#[derive(Default)]
pub struct ContextCache {
    contexts: HashMap<Oid, ScriptContext>,
    created: u64,
    retired_compilations: u64,
    retired_hits: u64,
}

impl ContextCache {
    pub fn get(&self, role: Oid) -> Option<&ScriptContext> {
        self.contexts.get(&role)
    }

    pub fn contains(&self, role: Oid) -> bool {
        self.contexts.contains_key(&role)
    }

    pub fn insert(&mut self, context: ScriptContext) -> &ScriptContext {
        let role = context.role();
        self.created += 1;
        if let Some(previous) = self.contexts.insert(role, context) {
            log::warn!("cache consistency: replaced an existing context for role {role}");
            self.retire(&previous);
        }
        &self.contexts[&role]
    }

    pub fn remove(&mut self, role: Oid) -> Option<ScriptContext> {
        let context = self.contexts.remove(&role)?;
        self.retire(&context);
        Some(context)
    }

    pub fn clear(&mut self) {
        let roles: Vec<Oid> = self.contexts.keys().copied().collect();
        for role in roles {
            self.remove(role);
        }
    }

    fn retire(&mut self, context: &ScriptContext) {
        let routines = context.routines();
        self.retired_compilations += routines.compilations();
        self.retired_hits += routines.hits();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScriptContext> {
        self.contexts.values()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn compilations(&self) -> u64 {
        self.retired_compilations
            + self
                .contexts
                .values()
                .map(|context| context.routines().compilations())
                .sum::<u64>()
    }

    pub fn hits(&self) -> u64 {
        self.retired_hits
            + self
                .contexts
                .values()
                .map(|context| context.routines().hits())
                .sum::<u64>()
    }
}
