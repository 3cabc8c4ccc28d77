use serde::Deserialize;

use plume_rt::config::EnvLayer;

use crate::error::{PlumeError, Result};

pub const MIN_MEMORY_LIMIT_MB: u64 = 256;
pub const MAX_MEMORY_LIMIT_MB: u64 = 3096;
pub const MIN_EXECUTION_TIMEOUT_SECS: u64 = 1;
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 65_536;

/// Host-supplied runtime settings, fixed for the lifetime of a Runtime.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub memory_limit_mb: u64,
    pub execution_timeout_secs: u64,
    /// Routine run once in every new script context.
    pub start_proc: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: MIN_MEMORY_LIMIT_MB,
            execution_timeout_secs: 300,
            start_proc: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MEMORY_LIMIT_MB..=MAX_MEMORY_LIMIT_MB).contains(&self.memory_limit_mb) {
            return Err(PlumeError::Config(format!(
                "memory_limit_mb must be between {MIN_MEMORY_LIMIT_MB} and {MAX_MEMORY_LIMIT_MB}, got {}",
                self.memory_limit_mb
            )));
        }
        if !(MIN_EXECUTION_TIMEOUT_SECS..=MAX_EXECUTION_TIMEOUT_SECS)
            .contains(&self.execution_timeout_secs)
        {
            return Err(PlumeError::Config(format!(
                "execution_timeout_secs must be between {MIN_EXECUTION_TIMEOUT_SECS} and {MAX_EXECUTION_TIMEOUT_SECS}, got {}",
                self.execution_timeout_secs
            )));
        }
        Ok(())
    }

    /// Reads the `[runtime]` table of a `plume.toml` document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|err| PlumeError::Config(err.to_string()))?;
        file.runtime.validate()?;
        Ok(file.runtime)
    }

    /// Applies `PLUME_RUNTIME_*` overrides on top of the current values.
    pub fn apply_env(mut self) -> Result<Self> {
        let env = EnvLayer::new("plume", "runtime");
        if let Some(limit) = env.parse::<u64>("memory_limit_mb").map_err(PlumeError::Config)? {
            self.memory_limit_mb = limit;
        }
        if let Some(timeout) = env
            .parse::<u64>("execution_timeout_secs")
            .map_err(PlumeError::Config)?
        {
            self.execution_timeout_secs = timeout;
        }
        if let Some(start_proc) = env.get("start_proc") {
            self.start_proc = Some(start_proc);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn memory_limit_bytes(&self) -> usize {
        (self.memory_limit_mb as usize).saturating_mul(1024 * 1024)
    }

    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution_timeout_secs)
    }
}
