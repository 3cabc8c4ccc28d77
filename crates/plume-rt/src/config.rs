use std::str::FromStr;

/// Environment overrides for one configuration table, e.g. `PLUME_RUNTIME_*`.
#[derive(Clone, Debug)]
pub struct EnvLayer {
    prefix: String,
}

impl EnvLayer {
    pub fn new(app: &str, table: &str) -> Self {
        Self {
            prefix: format!("{}_{}", to_env_key(app), to_env_key(table)),
        }
    }

    pub fn key(&self, field: &str) -> String {
        format!("{}_{}", self.prefix, to_env_key(field))
    }

    pub fn get(&self, field: &str) -> Option<String> {
        let raw = std::env::var(self.key(field)).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn parse<T: FromStr>(&self, field: &str) -> Result<Option<T>, String>
    where
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(field) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|err| format!("invalid value for {}: {err}", self.key(field)))
    }
}

fn to_env_key(name: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == '.' {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
            continue;
        }
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::EnvLayer;

    #[test]
    fn env_keys_split_camel_case_and_separators() {
        let layer = EnvLayer::new("plume", "runtime");
        assert_eq!(layer.key("memoryLimitMb"), "PLUME_RUNTIME_MEMORY_LIMIT_MB");
        assert_eq!(layer.key("start-proc"), "PLUME_RUNTIME_START_PROC");
        assert_eq!(EnvLayer::new("plume.cli", "database").key("path"), "PLUME_CLI_DATABASE_PATH");
        assert_eq!(
            layer.key("execution_timeout_secs"),
            "PLUME_RUNTIME_EXECUTION_TIMEOUT_SECS"
        );
    }
}
