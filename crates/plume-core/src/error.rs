use std::any::Any;

use thiserror::Error;

use crate::datum::Oid;

pub type Result<T> = std::result::Result<T, PlumeError>;

/// Error reported by the host catalog or executor.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
    pub sqlstate: Option<String>,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
        }
    }

    pub fn with_sqlstate(message: impl Into<String>, sqlstate: &str) -> Self {
        Self {
            message: message.into(),
            sqlstate: Some(sqlstate.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum PlumeError {
    #[error("cache lookup failed for type {type_id}: {message}")]
    TypeResolution { type_id: Oid, message: String },
    #[error("compile error in {routine}: {message}")]
    Compile {
        routine: String,
        message: String,
        line: Option<usize>,
    },
    #[error("{0}")]
    ArgumentType(String),
    #[error("field name / property name mismatch: {0}")]
    FieldMismatch(String),
    #[error("{0}")]
    Conversion(String),
    #[error("{0}")]
    Transaction(String),
    #[error("{0}")]
    WindowContext(String),
    #[error("window local memory overflow: value needs {needed} bytes, capacity is {capacity}")]
    WindowStorageOverflow { needed: usize, capacity: usize },
    #[error("{0}")]
    InvalidHandle(String),
    #[error("execution error: {message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },
    #[error("execution error: out of memory")]
    OutOfMemory,
    #[error("canceling statement due to user request")]
    Interrupted,
    #[error("canceling statement due to statement timeout")]
    Timeout,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Host(#[from] HostError),
}

impl PlumeError {
    pub fn type_resolution(type_id: Oid, message: impl Into<String>) -> Self {
        Self::TypeResolution {
            type_id,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Stable machine-readable code for reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TypeResolution { .. } => "type_resolution_error",
            Self::Compile { .. } => "compile_error",
            Self::ArgumentType(_) => "argument_type_error",
            Self::FieldMismatch(_) => "field_mismatch_error",
            Self::Conversion(_) => "conversion_error",
            Self::Transaction(_) => "transaction_error",
            Self::WindowContext(_) => "window_context_error",
            Self::WindowStorageOverflow { .. } => "window_storage_overflow_error",
            Self::InvalidHandle(_) => "invalid_handle_error",
            Self::Execution { .. } | Self::OutOfMemory | Self::Interrupted | Self::Timeout => {
                "execution_error"
            }
            Self::Config(_) => "config_error",
            Self::Host(_) => "host_error",
        }
    }

    /// Secondary text such as a script stack trace.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Execution { stack, .. } => stack.as_deref(),
            Self::Host(err) => err.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl PlumeError {
    /// Turns a panic caught at the call boundary into an execution error.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let text = payload
            .downcast_ref::<&str>()
            .map(|text| (*text).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned());
        match text {
            Some(text) => Self::execution(format!("internal panic: {text}")),
            None => Self::execution("internal panic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panics_become_execution_errors() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(
            PlumeError::from_panic(payload.as_ref()).to_string(),
            PlumeError::execution("internal panic: boom").to_string()
        );

        let payload: Box<dyn Any + Send> = Box::new(42u64);
        let err = PlumeError::from_panic(payload.as_ref());
        assert_eq!(err.code(), "execution_error");
        assert!(err.to_string().ends_with("internal panic"), "{err}");
    }

    #[test]
    fn out_of_memory_uses_fixed_message() {
        assert_eq!(
            PlumeError::OutOfMemory.to_string(),
            "execution error: out of memory"
        );
        assert_eq!(PlumeError::OutOfMemory.code(), "execution_error");
    }

    #[test]
    fn host_errors_keep_their_text() {
        let err: PlumeError = HostError::with_sqlstate("duplicate key", "23505").into();
        assert_eq!(err.to_string(), "duplicate key");
        assert_eq!(err.detail(), Some("23505"));
    }
}
