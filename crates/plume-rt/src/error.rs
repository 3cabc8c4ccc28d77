use serde::Serialize;
use serde_json::Value;

/// Machine-readable error payload printed by the CLI in `--json-errors` mode.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorReport {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "error": self })
    }
}

pub fn error_json(code: &str, message: &str, detail: Option<&str>) -> Value {
    let mut report = ErrorReport::new(code, message);
    if let Some(detail) = detail {
        report = report.with_detail(detail);
    }
    report.to_json()
}
