use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::ErrorKind;

/// Structured error attached to a failed [`ExecutionResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResultError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionResultError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// The outcome of one `execute`/`executeWithTools` call.
///
/// On the isolate path, a JavaScript `undefined` return value is normalized
/// to a JSON `null` before landing here, including for the boundary case of
/// empty code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionResultError>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<u64>,
}

impl ExecutionResult {
    pub fn ok(result: Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            execution_time_ms,
            memory_used_mb: None,
        }
    }

    pub fn err(error: ExecutionResultError, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms,
            memory_used_mb: None,
        }
    }

    pub fn with_memory_used_mb(mut self, mb: u64) -> Self {
        self.memory_used_mb = Some(mb);
        self
    }
}
