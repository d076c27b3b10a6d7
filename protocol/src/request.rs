use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::permission::PermissionSet;

/// Pattern every context key must match: `[A-Za-z_][A-Za-z0-9_]*`.
///
/// Exposed here (rather than only inside `cellrun-security`) because the
/// isolate worker re-checks it in depth as a defense-in-depth measure.
pub const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

pub fn is_identifier_safe(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Input bundle submitted to the executor facade. Immutable once submitted —
/// nothing downstream mutates an `ExecutionRequest` in place. See.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// UTF-8 source text to execute.
    pub code: String,

    /// Context variables injected into the execution scope. Keys must be
    /// identifier-safe; see [`is_identifier_safe`].
    #[serde(default)]
    pub context: HashMap<String, Value>,

    #[serde(default)]
    pub permission_set: PermissionSet,

    /// Overall execution deadline in milliseconds. Falls back to the
    /// executor's configured default when absent.
    pub timeout_ms: Option<u64>,

    /// Memory cap in megabytes, enforced by the resource limiter and (on the
    /// subprocess path) the child process's heap-size flag.
    pub memory_limit_mb: Option<u64>,

    /// When present, and the run is otherwise eligible, the
    /// executed code is persisted as a capability under this intent.
    pub intent: Option<String>,

    /// Correlates this execution's trace tree with an ancestor's, so the
    /// root `parentTraceId` of every emitted [`crate::trace_event::TraceEvent`]
    /// threads back to it.
    pub parent_trace_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            context: HashMap::new(),
            permission_set: PermissionSet::default(),
            timeout_ms: None,
            memory_limit_mb: None,
            intent: None,
            parent_trace_id: None,
        }
    }

    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_permission_set(mut self, permission_set: PermissionSet) -> Self {
        self.permission_set = permission_set;
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    /// All context keys that fail [`is_identifier_safe`], in iteration order.
    pub fn invalid_context_keys(&self) -> Vec<&str> {
        self.context
            .keys()
            .filter(|k| !is_identifier_safe(k))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_safe_accepts_and_rejects() {
        assert!(is_identifier_safe("deps"));
        assert!(is_identifier_safe("_private_1"));
        assert!(!is_identifier_safe("1invalid"));
        assert!(!is_identifier_safe(""));
        assert!(!is_identifier_safe("has-dash"));
        assert!(!is_identifier_safe("has space"));
    }

    #[test]
    fn invalid_context_keys_reports_offenders() {
        let mut ctx = HashMap::new();
        ctx.insert("ok_key".to_string(), Value::from(1));
        ctx.insert("1bad".to_string(), Value::from(2));
        let req = ExecutionRequest::new("2 + 2").with_context(ctx);
        assert_eq!(req.invalid_context_keys(), vec!["1bad"]);
    }
}
