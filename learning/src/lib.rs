//! Learning Hand-off.
//!
//! Runs once after an execution completes, outside the critical path the
//! caller is waiting on: persists a successful, eligible run as a named
//! [`cellrun_protocol::Capability`] and forwards its trace to an external
//! graph-learning collaborator. Mirrors `codex-rs`'s rollout/history
//! recorder pattern of a best-effort post-hoc hook whose own failures must
//! never surface as the run's result: errors in the hand-off are logged
//! and swallowed.

mod naming;
mod projection;

pub use projection::ExecutionTraceProjection;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cellrun_protocol::Capability;
use cellrun_protocol::ExecutionRequest;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::Fqdn;
use cellrun_registry::generate_fqdn;
use cellrun_registry::CapabilityRegistry;
use cellrun_trace::TraceCollector;
use serde_json::Value;
use tracing::warn;

/// Graph-learning collaborator (external; out of scope per). The
/// hand-off forwards a trace projection to it whenever the buffer holds at
/// least two events and a client is configured.
#[async_trait]
pub trait GraphEngineClient: Send + Sync {
    async fn ingest_trace(&self, projection: ExecutionTraceProjection) -> Result<(), String>;
}

/// `(org, project)` scope a learned capability is registered under, the
/// same shape `cellrun_bridge::BridgeScope` uses.
#[derive(Debug, Clone)]
pub struct LearningScope {
    pub org: String,
    pub project: String,
}

pub struct LearningHandoff {
    scope: LearningScope,
    registry: Option<Arc<CapabilityRegistry>>,
    graph_engine: Option<Arc<dyn GraphEngineClient>>,
}

impl LearningHandoff {
    pub fn new(
        scope: LearningScope,
        registry: Option<Arc<CapabilityRegistry>>,
        graph_engine: Option<Arc<dyn GraphEngineClient>>,
    ) -> Self {
        Self {
            scope,
            registry,
            graph_engine,
        }
    }

    /// `true` iff the run qualifies for capability persistence:
    /// execution success, an intent was supplied, no
    /// `tool_end` recorded a soft failure, and a capability store is
    /// configured.
    pub fn is_eligible(
        &self,
        request: &ExecutionRequest,
        result: &ExecutionResult,
        trace: &TraceCollector,
    ) -> bool {
        result.success
            && request.intent.is_some()
            && !trace.has_any_tool_failed()
            && self.registry.is_some()
    }

    /// Runs the full hand-off: persists a capability when eligible, then
    /// forwards the trace to the graph engine when there is enough of one
    /// to learn from. Never returns an error to the caller — failures are
    /// logged via `tracing::warn!` and swallowed.
    pub async fn handle(
        &self,
        request: &ExecutionRequest,
        result: &ExecutionResult,
        user_id: Option<&str>,
        trace: &TraceCollector,
    ) {
        if self.is_eligible(request, result, trace) {
            if let Err(e) = self.persist_capability(request, result, trace) {
                warn!("learning hand-off: failed to persist capability: {e}");
            }
        }

        let events = trace.get_traces();
        if events.len() >= 2 {
            if let Some(graph_engine) = &self.graph_engine {
                let projection = projection::build_projection(request, result, trace, user_id);
                if let Err(e) = graph_engine.ingest_trace(projection).await {
                    warn!("learning hand-off: graph engine ingestion failed: {e}");
                }
            }
        }
    }

    /// Persists the eligible run as a capability: the code
    /// snippet is re-constituted standalone by prepending a `const`
    /// declaration for every context variable not named `deps`, `args`, or
    /// `intent`, so the saved snippet can be re-executed without its
    /// originating context.
    fn persist_capability(
        &self,
        request: &ExecutionRequest,
        result: &ExecutionResult,
        trace: &TraceCollector,
    ) -> Result<(), String> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| "no capability registry configured".to_string())?;

        let intent = request
            .intent
            .as_deref()
            .ok_or_else(|| "eligibility check should have guaranteed an intent".to_string())?;

        let standalone_code = standalone_snippet(&request.code, &request.context);
        let tools_used = trace.get_tools_called();
        let (namespace, action) = naming::derive_namespace_action(intent);

        let fqdn = generate_fqdn(
            &self.scope.org,
            &self.scope.project,
            &namespace,
            &action,
            &standalone_code,
            |candidate| fqdn_taken(registry, candidate),
        );

        let mut capability = Capability::new(fqdn, standalone_code, tools_used);
        capability.usage_count = 1;
        capability.success_count = 1;
        capability.total_latency_ms = result.execution_time_ms;

        registry.insert(capability).map_err(|e| e.to_string())
    }
}

/// Context keys excluded from standalone re-constitution: the
/// reserved names carrying call-site plumbing rather than captured data.
const RESERVED_CONTEXT_KEYS: &[&str] = &["deps", "args", "intent"];

fn standalone_snippet(code: &str, context: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = context
        .keys()
        .filter(|k| !RESERVED_CONTEXT_KEYS.contains(&k.as_str()))
        .collect();
    keys.sort();

    let mut preamble = String::new();
    for key in keys {
        let literal = context
            .get(key)
            .and_then(|v| serde_json::to_string(v).ok())
            .unwrap_or_else(|| "null".to_string());
        preamble.push_str(&format!("const {key} = {literal};\n"));
    }
    format!("{preamble}{code}")
}

fn fqdn_taken(registry: &CapabilityRegistry, candidate: &str) -> bool {
    Fqdn::parse(candidate)
        .map(|fqdn| registry.whois(&fqdn).is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_protocol::request::ExecutionRequest as Req;
    use cellrun_protocol::ErrorKind;
    use cellrun_protocol::ExecutionResultError;
    use serde_json::json;

    fn scope() -> LearningScope {
        LearningScope {
            org: "acme".to_string(),
            project: "widgets".to_string(),
        }
    }

    #[tokio::test]
    async fn ineligible_without_intent_does_not_persist() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handoff = LearningHandoff::new(scope(), Some(Arc::clone(&registry)), None);
        let request = Req::new("2 + 2");
        let result = ExecutionResult::ok(json!(4), 5);
        let trace = TraceCollector::new();

        handoff.handle(&request, &result, None, &trace).await;
        assert_eq!(registry.list("acme", "widgets").len(), 0);
    }

    #[tokio::test]
    async fn ineligible_after_a_failed_tool_call_does_not_persist() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handoff = LearningHandoff::new(scope(), Some(Arc::clone(&registry)), None);
        let request = Req::new("2 + 2").with_intent("add two numbers");
        let result = ExecutionResult::ok(json!(4), 5);
        let trace = TraceCollector::new();
        trace.record_tool_start("t1", None, "fs:read", None);
        trace.record_tool_end("t1", None, "fs:read", false, None, Some("boom".to_string()));

        handoff.handle(&request, &result, None, &trace).await;
        assert_eq!(registry.list("acme", "widgets").len(), 0);
    }

    #[tokio::test]
    async fn eligible_success_with_intent_persists_a_standalone_capability() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handoff = LearningHandoff::new(scope(), Some(Arc::clone(&registry)), None);
        let mut context = HashMap::new();
        context.insert("path".to_string(), json!("/tmp/x"));
        context.insert("deps".to_string(), json!({"fs": true}));
        let request = ExecutionRequest {
            code: "return path;".to_string(),
            context,
            permission_set: Default::default(),
            timeout_ms: None,
            memory_limit_mb: None,
            intent: Some("fs:read_path".to_string()),
            parent_trace_id: None,
        };
        let result = ExecutionResult::ok(json!("/tmp/x"), 5);
        let trace = TraceCollector::new();

        handoff.handle(&request, &result, None, &trace).await;

        let capabilities = registry.list("acme", "widgets");
        assert_eq!(capabilities.len(), 1);
        assert!(capabilities[0].code_snippet.contains("const path"));
        assert!(!capabilities[0].code_snippet.contains("const deps"));
        assert_eq!(capabilities[0].fqdn.namespace, "fs");
        assert_eq!(capabilities[0].fqdn.action, "read_path");
    }

    #[tokio::test]
    async fn failed_execution_is_never_eligible() {
        let registry = Arc::new(CapabilityRegistry::new());
        let handoff = LearningHandoff::new(scope(), Some(Arc::clone(&registry)), None);
        let request = Req::new("throw 1;").with_intent("whatever");
        let result = ExecutionResult::err(
            ExecutionResultError::new(ErrorKind::RuntimeError, "boom"),
            5,
        );
        let trace = TraceCollector::new();

        handoff.handle(&request, &result, None, &trace).await;
        assert_eq!(registry.list("acme", "widgets").len(), 0);
    }
}
