//! RPC Bridge. One instance per execution; the
//! heart of traceability. Routes every `rpc_call` the isolate (or
//! subprocess wrapper) posts to its eventual target — an in-host capability
//! operation, a nested capability execution, or an external tool client —
//! and records a `tool_start`/`tool_end` pair around every attempt
//! regardless of outcome, mirroring `codex-rs`'s
//! `handle_mcp_tool_call`/`notify_mcp_tool_call_event` begin/end shape in
//! `mcp_tool_call.rs`.

mod events;
mod registry_ops;

pub use events::BridgeEvent;
pub use events::EventBus;
pub use events::NullEventBus;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellrun_mcp_client::ToolClient;
use cellrun_protocol::dispatch::RpcDispatcher;
use cellrun_protocol::trace_event::CapabilityTraceEvent;
use cellrun_protocol::wire::RpcCallMessage;
use cellrun_protocol::wire::RpcResultMessage;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::TraceKind;
use cellrun_registry::CapabilityRegistry;
use cellrun_trace::TraceCollector;
use serde_json::json;
use serde_json::Value;
use uuid::Uuid;

const CAPABILITY_REGISTRY_PREFIX: &str = "std/cap_";
const CAPABILITY_POINTER_SERVER: &str = "$cap";

/// Runs a capability's saved code in a fresh execution context (its own
/// isolate and its own bridge). Implemented by the executor facade, which
/// is the one component that can wire the isolate worker back together
/// with a freshly constructed [`Bridge`] — keeping this crate from having
/// to depend on the isolate crate just to re-enter it.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute_capability_code(
        &self,
        code: &str,
        args: Value,
        parent_trace_id: Option<String>,
    ) -> Result<ExecutionResult, String>;
}

pub struct BridgeScope {
    pub org: String,
    pub project: String,
}

pub struct Bridge {
    scope: BridgeScope,
    trace: Arc<TraceCollector>,
    registry: Arc<CapabilityRegistry>,
    tool_clients: HashMap<String, Arc<dyn ToolClient>>,
    capability_executor: Arc<dyn CapabilityExecutor>,
    event_bus: Arc<dyn EventBus>,
    rpc_timeout: Duration,
}

impl Bridge {
    pub fn new(
        scope: BridgeScope,
        trace: Arc<TraceCollector>,
        registry: Arc<CapabilityRegistry>,
        tool_clients: HashMap<String, Arc<dyn ToolClient>>,
        capability_executor: Arc<dyn CapabilityExecutor>,
        event_bus: Arc<dyn EventBus>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            scope,
            trace,
            registry,
            tool_clients,
            capability_executor,
            event_bus,
            rpc_timeout,
        }
    }

    /// A fresh bridge sharing this one's registry, tool clients, capability
    /// executor, and event bus, but with its own trace buffer — used when a
    /// capability invocation nests: reusing the parent bridge's trace buffer
    /// would overwrite isolate state.
    pub fn nested(&self) -> (Self, Arc<TraceCollector>) {
        let trace = Arc::new(TraceCollector::new());
        let bridge = Self {
            scope: BridgeScope {
                org: self.scope.org.clone(),
                project: self.scope.project.clone(),
            },
            trace: Arc::clone(&trace),
            registry: Arc::clone(&self.registry),
            tool_clients: self.tool_clients.clone(),
            capability_executor: Arc::clone(&self.capability_executor),
            event_bus: Arc::clone(&self.event_bus),
            rpc_timeout: self.rpc_timeout,
        };
        (bridge, trace)
    }

    pub fn trace(&self) -> &Arc<TraceCollector> {
        &self.trace
    }

    /// Emits a `tool_start`/`tool_end` pair around `op`, labelled
    /// `"code:<op>"`, so in-process pure-code operations (filter/map/reduce)
    /// appear as first-class steps to the learning engine.
    pub fn trace_code_op(&self, op: &str, args: Option<Value>, result: Value, success: bool) {
        let trace_id = Uuid::new_v4().to_string();
        let tool_id = format!("code:{op}");
        self.trace.record_tool_start(trace_id.clone(), None, tool_id.clone(), args);
        self.trace
            .record_tool_end(trace_id, None, tool_id, success, Some(result), None);
    }

    /// Brackets a loop body with a `tool_start`/`tool_end` pair labelled
    /// `"loop:<loop_type>"`, carrying loop metadata in `args` so the
    /// execution path recorded for learning is `[loop, ...bodyTools]`.
    pub fn trace_loop_start(&self, loop_id: &str, loop_type: &str, condition: &str, body_tools: &[String]) {
        self.trace.record_tool_start(
            loop_id.to_string(),
            None,
            format!("loop:{loop_type}"),
            Some(json!({
                "loopId": loop_id,
                "loopType": loop_type,
                "loopCondition": condition,
                "bodyTools": body_tools,
            })),
        );
    }

    pub fn trace_loop_end(&self, loop_id: &str, loop_type: &str, success: bool, iterations: u64) {
        self.trace.record_tool_end(
            loop_id.to_string(),
            None,
            format!("loop:{loop_type}"),
            success,
            Some(json!({ "iterations": iterations })),
            None,
        );
    }

    /// Core routing algorithm. Always emits
    /// `tool_start` before dispatch and `tool_end` after, whatever the
    /// outcome, and mirrors both onto the event bus.
    pub async fn handle_rpc_call(&self, call: RpcCallMessage) -> RpcResultMessage {
        let tool_id = format!("{}:{}", call.server, call.tool);
        let trace_id = call.id.clone();
        let parent = call.parent_trace_id.clone();

        self.trace.record_tool_start(
            trace_id.clone(),
            parent.clone(),
            tool_id.clone(),
            Some(call.args.clone()),
        );
        self.event_bus.publish(BridgeEvent::ToolStart {
            trace_id: trace_id.clone(),
            tool_id: tool_id.clone(),
        });

        let outcome = self.resolve_and_invoke(&call).await;

        let (success, result_value, error_message) = match &outcome {
            Ok((value, is_error)) => {
                if *is_error {
                    let message = value
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or("tool reported failure")
                        .to_string();
                    (false, Some(value.clone()), Some(message))
                } else {
                    (true, Some(value.clone()), None)
                }
            }
            Err(message) => (false, None, Some(message.clone())),
        };

        self.trace.record_tool_end(
            trace_id.clone(),
            parent,
            tool_id.clone(),
            success,
            result_value.clone(),
            error_message.clone(),
        );
        self.event_bus.publish(BridgeEvent::ToolEnd {
            trace_id: trace_id.clone(),
            tool_id,
            success,
        });

        match outcome {
            Ok((value, _)) => RpcResultMessage {
                id: call.id,
                success: true,
                result: Some(value),
                error: None,
            },
            Err(message) => RpcResultMessage {
                id: call.id,
                success: false,
                result: None,
                error: Some(message),
            },
        }
    }

    /// Resolves and invokes the call's target, in routing order: reserved
    /// capability-registry ops, then the `$cap` UUID
    /// pointer, then display-name resolution, then an external tool
    /// client. Returns `(payload, is_error)` on a completed call (including
    /// a tool-level soft failure) or `Err(message)` when no target matches
    /// or the call itself could not be completed.
    async fn resolve_and_invoke(&self, call: &RpcCallMessage) -> Result<(Value, bool), String> {
        if let Some(op) = call.server.strip_prefix(CAPABILITY_REGISTRY_PREFIX) {
            return registry_ops::handle(op, &call.args, &self.registry, &self.scope.org, &self.scope.project)
                .map(|value| (value, false));
        }

        if call.server == CAPABILITY_POINTER_SERVER {
            let capability = self
                .registry
                .resolve(&call.tool, &self.scope.org, &self.scope.project)
                .ok_or_else(|| "no such server/tool/capability".to_string())?;
            return self
                .run_capability(&capability.code_snippet, call.args.clone(), Some(call.id.clone()))
                .await;
        }

        let display_name = format!("{}:{}", call.server, call.tool);
        if let Some(capability) = self
            .registry
            .resolve(&display_name, &self.scope.org, &self.scope.project)
        {
            return self
                .run_capability(&capability.code_snippet, call.args.clone(), Some(call.id.clone()))
                .await;
        }

        let client = self
            .tool_clients
            .get(&call.server)
            .ok_or_else(|| "no such server/tool/capability".to_string())?;

        let outcome = client
            .call_tool(&call.tool, call.args.clone(), Some(self.rpc_timeout))
            .await
            .map_err(|e| e.to_string())?;
        Ok((outcome.content, outcome.is_error))
    }

    async fn run_capability(
        &self,
        code: &str,
        args: Value,
        parent_trace_id: Option<String>,
    ) -> Result<(Value, bool), String> {
        let result = self
            .capability_executor
            .execute_capability_code(code, args, parent_trace_id)
            .await?;
        if result.success {
            Ok((result.result.unwrap_or(Value::Null), false))
        } else {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "capability execution failed".to_string());
            Ok((json!({ "error": message }), true))
        }
    }
}

#[async_trait]
impl RpcDispatcher for Bridge {
    async fn dispatch(&self, call: RpcCallMessage) -> RpcResultMessage {
        self.handle_rpc_call(call).await
    }

    /// Merges one capability-context trace event into this bridge's own
    /// trace buffer and mirrors it onto the event bus, matching the
    /// `tool_start`/`tool_end` handling in [`Self::handle_rpc_call`].
    async fn record_capability_event(&self, event: CapabilityTraceEvent) {
        let is_start = event.kind == TraceKind::Start;
        let trace_id = event.trace_id.clone();
        let capability = event.capability.clone();
        let success = event.success.unwrap_or(true);
        self.trace.merge(vec![cellrun_protocol::TraceEvent::Capability(event)]);
        if is_start {
            self.event_bus.publish(BridgeEvent::CapabilityStart { trace_id, capability });
        } else {
            self.event_bus.publish(BridgeEvent::CapabilityEnd { trace_id, capability, success });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_mcp_client::FakeToolClient;
    use cellrun_protocol::tool::ToolDefinition;

    struct FailingCapabilityExecutor;

    #[async_trait]
    impl CapabilityExecutor for FailingCapabilityExecutor {
        async fn execute_capability_code(
            &self,
            _code: &str,
            _args: Value,
            _parent_trace_id: Option<String>,
        ) -> Result<ExecutionResult, String> {
            Err("not used in this test".to_string())
        }
    }

    fn bridge_with_tool_client(client: FakeToolClient) -> (Bridge, Arc<TraceCollector>) {
        let trace = Arc::new(TraceCollector::new());
        let mut clients: HashMap<String, Arc<dyn ToolClient>> = HashMap::new();
        clients.insert("filesystem".to_string(), Arc::new(client));
        let bridge = Bridge::new(
            BridgeScope {
                org: "acme".to_string(),
                project: "widgets".to_string(),
            },
            Arc::clone(&trace),
            Arc::new(CapabilityRegistry::new()),
            clients,
            Arc::new(FailingCapabilityExecutor),
            Arc::new(NullEventBus),
            Duration::from_secs(5),
        );
        (bridge, trace)
    }

    #[tokio::test]
    async fn successful_external_tool_call_traces_start_and_end() {
        let client = FakeToolClient::new(vec![ToolDefinition {
            server: "filesystem".to_string(),
            tool: "readFile".to_string(),
            description: "".to_string(),
            input_schema: json!({}),
            is_capability: false,
            capability_fqdn: None,
        }])
        .with_response("readFile", json!({ "content": [{ "text": "hi" }] }));
        let (bridge, trace) = bridge_with_tool_client(client);

        let result = bridge
            .handle_rpc_call(RpcCallMessage {
                id: "t1".to_string(),
                server: "filesystem".to_string(),
                tool: "readFile".to_string(),
                args: json!({ "path": "/tmp/x" }),
                parent_trace_id: None,
            })
            .await;

        assert!(result.success);
        assert!(trace.every_end_has_matching_start());
        assert_eq!(trace.get_tools_called(), vec!["filesystem:readFile".to_string()]);
    }

    #[tokio::test]
    async fn soft_tool_failure_is_traced_as_failure_but_not_a_transport_error() {
        let client = FakeToolClient::new(vec![]).with_soft_failure("readFile", json!({ "text": "not found" }));
        let (bridge, trace) = bridge_with_tool_client(client);

        let result = bridge
            .handle_rpc_call(RpcCallMessage {
                id: "t1".to_string(),
                server: "filesystem".to_string(),
                tool: "readFile".to_string(),
                args: json!({}),
                parent_trace_id: None,
            })
            .await;

        assert!(result.success, "soft failures still deliver a payload to the isolate");
        assert!(trace.has_any_tool_failed());
    }

    #[tokio::test]
    async fn unknown_target_reports_no_such_server_tool_capability() {
        let (bridge, _trace) = bridge_with_tool_client(FakeToolClient::new(vec![]));
        let result = bridge
            .handle_rpc_call(RpcCallMessage {
                id: "t1".to_string(),
                server: "nonexistent".to_string(),
                tool: "anything".to_string(),
                args: json!({}),
                parent_trace_id: None,
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no such server/tool/capability"));
    }
}
