//! Re-entrant capability execution: the
//! one piece that has to sit in the executor crate rather than
//! `cellrun-bridge`, since running a capability means spinning up a fresh
//! isolate worker, and the bridge crate deliberately does not depend on the
//! isolate crate (see `cellrun_bridge::CapabilityExecutor`'s doc comment).
//!
//! A capability's saved code references its call-time arguments through a
//! context variable named `args` (the one reserved key `cellrun_learning`'s
//! standalone re-constitution never bakes a literal for) — so each nested
//! invocation's `InitMessage.context` carries exactly `{ "args": <call
//! args> }`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use cellrun_bridge::Bridge;
use cellrun_bridge::BridgeScope;
use cellrun_bridge::CapabilityExecutor;
use cellrun_bridge::EventBus;
use cellrun_mcp_client::ToolClient;
use cellrun_protocol::tool::ToolDefinition;
use cellrun_protocol::wire::InitMessage;
use cellrun_protocol::ErrorKind;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::ExecutionResultError;
use cellrun_registry::CapabilityRegistry;
use cellrun_trace::TraceCollector;
use serde_json::Value;
use tokio::runtime::Handle;

pub struct CapabilityRunner {
    scope: BridgeScope,
    registry: Arc<CapabilityRegistry>,
    tool_clients: HashMap<String, Arc<dyn ToolClient>>,
    tool_definitions: Vec<ToolDefinition>,
    event_bus: Arc<dyn EventBus>,
    rpc_timeout: Duration,
    isolate_timeout: Duration,
    tokio_handle: Handle,
    self_ref: OnceLock<Weak<CapabilityRunner>>,
    /// Every nested execution's own trace buffer, keyed by nothing more than
    /// insertion order — retrieved by the facade after the top-level run so
    /// callers who want the full nested tree can walk it by `parentTraceId`.
    /// Nesting is represented by `parentTraceId` links rather than event
    /// containment: these buffers are never merged into the parent's.
    nested_traces: std::sync::Mutex<Vec<Arc<TraceCollector>>>,
}

fn new_bridge_scope(scope: &BridgeScope) -> BridgeScope {
    BridgeScope {
        org: scope.org.clone(),
        project: scope.project.clone(),
    }
}

impl CapabilityRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new_shared(
        scope: BridgeScope,
        registry: Arc<CapabilityRegistry>,
        tool_clients: HashMap<String, Arc<dyn ToolClient>>,
        tool_definitions: Vec<ToolDefinition>,
        event_bus: Arc<dyn EventBus>,
        rpc_timeout: Duration,
        isolate_timeout: Duration,
        tokio_handle: Handle,
    ) -> Arc<Self> {
        let runner = Arc::new(Self {
            scope,
            registry,
            tool_clients,
            tool_definitions,
            event_bus,
            rpc_timeout,
            isolate_timeout,
            tokio_handle,
            self_ref: OnceLock::new(),
            nested_traces: std::sync::Mutex::new(Vec::new()),
        });
        let _ = runner.self_ref.set(Arc::downgrade(&runner));
        runner
    }

    pub fn nested_traces(&self) -> Vec<Arc<TraceCollector>> {
        self.nested_traces
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn self_as_capability_executor(&self) -> Option<Arc<dyn CapabilityExecutor>> {
        self.self_ref.get()?.upgrade().map(|arc| arc as Arc<dyn CapabilityExecutor>)
    }
}

#[async_trait]
impl CapabilityExecutor for CapabilityRunner {
    async fn execute_capability_code(
        &self,
        code: &str,
        args: Value,
        parent_trace_id: Option<String>,
    ) -> Result<ExecutionResult, String> {
        let Some(self_as_executor) = self.self_as_capability_executor() else {
            return Err("capability runner has no live self-reference".to_string());
        };

        let nested_trace = Arc::new(TraceCollector::new());
        if let Ok(mut guard) = self.nested_traces.lock() {
            guard.push(Arc::clone(&nested_trace));
        }

        let nested_bridge = Bridge::new(
            new_bridge_scope(&self.scope),
            Arc::clone(&nested_trace),
            Arc::clone(&self.registry),
            self.tool_clients.clone(),
            self_as_executor,
            Arc::clone(&self.event_bus),
            self.rpc_timeout,
        );

        let mut context = HashMap::new();
        context.insert("args".to_string(), args);

        let init = InitMessage {
            code: code.to_string(),
            tool_definitions: self.tool_definitions.clone(),
            context,
            capability_context: None,
            parent_trace_id,
        };

        let dispatcher: Arc<dyn cellrun_protocol::dispatch::RpcDispatcher> = Arc::new(nested_bridge);
        let tokio_handle = self.tokio_handle.clone();
        let timeout = self.isolate_timeout;

        let result = tokio::task::spawn_blocking(move || {
            cellrun_isolate::run_to_completion(init, dispatcher, tokio_handle, timeout)
        })
        .await
        .unwrap_or_else(|join_error| {
            ExecutionResult::err(
                ExecutionResultError::new(ErrorKind::RuntimeError, format!("capability isolate task panicked: {join_error}")),
                0,
            )
        });

        Ok(result)
    }
}
