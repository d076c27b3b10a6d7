//! Executor Facade. The single entry point that
//! wires every other component together: validate, admit, pick a path, run,
//! hand off to learning, release the token on every exit. Mirrors the shape
//! of `codex-rs/core/src/codex.rs`'s top-level orchestration — one struct
//! owning the process-wide collaborators, one method per public operation,
//! `tracing` spans around the steps that matter for postmortems.

mod cache;
mod capability_runner;
mod config;

pub use cache::SubprocessResultCache;
pub use capability_runner::CapabilityRunner;
pub use config::CacheConfig;
pub use config::ConfigError;
pub use config::ExecutorConfig;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use cellrun_bridge::Bridge;
use cellrun_bridge::BridgeScope;
use cellrun_bridge::EventBus;
use cellrun_bridge::NullEventBus;
use cellrun_limiter::ResourceLimiter;
use cellrun_limiter::ResourceLimiterConfig;
use cellrun_limiter::ResourceLimitErrorKind;
use cellrun_mcp_client::ToolClient;
use cellrun_permissions::map_permission_set;
use cellrun_protocol::dispatch::RpcDispatcher;
use cellrun_protocol::tool::ToolDefinition;
use cellrun_protocol::wire::InitMessage;
use cellrun_protocol::ErrorKind;
use cellrun_protocol::ExecutionRequest;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::ExecutionResultError;
use cellrun_protocol::ToolInvocation;
use cellrun_protocol::TraceEvent;
use cellrun_registry::CapabilityRegistry;
use cellrun_security::ExecutionTarget;
use cellrun_security::SecurityError;
use cellrun_security::SecurityErrorKind;
use cellrun_security::SecurityValidator;
use cellrun_subprocess::SubprocessRunner;
use cellrun_subprocess::SubprocessRunnerConfig;
use cellrun_trace::TraceCollector;
use cellrun_learning::GraphEngineClient;
use cellrun_learning::LearningHandoff;
use cellrun_learning::LearningScope;
use tokio::runtime::Handle;
use tracing::instrument;
use tracing::warn;

/// `execute_with_tools`'s return value: the `ExecutionResult` plus the
/// trace and called-tools accessors callers need without re-deriving them
/// from a raw event list.
pub struct ExecutionOutcome {
    pub result: ExecutionResult,
    trace: Arc<TraceCollector>,
    nested_traces: Vec<Arc<TraceCollector>>,
}

impl ExecutionOutcome {
    pub fn traces(&self) -> Vec<TraceEvent> {
        self.trace.get_traces()
    }

    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        self.trace.get_tool_invocations()
    }

    pub fn tools_sequence(&self) -> Vec<String> {
        self.trace.get_tools_sequence()
    }

    pub fn tools_called(&self) -> Vec<String> {
        self.trace.get_tools_called()
    }

    /// Trace buffers of every capability invocation nested inside this run,
    /// linked back to it only via each event's `parentTraceId`.
    pub fn nested_traces(&self) -> &[Arc<TraceCollector>] {
        &self.nested_traces
    }
}

pub struct Executor {
    config: ExecutorConfig,
    validator: SecurityValidator,
    limiter: Arc<ResourceLimiter>,
    registry: Arc<CapabilityRegistry>,
    subprocess_runner: SubprocessRunner,
    subprocess_cache: SubprocessResultCache,
    event_bus: Arc<dyn EventBus>,
    learning: LearningHandoff,
    org: String,
    project: String,
    tokio_handle: Handle,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        org: impl Into<String>,
        project: impl Into<String>,
        registry: Arc<CapabilityRegistry>,
        event_bus: Arc<dyn EventBus>,
        graph_engine: Option<Arc<dyn GraphEngineClient>>,
        tokio_handle: Handle,
    ) -> Self {
        let org = org.into();
        let project = project.into();

        let limiter = Arc::new(ResourceLimiter::new(ResourceLimiterConfig {
            max_concurrent: config.max_concurrent,
            max_memory_mb: config.total_memory_cap_mb,
            memory_pressure_sensor_enabled: config.memory_pressure_enabled,
            memory_pressure_threshold_percent: config.memory_pressure_pct,
        }));
        let subprocess_runner = SubprocessRunner::new(SubprocessRunnerConfig {
            interpreter_path: config.interpreter_path.clone(),
            tmp_dir: config.tmp_dir.clone(),
        });
        let subprocess_cache = SubprocessResultCache::new(config.cache.max_entries, config.cache.ttl_seconds);
        let learning = LearningHandoff::new(
            LearningScope {
                org: org.clone(),
                project: project.clone(),
            },
            Some(Arc::clone(&registry)),
            graph_engine,
        );

        Self {
            config,
            validator: SecurityValidator::default(),
            limiter,
            registry,
            subprocess_runner,
            subprocess_cache,
            event_bus,
            learning,
            org,
            project,
            tokio_handle,
        }
    }

    /// `execute(code, context?, permissionSet=minimal) -> ExecutionResult`.
    /// A plain run with no external tools or capability
    /// context; thin wrapper over [`Self::execute_with_tools`].
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_with_tools(request, Vec::new(), HashMap::new(), None, None)
            .await
            .result
    }

    /// `executeWithTools(code, toolDefinitions, mcpClients, context?,
    /// capabilityContext?, permissionSet=minimal) -> ExecutionResult`,
    /// returning the richer [`ExecutionOutcome`] so callers can pull
    /// traces and called-tool lists off the same run without a second pass.
    #[instrument(skip_all, fields(permission_set = %request.permission_set))]
    pub async fn execute_with_tools(
        &self,
        request: ExecutionRequest,
        tool_definitions: Vec<ToolDefinition>,
        tool_clients: HashMap<String, Arc<dyn ToolClient>>,
        capability_context: Option<String>,
        user_id: Option<String>,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        let empty_outcome = |result: ExecutionResult| ExecutionOutcome {
            result,
            trace: Arc::new(TraceCollector::new()),
            nested_traces: Vec::new(),
        };

        // Step 1: choose the execution path before validating, since the
        // validator's denylist has path-specific rules.
        // `isolate_for_basic_run` is the single switch (see DESIGN.md),
        // applying uniformly regardless of whether tool definitions are
        // supplied.
        let target = if self.config.isolate_for_basic_run {
            ExecutionTarget::Isolate
        } else {
            ExecutionTarget::Subprocess
        };

        // Step 2: validate (fast fail, no token held yet).
        if let Err(error) = self.validator.validate(&request.code, &request.context, target) {
            return empty_outcome(ExecutionResult::err(
                security_error_to_execution_error(error),
                start.elapsed().as_millis() as u64,
            ));
        }

        // Step 3: admit. The token is a local binding for the rest of this
        // call, so it releases on every return path including the ones
        // below.
        let memory_limit_mb = request.memory_limit_mb.unwrap_or(self.config.memory_limit_mb);
        let _token = match self.limiter.acquire(memory_limit_mb).await {
            Ok(token) => token,
            Err(error) => {
                return empty_outcome(ExecutionResult::err(
                    ExecutionResultError::new(
                        ErrorKind::ResourceLimitError,
                        format!("{} (current {}, max {})", resource_limit_reason(error.kind), error.current, error.max),
                    ),
                    start.elapsed().as_millis() as u64,
                ));
            }
        };

        let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(self.config.timeout_ms));

        let outcome = match target {
            ExecutionTarget::Isolate => {
                self.run_isolate_path(&request, tool_definitions, tool_clients, capability_context, timeout)
                    .await
            }
            ExecutionTarget::Subprocess => self.run_subprocess_path(&request, timeout, memory_limit_mb).await,
        };

        self.learning.handle(&request, &outcome.result, user_id.as_deref(), &outcome.trace).await;

        outcome
    }

    async fn run_isolate_path(
        &self,
        request: &ExecutionRequest,
        tool_definitions: Vec<ToolDefinition>,
        tool_clients: HashMap<String, Arc<dyn ToolClient>>,
        capability_context: Option<String>,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let trace = Arc::new(TraceCollector::new());
        let capability_runner = CapabilityRunner::new_shared(
            BridgeScope {
                org: self.org.clone(),
                project: self.project.clone(),
            },
            Arc::clone(&self.registry),
            tool_clients.clone(),
            tool_definitions.clone(),
            Arc::clone(&self.event_bus),
            Duration::from_millis(self.config.rpc_timeout_ms),
            timeout,
            self.tokio_handle.clone(),
        );

        let bridge = Bridge::new(
            BridgeScope {
                org: self.org.clone(),
                project: self.project.clone(),
            },
            Arc::clone(&trace),
            Arc::clone(&self.registry),
            tool_clients,
            capability_runner.clone(),
            Arc::clone(&self.event_bus),
            Duration::from_millis(self.config.rpc_timeout_ms),
        );

        let init = InitMessage {
            code: request.code.clone(),
            tool_definitions,
            context: request.context.clone(),
            capability_context,
            parent_trace_id: request.parent_trace_id.clone(),
        };

        let dispatcher: Arc<dyn RpcDispatcher> = Arc::new(bridge);
        let tokio_handle = self.tokio_handle.clone();

        let result = tokio::task::spawn_blocking(move || {
            cellrun_isolate::run_to_completion(init, dispatcher, tokio_handle, timeout)
        })
        .await
        .unwrap_or_else(|join_error| {
            ExecutionResult::err(
                ExecutionResultError::new(ErrorKind::RuntimeError, format!("isolate task panicked: {join_error}")),
                0,
            )
        });

        ExecutionOutcome {
            result,
            trace,
            nested_traces: capability_runner.nested_traces(),
        }
    }

    async fn run_subprocess_path(
        &self,
        request: &ExecutionRequest,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> ExecutionOutcome {
        if self.config.cache.enabled {
            if let Some(cached) = self
                .subprocess_cache
                .get(&request.code, &request.context, request.permission_set)
            {
                return ExecutionOutcome {
                    result: cached,
                    trace: Arc::new(TraceCollector::new()),
                    nested_traces: Vec::new(),
                };
            }
        }

        let mapped = map_permission_set(
            request.permission_set,
            &self.config.data_dir,
            &self.config.tmp_dir,
            &self.config.output_dir,
        );

        let result = self
            .subprocess_runner
            .run(&request.code, &request.context, &mapped.sandbox_policy, timeout, memory_limit_mb)
            .await;

        if self.config.cache.enabled {
            self.subprocess_cache.put(
                &request.code,
                &request.context,
                request.permission_set,
                result.clone(),
            );
        }

        ExecutionOutcome {
            result,
            trace: Arc::new(TraceCollector::new()),
            nested_traces: Vec::new(),
        }
    }
}

fn security_error_to_execution_error(error: SecurityError) -> ExecutionResultError {
    let kind = match error.kind {
        SecurityErrorKind::CodeTooLong => ErrorKind::SecurityError,
        SecurityErrorKind::InvalidContextKey => ErrorKind::PermissionError,
        SecurityErrorKind::DenylistedPattern => ErrorKind::SecurityError,
    };
    ExecutionResultError::new(kind, error.detail)
}

fn resource_limit_reason(kind: ResourceLimitErrorKind) -> &'static str {
    match kind {
        ResourceLimitErrorKind::ConcurrencyExceeded => "maximum concurrent executions exceeded",
        ResourceLimitErrorKind::MemoryExceeded => "execution memory cap exceeded",
        ResourceLimitErrorKind::SystemMemoryPressure => "host memory pressure threshold exceeded",
    }
}

/// Builds an `ExecutorConfig` from `config.toml` (if present, matching
/// `codex-rs`'s config-file convention) and environment overrides, logging
/// a warning rather than failing startup on a malformed file.
pub fn load_config(config_toml_path: &std::path::Path) -> ExecutorConfig {
    let config = match std::fs::read_to_string(config_toml_path) {
        Ok(text) => match ExecutorConfig::from_toml_str(&text) {
            Ok(config) => config,
            Err(error) => {
                warn!("failed to parse {}: {error}; using defaults", config_toml_path.display());
                ExecutorConfig::default()
            }
        },
        Err(_) => ExecutorConfig::default(),
    };
    config.apply_env_overrides()
}

pub fn default_event_bus() -> Arc<dyn EventBus> {
    Arc::new(NullEventBus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_mcp_client::FakeToolClient;
    use cellrun_protocol::tool::ToolDefinition as ToolDef;
    use serde_json::json;

    fn executor_with_config(config: ExecutorConfig) -> Executor {
        Executor::new(
            config,
            "acme",
            "widgets",
            Arc::new(CapabilityRegistry::new()),
            default_event_bus(),
            None,
            Handle::current(),
        )
    }

    #[tokio::test]
    async fn s1_pure_expression_auto_returns_without_tools() {
        let executor = executor_with_config(ExecutorConfig::default());
        let result = executor.execute(ExecutionRequest::new("2 + 2")).await;
        assert!(result.success);
        assert_eq!(result.result, Some(json!(4)));
    }

    #[tokio::test]
    async fn s2_single_tool_call_is_traced_and_reported_as_called() {
        let executor = executor_with_config(ExecutorConfig::default());
        let client = FakeToolClient::new(vec![ToolDef {
            server: "filesystem".to_string(),
            tool: "readFile".to_string(),
            description: "".to_string(),
            input_schema: json!({}),
            is_capability: false,
            capability_fqdn: None,
        }])
        .with_response("readFile", json!({ "content": [{ "text": "hi" }] }));
        let mut clients: HashMap<String, Arc<dyn ToolClient>> = HashMap::new();
        clients.insert("filesystem".to_string(), Arc::new(client));

        let request = ExecutionRequest::new("return await tools.filesystem.readFile({ path: '/tmp/x' });");
        let outcome = executor
            .execute_with_tools(request, vec![], clients, None, None)
            .await;

        assert!(outcome.result.success, "{:?}", outcome.result.error);
        assert_eq!(outcome.tools_called(), vec!["filesystem:readFile".to_string()]);
    }

    #[tokio::test]
    async fn s3_soft_tool_failure_does_not_fail_the_overall_execution() {
        let executor = executor_with_config(ExecutorConfig::default());
        let client = FakeToolClient::new(vec![]).with_soft_failure("readFile", json!({ "text": "not found" }));
        let mut clients: HashMap<String, Arc<dyn ToolClient>> = HashMap::new();
        clients.insert("filesystem".to_string(), Arc::new(client));
        let tool_definitions = vec![ToolDef {
            server: "filesystem".to_string(),
            tool: "readFile".to_string(),
            description: "".to_string(),
            input_schema: json!({}),
            is_capability: false,
            capability_fqdn: None,
        }];

        let request = ExecutionRequest::new("const r = await tools.filesystem.readFile({}); return r;");
        let outcome = executor
            .execute_with_tools(request, tool_definitions, clients, None, None)
            .await;

        assert!(outcome.result.success);
        assert!(outcome.tools_called().contains(&"filesystem:readFile".to_string()));
        assert!(!outcome.tool_invocations().is_empty());
    }

    #[tokio::test]
    async fn s4_overall_timeout_surfaces_as_timeout_error() {
        let mut config = ExecutorConfig::default();
        config.timeout_ms = 20;
        let executor = executor_with_config(config);

        let request = ExecutionRequest::new("while (true) {}");
        let result = executor.execute(request).await;

        assert!(!result.success);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::TimeoutError));
    }

    #[tokio::test]
    async fn s5_denylisted_code_is_rejected_before_any_execution() {
        let executor = executor_with_config(ExecutorConfig::default());
        let request = ExecutionRequest::new("globalThis.process");
        let result = executor.execute(request).await;

        assert!(!result.success);
        assert_eq!(result.error.map(|e| e.kind), Some(ErrorKind::SecurityError));
    }

    #[tokio::test]
    async fn s6_capability_invocation_nests_a_trace_under_the_parent_run() {
        let registry = Arc::new(CapabilityRegistry::new());
        let executor = Executor::new(
            ExecutorConfig::default(),
            "acme",
            "widgets",
            Arc::clone(&registry),
            default_event_bus(),
            None,
            Handle::current(),
        );

        let seed = ExecutionRequest::new("return 2 + 2;").with_intent("math:add");
        let seeded = executor.execute(seed).await;
        assert!(seeded.success);
        let saved = registry.list("acme", "widgets");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].display_name, "math:add");

        let tool_definitions = vec![ToolDef {
            server: "math".to_string(),
            tool: "add".to_string(),
            description: "".to_string(),
            input_schema: json!({}),
            is_capability: true,
            capability_fqdn: Some(saved[0].fqdn.to_string()),
        }];

        let request = ExecutionRequest::new("return await tools.math.add({});");
        let outcome = executor
            .execute_with_tools(request, tool_definitions, HashMap::new(), None, None)
            .await;

        assert!(outcome.result.success, "{:?}", outcome.result.error);
        assert_eq!(outcome.result.result, Some(json!(4)));
        assert_eq!(outcome.nested_traces().len(), 1, "one capability invocation should produce one nested trace buffer");
    }

    #[tokio::test]
    async fn capability_context_functions_emit_capability_start_and_end_traces() {
        let executor = executor_with_config(ExecutorConfig::default());
        let capability_context = r#"
            globalThis.capabilities = {
                double: async function (args) { return args.n * 2; },
            };
        "#
        .to_string();

        let request = ExecutionRequest::new("return await capabilities.double({ n: 21 });");
        let outcome = executor
            .execute_with_tools(request, vec![], HashMap::new(), Some(capability_context), None)
            .await;

        assert!(outcome.result.success, "{:?}", outcome.result.error);
        assert_eq!(outcome.result.result, Some(json!(42)));

        let traces = outcome.traces();
        let starts = traces
            .iter()
            .filter(|e| matches!(e, cellrun_protocol::TraceEvent::Capability(c) if c.kind == cellrun_protocol::TraceKind::Start))
            .count();
        let ends = traces
            .iter()
            .filter(|e| matches!(e, cellrun_protocol::TraceEvent::Capability(c) if c.kind == cellrun_protocol::TraceKind::End && c.success == Some(true)))
            .count();
        assert_eq!(starts, 1, "capability_context function call should emit one capability_start");
        assert_eq!(ends, 1, "capability_context function call should emit one matching capability_end");
    }

    #[tokio::test]
    async fn eligible_run_persists_a_capability_via_the_learning_handoff() {
        let registry = Arc::new(CapabilityRegistry::new());
        let executor = Executor::new(
            ExecutorConfig::default(),
            "acme",
            "widgets",
            Arc::clone(&registry),
            default_event_bus(),
            None,
            Handle::current(),
        );

        let request = ExecutionRequest::new("return 2 + 2;").with_intent("math:add");
        let result = executor.execute(request).await;

        assert!(result.success);
        assert_eq!(registry.list("acme", "widgets").len(), 1);
    }
}
