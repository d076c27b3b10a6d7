//! Builds the execution-trace projection forwarded to the graph-learning
//! collaborator: `{ initialContext, executedPath, decisions,
//! taskResults, userId, parentTraceId? }`.

use cellrun_protocol::ExecutionRequest;
use cellrun_protocol::ExecutionResult;
use cellrun_trace::TraceCollector;
use serde::Serialize;
use serde_json::Value;

/// One step of the executed path, paired from a `tool_end`/`capability_end`
/// trace event.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub tool_id: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTraceProjection {
    pub initial_context: Value,
    pub executed_path: Vec<String>,
    /// Reserved for branch points a future richer tracer would record; the
    /// current trace model has no decision nodes, so this is always empty.
    pub decisions: Vec<Value>,
    pub task_results: Vec<TaskResult>,
    pub user_id: Option<String>,
    pub parent_trace_id: Option<String>,
}

pub fn build_projection(
    request: &ExecutionRequest,
    _result: &ExecutionResult,
    trace: &TraceCollector,
    user_id: Option<&str>,
) -> ExecutionTraceProjection {
    let invocations = trace.get_tool_invocations();
    let task_results = invocations
        .iter()
        .map(|inv| TaskResult {
            tool_id: inv.tool_id.clone(),
            success: inv.success,
            duration_ms: inv.duration_ms,
            error: inv.error.clone(),
        })
        .collect();

    ExecutionTraceProjection {
        initial_context: serde_json::to_value(&request.context).unwrap_or(Value::Null),
        executed_path: trace.get_tools_sequence(),
        decisions: Vec::new(),
        task_results,
        user_id: user_id.map(str::to_string),
        parent_trace_id: request.parent_trace_id.clone(),
    }
}
