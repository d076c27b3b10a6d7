use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Whether a [`TraceEvent`] opens or closes a span. Every `End` has exactly
/// one matching `Start` with the same `trace_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Start,
    End,
}

/// A traced external-tool call. See.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEvent {
    pub kind: TraceKind,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub tool_id: String,
    /// Monotonic-clock timestamp, milliseconds, relative to the start of the
    /// owning execution.
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A traced capability invocation. Structurally identical to
/// [`ToolTraceEvent`] but keyed by capability identity rather than a raw
/// tool id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityTraceEvent {
    pub kind: TraceKind,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub capability: String,
    pub capability_id: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Discriminated union of every trace record an execution can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TraceEvent {
    Tool(ToolTraceEvent),
    Capability(CapabilityTraceEvent),
}

impl TraceEvent {
    pub fn ts(&self) -> u64 {
        match self {
            TraceEvent::Tool(e) => e.ts,
            TraceEvent::Capability(e) => e.ts,
        }
    }

    pub fn trace_id(&self) -> &str {
        match self {
            TraceEvent::Tool(e) => &e.trace_id,
            TraceEvent::Capability(e) => &e.trace_id,
        }
    }

    pub fn parent_trace_id(&self) -> Option<&str> {
        match self {
            TraceEvent::Tool(e) => e.parent_trace_id.as_deref(),
            TraceEvent::Capability(e) => e.parent_trace_id.as_deref(),
        }
    }

    pub fn kind(&self) -> TraceKind {
        match self {
            TraceEvent::Tool(e) => e.kind,
            TraceEvent::Capability(e) => e.kind,
        }
    }

    pub fn is_tool_end(&self) -> bool {
        matches!(self, TraceEvent::Tool(e) if e.kind == TraceKind::End)
    }

    /// The identifier used to key this event's span: a tool id for tool
    /// events, a capability id for capability events.
    pub fn subject_id(&self) -> &str {
        match self {
            TraceEvent::Tool(e) => &e.tool_id,
            TraceEvent::Capability(e) => &e.capability_id,
        }
    }
}

/// Post-execution view derived by pairing `tool_end` events.
/// Preserves repeats and order: calling the same tool twice yields two
/// distinct invocations with different `sequence_index` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// `"<tool_id>#<seq>"`.
    pub id: String,
    pub tool_id: String,
    pub trace_id: String,
    pub ts: u64,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub sequence_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
