use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Describes one external call the isolate/subprocess may invoke. Definitions
/// are serializable and injected at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: Value,

    #[serde(default)]
    pub is_capability: bool,

    #[serde(default)]
    pub capability_fqdn: Option<String>,
}

impl ToolDefinition {
    /// The `"<server>:<tool>"` key used for display-name resolution
    /// and for the deduplicated `toolsCalled` set.
    pub fn tool_id(&self) -> String {
        format!("{}:{}", self.server, self.tool)
    }
}

/// Request half of the RPC envelope the isolate sends to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelopeRequest {
    /// Unique within one execution; used to correlate request and response.
    pub id: String,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub parent_trace_id: Option<String>,
}

/// Response half of the RPC envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelopeResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcEnvelopeResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
