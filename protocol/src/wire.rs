//! Host ↔ isolate wire messages. These are the serialized messages
//! exchanged between the executor/bridge (host side) and the isolate worker
//! (guest side); the subprocess path's sentinel-framed JSON line
//! carries only the terminal [`ExecutionCompleteMessage`] payload, since a
//! subprocess has no back-channel for `rpc_call`/`rpc_result` traffic other
//! than the process's own stdio, which the subprocess runner does not
//! multiplex.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::tool::ToolDefinition;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Init(InitMessage),
    RpcResult(RpcResultMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    RpcCall(RpcCallMessage),
    ExecutionComplete(ExecutionCompleteMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitMessage {
    pub code: String,
    pub tool_definitions: Vec<ToolDefinition>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// Source evaluated first, before `code`, to define callable capability
    /// functions in scope.
    #[serde(default)]
    pub capability_context: Option<String>,
    #[serde(default)]
    pub parent_trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCallMessage {
    pub id: String,
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub parent_trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResultMessage {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionCompleteMessage {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::result::ExecutionResultError>,
}
