//! External tool client.
//!
//! The RPC bridge needs to reach tool servers that live
//! outside this process. [`ToolClient`] is the seam: one implementation
//! speaks newline-delimited JSON-RPC over a child process's stdio, grounded
//! in `codex-rs`'s `McpConnectionManager` (one client per configured
//! server, spawned over stdio, tools aggregated into a single map keyed by
//! server); a second, [`fake::FakeToolClient`], stands in for it in tests.

mod fake;
mod stdio;

pub use fake::FakeToolClient;
pub use stdio::StdioToolClient;

use std::time::Duration;

use async_trait::async_trait;
use cellrun_protocol::tool::ToolDefinition;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolClientError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response from tool server: {0}")]
    MalformedResponse(String),
}

/// Outcome of one tool call. `is_error` carries the MCP "soft failure"
/// convention (`isError: true` in the result payload) rather than a
/// transport-level error: the call completed, but the tool itself reports
/// failure. Callers (the bridge) trace both cases the same way and only
/// branch on `is_error` for trace bookkeeping, not control flow.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: Value,
    pub is_error: bool,
}

#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolClientError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallOutcome, ToolClientError>;
}
