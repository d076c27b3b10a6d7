use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cellrun_protocol::tool::ToolDefinition;
use serde_json::Value;

use crate::ToolCallOutcome;
use crate::ToolClient;
use crate::ToolClientError;

/// Records every call it receives and answers from a canned response table,
/// keyed by tool name. Used by the bridge and executor test suites in place
/// of a real tool server.
pub struct FakeToolClient {
    tools: Vec<ToolDefinition>,
    responses: HashMap<String, ToolCallOutcome>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeToolClient {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools,
            responses: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_response(mut self, tool: impl Into<String>, content: Value) -> Self {
        self.responses.insert(
            tool.into(),
            ToolCallOutcome {
                content,
                is_error: false,
            },
        );
        self
    }

    pub fn with_soft_failure(mut self, tool: impl Into<String>, content: Value) -> Self {
        self.responses.insert(
            tool.into(),
            ToolCallOutcome {
                content,
                is_error: true,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ToolClient for FakeToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolClientError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        _timeout: Option<Duration>,
    ) -> Result<ToolCallOutcome, ToolClientError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((tool.to_string(), arguments));

        match self.responses.get(tool) {
            Some(outcome) => Ok(outcome.clone()),
            None => Err(ToolClientError::UnknownTool(tool.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_calls_and_returns_configured_response() {
        let client = FakeToolClient::new(vec![]).with_response("echo", json!({ "ok": true }));
        let outcome = client
            .call_tool("echo", json!({ "msg": "hi" }), None)
            .await
            .expect("configured tool call succeeds");
        assert!(!outcome.is_error);
        assert_eq!(outcome.content, json!({ "ok": true }));
        assert_eq!(client.calls(), vec![("echo".to_string(), json!({ "msg": "hi" }))]);
    }

    #[tokio::test]
    async fn soft_failure_is_ok_with_is_error_set() {
        let client = FakeToolClient::new(vec![]).with_soft_failure("flaky", json!("boom"));
        let outcome = client.call_tool("flaky", json!({}), None).await.expect("soft failure is not a transport error");
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn unconfigured_tool_is_unknown() {
        let client = FakeToolClient::new(vec![]);
        let err = client.call_tool("missing", json!({}), None).await.unwrap_err();
        assert!(matches!(err, ToolClientError::UnknownTool(_)));
    }
}
