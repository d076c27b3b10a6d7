use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellrun_protocol::tool::ToolDefinition;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tracing::warn;

use crate::ToolCallOutcome;
use crate::ToolClient;
use crate::ToolClientError;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// One client per external tool server, spoken over the child process's
/// stdio as newline-delimited JSON. Mirrors `McpConnectionManager`'s
/// one-client-per-server model, collapsed here to the single-client seam
/// since fan-out across servers is the RPC bridge's job, not this crate's.
pub struct StdioToolClient {
    server_name: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
    default_timeout: Duration,
    // Keeps the child and its stdout-reader task alive for the client's
    // lifetime; never read directly after construction.
    _child: Child,
}

#[derive(Deserialize)]
struct RawToolEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

#[derive(Deserialize)]
struct RawToolsListResult {
    #[serde(default)]
    tools: Vec<RawToolEntry>,
}

#[derive(Deserialize)]
struct RawResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl StdioToolClient {
    pub async fn spawn(
        server_name: impl Into<String>,
        program: impl AsRef<std::ffi::OsStr>,
        args: Vec<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ToolClientError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = env {
            command.envs(env);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ToolClientError::Transport(format!("failed to spawn server: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolClientError::Transport("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolClientError::Transport("child has no stdout".to_string()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RawResponse>(&line) {
                            Ok(response) => {
                                let mut pending = reader_pending.lock().await;
                                if let Some(sender) = pending.remove(&response.id) {
                                    let value = response.result.unwrap_or_else(|| {
                                        json!({ "error": response.error })
                                    });
                                    let _ = sender.send(value);
                                }
                            }
                            Err(e) => warn!("malformed tool server response, dropping: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("tool server stdout read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            server_name: server_name.into(),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            default_timeout: Duration::from_secs(30),
            _child: child,
        })
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ToolClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = json!({ "id": id, "method": method, "params": params });
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| ToolClientError::Transport(format!("failed to encode request: {e}")))?;
        line.push(b'\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(&line)
                .await
                .map_err(|e| ToolClientError::Transport(format!("write failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| ToolClientError::Transport(format!("flush failed: {e}")))?;
        }

        let wait = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ToolClientError::Transport(
                "tool server closed the connection".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolClientError::Timeout(wait))
            }
        }
    }
}

#[async_trait]
impl ToolClient for StdioToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolClientError> {
        let value = self.send_request("tools/list", json!({}), None).await?;
        let parsed: RawToolsListResult = serde_json::from_value(value)
            .map_err(|e| ToolClientError::MalformedResponse(e.to_string()))?;

        Ok(parsed
            .tools
            .into_iter()
            .map(|entry| ToolDefinition {
                server: self.server_name.clone(),
                tool: entry.name,
                description: entry.description,
                input_schema: entry.input_schema.unwrap_or_else(|| json!({})),
                is_capability: false,
                capability_fqdn: None,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallOutcome, ToolClientError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let value = self.send_request("tools/call", params, timeout).await?;
        let is_error = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = value.get("content").cloned().unwrap_or(value);
        Ok(ToolCallOutcome { content, is_error })
    }
}
