//! Subprocess Runner.
//!
//! The alternative execution path kept alongside the isolate worker for
//! deployments that need OS-level permission granularity or a
//! per-execution memory cap the isolate cannot enforce. Reuses `codex-rs`'s
//! `exec.rs` shape: spawn a
//! fresh child with explicit permission flags, apply a timeout backed by a
//! hard kill on expiry, and recover a single structured result from the
//! child's stdout rather than trusting its exit code alone.
//!
//! The child interpreter is Deno: its `--allow-read`/`--allow-write`/
//! `--allow-net`/`--allow-env`/`--deny-*` flag surface is exactly the shape
//! [`cellrun_permissions::SandboxPolicy::to_subprocess_cli_flags`] already
//! produces, and (unlike Node) it denies every capability by default,
//! which is the posture this runner needs to guarantee regardless of what
//! flags are actually passed.

mod sanitize;
mod wrapper;

pub use sanitize::sanitize_message;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use cellrun_permissions::SandboxPolicy;
use cellrun_protocol::ErrorKind;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::ExecutionResultError;
use serde_json::Value;
use tempfile::Builder as TempFileBuilder;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;
use uuid::Uuid;

/// Prefix the subprocess wrapper script writes before its single result
/// line on stdout.
pub const SENTINEL: &str = "__SANDBOX_RESULT__:";

#[derive(Debug, Clone)]
pub struct SubprocessRunnerConfig {
    /// Path to (or bare name of) the Deno executable. Overridable per
    /// deployment via `cellrun_executor::ExecutorConfig`'s environment
    /// overlay.
    pub interpreter_path: PathBuf,
    /// Directory unique temp files are created under.
    pub tmp_dir: PathBuf,
}

impl Default for SubprocessRunnerConfig {
    fn default() -> Self {
        Self {
            interpreter_path: PathBuf::from("deno"),
            tmp_dir: std::env::temp_dir(),
        }
    }
}

pub struct SubprocessRunner {
    config: SubprocessRunnerConfig,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new(SubprocessRunnerConfig::default())
    }
}

impl SubprocessRunner {
    pub fn new(config: SubprocessRunnerConfig) -> Self {
        Self { config }
    }

    /// Runs `code` (with `context` injected as `const` bindings, same rule
    /// the isolate path applies) to completion in a fresh Deno process.
    /// Always removes the temp script on every exit path and always
    /// returns an [`ExecutionResult`] rather than propagating a transport
    /// error — the contract is the same as the isolate path's
    /// `run_to_completion`.
    pub async fn run(
        &self,
        code: &str,
        context: &HashMap<String, Value>,
        sandbox_policy: &SandboxPolicy,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> ExecutionResult {
        let start = Instant::now();
        let script = wrapper::wrap_with_sentinel(code, context);

        let script_file = match TempFileBuilder::new()
            .prefix(&format!("cellrun-{}-", Uuid::new_v4()))
            .suffix(".js")
            .tempfile_in(&self.config.tmp_dir)
        {
            Ok(file) => file,
            Err(e) => {
                return ExecutionResult::err(
                    ExecutionResultError::new(
                        ErrorKind::RuntimeError,
                        format!("failed to create temp script: {e}"),
                    ),
                    start.elapsed().as_millis() as u64,
                );
            }
        };

        if let Err(e) = tokio::fs::write(script_file.path(), script.as_bytes()).await {
            return ExecutionResult::err(
                ExecutionResultError::new(
                    ErrorKind::RuntimeError,
                    format!("failed to write temp script: {e}"),
                ),
                start.elapsed().as_millis() as u64,
            );
        }

        let temp_path = script_file.path().to_path_buf();
        let result = self
            .spawn_and_collect(&temp_path, sandbox_policy, timeout, memory_limit_mb)
            .await;

        // `script_file` (a `NamedTempFile`) removes the file on drop; this
        // explicit best-effort removal covers the case where the path was
        // already unlinked by something else (e.g. a sandbox that chroots
        // temp dirs) so the drop's own removal attempt does not matter.
        drop(script_file);
        let elapsed = start.elapsed().as_millis() as u64;
        match result {
            Ok(exec_result) => ExecutionResult { execution_time_ms: elapsed, ..exec_result },
            Err(error) => ExecutionResult::err(error, elapsed),
        }
    }

    async fn spawn_and_collect(
        &self,
        script_path: &std::path::Path,
        sandbox_policy: &SandboxPolicy,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> Result<ExecutionResult, ExecutionResultError> {
        let mut flags = sandbox_policy.to_subprocess_cli_flags();
        flags.push(format!(
            "--v8-flags=--max-old-space-size={memory_limit_mb}"
        ));

        let mut command = Command::new(&self.config.interpreter_path);
        command
            .arg("run")
            .args(&flags)
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ExecutionResultError::new(
                ErrorKind::RuntimeError,
                sanitize_message(&format!("failed to spawn sandbox process: {e}"), script_path),
            )
        })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            ExecutionResultError::new(ErrorKind::RuntimeError, "child has no stdout".to_string())
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            ExecutionResultError::new(ErrorKind::RuntimeError, "child has no stderr".to_string())
        })?;

        let wait = tokio::time::timeout(timeout, child.wait());
        let status = match wait.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ExecutionResultError::new(
                    ErrorKind::RuntimeError,
                    format!("failed to wait on sandbox process: {e}"),
                ))
            }
            Err(_) => {
                // Hard kill on timeout expiry.
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutionResultError::new(
                    ErrorKind::TimeoutError,
                    format!("execution deadline of {}ms exceeded", timeout.as_millis()),
                ));
            }
        };

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let _ = stdout.read_to_string(&mut stdout_buf).await;
        let _ = stderr.read_to_string(&mut stderr_buf).await;

        self.interpret_output(status.code(), &stdout_buf, &stderr_buf, script_path)
    }

    fn interpret_output(
        &self,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
        script_path: &std::path::Path,
    ) -> Result<ExecutionResult, ExecutionResultError> {
        let sentinel_line = stdout.lines().find(|line| line.starts_with(SENTINEL));

        let Some(line) = sentinel_line else {
            // Sentinel missing: classify from exit code / stderr rather
            // than treating every process-level failure the same way
            //.
            let sanitized_stderr = sanitize_message(stderr, script_path);
            let kind = classify_process_failure(exit_code, &sanitized_stderr);
            if kind == ErrorKind::RuntimeError && exit_code == Some(0) {
                return Err(ExecutionResultError::new(
                    ErrorKind::RuntimeError,
                    "PARSE_ERROR: sandbox process exited cleanly but produced no result sentinel",
                ));
            }
            return Err(ExecutionResultError::new(
                kind,
                if sanitized_stderr.trim().is_empty() {
                    format!("sandbox process exited with code {:?} and no result sentinel", exit_code)
                } else {
                    sanitized_stderr
                },
            ));
        };

        let payload = line.trim_start_matches(SENTINEL);
        let parsed: Value = match serde_json::from_str(payload) {
            Ok(v) => v,
            Err(e) => {
                return Err(ExecutionResultError::new(
                    ErrorKind::RuntimeError,
                    format!("PARSE_ERROR: malformed sentinel payload: {e}"),
                ))
            }
        };

        let success = parsed.get("success").and_then(Value::as_bool).unwrap_or(false);
        if success {
            let result = parsed.get("result").cloned().unwrap_or(Value::Null);
            Ok(ExecutionResult::ok(result, 0))
        } else {
            let error_obj = parsed.get("error").cloned().unwrap_or(Value::Null);
            let message = error_obj
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("sandbox process reported failure")
                .to_string();
            let type_hint = error_obj.get("type").and_then(Value::as_str).unwrap_or("");
            let stack = error_obj
                .get("stack")
                .and_then(Value::as_str)
                .map(|s| sanitize_message(s, script_path));

            let kind = classify_thrown_error(type_hint, &message);
            let sanitized_message = sanitize_message(&message, script_path);
            let mut err = ExecutionResultError::new(kind, sanitized_message);
            if let Some(stack) = stack {
                err = err.with_stack(stack);
            }
            Err(err)
        }
    }
}

/// Classifies a process-level failure (non-zero exit, or zero exit with no
/// sentinel) by its stderr text.
fn classify_process_failure(exit_code: Option<i32>, stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    if lower.contains("out of memory") || lower.contains("oom") || lower.contains("heap") {
        return ErrorKind::MemoryError;
    }
    if lower.contains("permission denied")
        || lower.contains("requires net access")
        || lower.contains("requires read access")
        || lower.contains("requires write access")
        || lower.contains("requires env access")
        || lower.contains("notcapable")
    {
        return ErrorKind::PermissionError;
    }
    match exit_code {
        Some(code) if code != 0 => ErrorKind::RuntimeError,
        _ => {
            warn!("sandbox process produced unrecognized failure: {stderr}");
            ErrorKind::RuntimeError
        }
    }
}

/// Classifies a structured error the wrapper script itself caught and
/// reported via the sentinel payload.
fn classify_thrown_error(type_hint: &str, message: &str) -> ErrorKind {
    let lower_type = type_hint.to_lowercase();
    let lower_message = message.to_lowercase();
    if lower_type.contains("syntaxerror") || lower_message.contains("unexpected token") {
        ErrorKind::SyntaxError
    } else if lower_message.contains("permission") || lower_message.contains("not granted") {
        ErrorKind::PermissionError
    } else {
        ErrorKind::RuntimeError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_permissions::map_permission_set;
    use cellrun_protocol::PermissionSet;
    use serde_json::json;
    use std::path::Path;

    fn policy() -> SandboxPolicy {
        map_permission_set(
            PermissionSet::Minimal,
            Path::new("/data"),
            Path::new("/tmp"),
            Path::new("./output"),
        )
        .sandbox_policy
    }

    #[test]
    fn interpret_output_parses_successful_sentinel_line() {
        let runner = SubprocessRunner::default();
        let stdout = format!("some noise\n{SENTINEL}{}\n", json!({"success": true, "result": 42}));
        let result = runner
            .interpret_output(Some(0), &stdout, "", Path::new("/tmp/script.js"))
            .expect("parses");
        assert!(result.success);
        assert_eq!(result.result, Some(json!(42)));
    }

    #[test]
    fn interpret_output_maps_thrown_error_to_runtime_error() {
        let runner = SubprocessRunner::default();
        let payload = json!({
            "success": false,
            "error": {"type": "TypeError", "message": "x is not a function"}
        });
        let stdout = format!("{SENTINEL}{payload}\n");
        let err = runner
            .interpret_output(Some(0), &stdout, "", Path::new("/tmp/script.js"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeError);
    }

    #[test]
    fn interpret_output_without_sentinel_and_nonzero_exit_is_runtime_error() {
        let runner = SubprocessRunner::default();
        let err = runner
            .interpret_output(Some(1), "", "boom", Path::new("/tmp/script.js"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeError);
    }

    #[test]
    fn interpret_output_without_sentinel_but_clean_exit_is_parse_error() {
        let runner = SubprocessRunner::default();
        let err = runner
            .interpret_output(Some(0), "no sentinel here", "", Path::new("/tmp/script.js"))
            .unwrap_err();
        assert!(err.message.contains("PARSE_ERROR"));
    }

    #[test]
    fn interpret_output_recognizes_permission_denied_stderr() {
        let runner = SubprocessRunner::default();
        let err = runner
            .interpret_output(Some(1), "", "PermissionDenied: requires net access", Path::new("/tmp/script.js"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionError);
    }

    #[tokio::test]
    async fn run_surfaces_spawn_failure_as_runtime_error_for_a_missing_interpreter() {
        let runner = SubprocessRunner::new(SubprocessRunnerConfig {
            interpreter_path: PathBuf::from("/nonexistent/cellrun-deno-binary"),
            tmp_dir: std::env::temp_dir(),
        });
        let result = runner
            .run("2 + 2", &HashMap::new(), &policy(), Duration::from_secs(5), 64)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::RuntimeError));
    }
}
