use thiserror::Error;

pub type Result<T> = std::result::Result<T, CellrunErr>;

/// Stable error kinds surfaced in [`crate::result::ExecutionResultError`],
/// regardless of which execution path (isolate or subprocess) produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    SyntaxError,
    RuntimeError,
    TimeoutError,
    MemoryError,
    PermissionError,
    SecurityError,
    ResourceLimitError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::PermissionError => "PermissionError",
            ErrorKind::SecurityError => "SecurityError",
            ErrorKind::ResourceLimitError => "ResourceLimitError",
        }
    }
}

/// Workspace-wide error type. Leaf crates define their own narrower errors
/// (e.g. `cellrun_security::SecurityError`) and convert into this one at the
/// facade boundary, the same way `codex-rs`'s `CodexErr` absorbs
/// `SandboxErr` via `#[from]`.
#[derive(Error, Debug)]
pub enum CellrunErr {
    #[error("security validation failed: {0}")]
    Security(String),

    #[error("resource limit exceeded: kind={kind}, current={current}, max={max}")]
    ResourceLimit {
        kind: &'static str,
        current: u64,
        max: u64,
    },

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("memory limit exceeded: used {used_mb}MB, limit {limit_mb}MB")]
    Memory { used_mb: u64, limit_mb: u64 },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("no such server/tool/capability: {0}")]
    NoSuchTarget(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CellrunErr {
    /// Maps any workspace error onto one of the seven stable kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CellrunErr::Security(_) => ErrorKind::SecurityError,
            CellrunErr::ResourceLimit { .. } => ErrorKind::ResourceLimitError,
            CellrunErr::Timeout(_) => ErrorKind::TimeoutError,
            CellrunErr::Memory { .. } => ErrorKind::MemoryError,
            CellrunErr::Permission(_) => ErrorKind::PermissionError,
            CellrunErr::Syntax(_) => ErrorKind::SyntaxError,
            CellrunErr::Runtime(_) | CellrunErr::NoSuchTarget(_) => ErrorKind::RuntimeError,
            CellrunErr::Io(_) | CellrunErr::Json(_) => ErrorKind::RuntimeError,
        }
    }
}
