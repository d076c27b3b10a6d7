use serde::Deserialize;
use serde::Serialize;

/// Named capability bundle a submitter chooses for one [`crate::request::ExecutionRequest`].
///
/// `minimal` denies all I/O. The isolate path always binds to "none" at the
/// isolate boundary and routes I/O exclusively through the RPC bridge; the
/// permission set only governs whether the bridge accepts a given tool call.
/// The subprocess path maps the set to concrete OS permission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionSet {
    #[default]
    Minimal,
    Readonly,
    Filesystem,
    NetworkApi,
    McpStandard,
}

impl PermissionSet {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionSet::Minimal => "minimal",
            PermissionSet::Readonly => "readonly",
            PermissionSet::Filesystem => "filesystem",
            PermissionSet::NetworkApi => "network-api",
            PermissionSet::McpStandard => "mcp-standard",
        }
    }
}

impl std::fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
