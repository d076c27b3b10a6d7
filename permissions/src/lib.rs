//! Permission Mapper.
//!
//! A pure function from [`PermissionSet`] to concrete flags. Two views are
//! produced from the same mapping: an informational [`PermissionFlags`] view
//! the RPC bridge consults to decide whether to admit a given call (the
//! isolate itself is always bound to "none" and never sees these flags
//! directly), and a [`SandboxPolicy`] the subprocess runner turns into actual
//! OS-level sandbox configuration — adapted from `codex-rs`'s
//! `SandboxPolicy`/`SandboxPermission` pair in `core/src/protocol.rs`.

use std::path::Path;
use std::path::PathBuf;

use cellrun_protocol::PermissionSet;
use serde::Deserialize;
use serde::Serialize;

/// The I/O category a tool call or pseudo-tool falls into, used by the RPC
/// bridge to decide admission against a [`PermissionFlags`] view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    FsRead,
    FsWrite,
    Network,
    Env,
}

/// Best-effort categorization of an external tool by its server id, used
/// only when the bridge needs to decide whether a `PermissionSet` admits a
/// call to it. Tools whose server name carries no recognizable category are
/// always permitted — the permission set governs I/O categories, not
/// arbitrary business logic (resolved here and recorded in DESIGN.md).
pub fn categorize_server(server: &str) -> Option<Category> {
    let lower = server.to_ascii_lowercase();
    if lower.contains("fs") || lower.contains("file") {
        if lower.contains("write") {
            Some(Category::FsWrite)
        } else {
            Some(Category::FsRead)
        }
    } else if lower.contains("net") || lower.contains("http") || lower.contains("fetch") {
        Some(Category::Network)
    } else if lower.contains("env") {
        Some(Category::Env)
    } else {
        None
    }
}

/// Informational view consulted by the RPC bridge/// path always binds to 'none' ... the permission set governs whether the
/// bridge accepts a given tool call").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionFlags {
    pub full_read: bool,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub allow_net: bool,
    /// Environment variable names the grantee may read. Empty means none.
    pub allow_env: Vec<String>,
}

impl PermissionFlags {
    pub fn permits(&self, category: Category) -> bool {
        match category {
            Category::FsRead => self.full_read || !self.read_paths.is_empty(),
            Category::FsWrite => !self.write_paths.is_empty(),
            Category::Network => self.allow_net,
            Category::Env => !self.allow_env.is_empty(),
        }
    }
}

/// Permissions translated into OS-enforceable subprocess flags.
/// Mirrors `codex-rs`'s `SandboxPolicy` shape: a flat list of grants
/// plus derived accessors, rather than one big struct of booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxPolicy {
    permissions: Vec<SandboxPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxPermission {
    DiskFullReadAccess,
    DiskReadFolder { folder: PathBuf },
    DiskWriteFolder { folder: PathBuf },
    NetworkFullAccess,
    /// A single environment variable the child process is allowed to see.
    EnvAllow { name: String },
}

impl SandboxPolicy {
    pub fn has_full_disk_read_access(&self) -> bool {
        self.permissions
            .iter()
            .any(|p| matches!(p, SandboxPermission::DiskFullReadAccess))
    }

    pub fn has_network_access(&self) -> bool {
        self.permissions
            .iter()
            .any(|p| matches!(p, SandboxPermission::NetworkFullAccess))
    }

    pub fn readable_folders(&self) -> Vec<PathBuf> {
        self.permissions
            .iter()
            .filter_map(|p| match p {
                SandboxPermission::DiskReadFolder { folder } => Some(folder.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn writable_folders(&self) -> Vec<PathBuf> {
        self.permissions
            .iter()
            .filter_map(|p| match p {
                SandboxPermission::DiskWriteFolder { folder } => Some(folder.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn allowed_env_vars(&self) -> Vec<String> {
        self.permissions
            .iter()
            .filter_map(|p| match p {
                SandboxPermission::EnvAllow { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Subprocess path always denies spawn/FFI/prompt regardless of
    /// permission set; these are expressed as
    /// literal CLI flags for the child interpreter rather than entries in
    /// `permissions`, since they are unconditional.
    pub fn to_subprocess_cli_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--deny-run".to_string(),
            "--deny-ffi".to_string(),
            "--deny-prompt".to_string(),
        ];

        if self.has_full_disk_read_access() {
            flags.push("--allow-read".to_string());
        } else {
            let paths = self.readable_folders();
            if !paths.is_empty() {
                flags.push(format!(
                    "--allow-read={}",
                    paths
                        .iter()
                        .map(|p| p.to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                ));
            }
        }

        let write_paths = self.writable_folders();
        if !write_paths.is_empty() {
            flags.push(format!(
                "--allow-write={}",
                write_paths
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }

        if self.has_network_access() {
            flags.push("--allow-net".to_string());
        }

        let env_vars = self.allowed_env_vars();
        if !env_vars.is_empty() {
            flags.push(format!("--allow-env={}", env_vars.join(",")));
        }

        flags
    }
}

/// Result of mapping a [`PermissionSet`]: both views derived from the same
/// decision so the isolate and subprocess paths stay semantically aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPermissions {
    pub isolate_flags: PermissionFlags,
    pub sandbox_policy: SandboxPolicy,
}

/// `permissionSet -> flags[]`. `data_dir`/`tmp_dir`/`output_dir`
/// are the host-configured roots the `readonly`/`filesystem`/`mcp-standard`
/// sets resolve against.
pub fn map_permission_set(
    set: PermissionSet,
    data_dir: &Path,
    tmp_dir: &Path,
    output_dir: &Path,
) -> MappedPermissions {
    match set {
        PermissionSet::Minimal => MappedPermissions {
            isolate_flags: PermissionFlags {
                full_read: false,
                read_paths: vec![],
                write_paths: vec![],
                allow_net: false,
                allow_env: vec![],
            },
            sandbox_policy: SandboxPolicy { permissions: vec![] },
        },
        PermissionSet::Readonly => {
            let paths = vec![data_dir.to_path_buf(), tmp_dir.to_path_buf()];
            MappedPermissions {
                isolate_flags: PermissionFlags {
                    full_read: false,
                    read_paths: paths.clone(),
                    write_paths: vec![],
                    allow_net: false,
                    allow_env: vec![],
                },
                sandbox_policy: SandboxPolicy {
                    permissions: paths
                        .into_iter()
                        .map(|folder| SandboxPermission::DiskReadFolder { folder })
                        .collect(),
                },
            }
        }
        PermissionSet::Filesystem => MappedPermissions {
            isolate_flags: PermissionFlags {
                full_read: true,
                read_paths: vec![],
                write_paths: vec![tmp_dir.to_path_buf()],
                allow_net: false,
                allow_env: vec![],
            },
            sandbox_policy: SandboxPolicy {
                permissions: vec![
                    SandboxPermission::DiskFullReadAccess,
                    SandboxPermission::DiskWriteFolder {
                        folder: tmp_dir.to_path_buf(),
                    },
                ],
            },
        },
        PermissionSet::NetworkApi => MappedPermissions {
            isolate_flags: PermissionFlags {
                full_read: false,
                read_paths: vec![],
                write_paths: vec![],
                allow_net: true,
                allow_env: vec![],
            },
            sandbox_policy: SandboxPolicy {
                permissions: vec![SandboxPermission::NetworkFullAccess],
            },
        },
        PermissionSet::McpStandard => {
            let env_vars = vec!["HOME".to_string(), "PATH".to_string()];
            MappedPermissions {
                isolate_flags: PermissionFlags {
                    full_read: true,
                    read_paths: vec![],
                    write_paths: vec![tmp_dir.to_path_buf(), output_dir.to_path_buf()],
                    allow_net: true,
                    allow_env: env_vars.clone(),
                },
                sandbox_policy: SandboxPolicy {
                    permissions: vec![
                        SandboxPermission::DiskFullReadAccess,
                        SandboxPermission::DiskWriteFolder {
                            folder: tmp_dir.to_path_buf(),
                        },
                        SandboxPermission::DiskWriteFolder {
                            folder: output_dir.to_path_buf(),
                        },
                        SandboxPermission::NetworkFullAccess,
                        SandboxPermission::EnvAllow {
                            name: "HOME".to_string(),
                        },
                        SandboxPermission::EnvAllow {
                            name: "PATH".to_string(),
                        },
                    ],
                },
            }
        }
    }
}
