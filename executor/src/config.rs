//! Configuration surface. Loaded the
//! way `codex-rs/core/src/config.rs` loads `config.toml`: a `toml`-deserialized
//! struct with `Default` impls matching every key's listed default, optionally
//! overlaid by environment variables for deployment-specific overrides —
//! mirroring `codex-arg0`'s `dotenvy::from_path`/`dotenvy::dotenv` use.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Subprocess path only: the isolate path re-enters a fresh
    /// `Context` per run and has no comparable spawn cost to amortize.
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 100,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub rpc_timeout_ms: u64,
    pub max_concurrent: usize,
    pub total_memory_cap_mb: u64,
    pub memory_pressure_enabled: bool,
    pub memory_pressure_pct: u8,
    pub cache: CacheConfig,
    /// Isolate by default for a plain `execute` call with no tool
    /// definitions; the subprocess path is reserved for
    /// when configuration or permission requirements demand OS-level
    /// enforcement.
    pub isolate_for_basic_run: bool,

    /// Path (or bare name) of the child interpreter the subprocess runner
    /// spawns, needed to construct `cellrun_subprocess::SubprocessRunnerConfig`
    /// — the deployment-specific override `CELLRUN_INTERPRETER_PATH` exists
    /// for exactly this field.
    pub interpreter_path: PathBuf,
    /// Root the `readonly`/`filesystem`/`mcp-standard` permission sets
    /// resolve their read grant against (`cellrun_permissions::map_permission_set`).
    pub data_dir: PathBuf,
    /// Root both permission sets' write grant and the subprocess runner's
    /// temp-script directory resolve against.
    pub tmp_dir: PathBuf,
    /// Root the `mcp-standard` permission set's write grant additionally
    /// covers.
    pub output_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let tmp_dir = std::env::temp_dir();
        Self {
            timeout_ms: 30_000,
            memory_limit_mb: 512,
            rpc_timeout_ms: 10_000,
            max_concurrent: 10,
            total_memory_cap_mb: 3072,
            memory_pressure_enabled: false,
            memory_pressure_pct: 80,
            cache: CacheConfig::default(),
            isolate_for_basic_run: true,
            interpreter_path: PathBuf::from("deno"),
            data_dir: tmp_dir.clone(),
            tmp_dir: tmp_dir.clone(),
            output_dir: tmp_dir,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse executor config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ExecutorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads `.env` (via `dotenvy`, matching `codex-arg0::load_dotenv`) and
    /// overlays any of the recognized `CELLRUN_*` variables onto `self`.
    /// Unset variables leave the corresponding field untouched.
    pub fn apply_env_overrides(mut self) -> Self {
        dotenvy::dotenv().ok();

        if let Ok(v) = std::env::var("CELLRUN_INTERPRETER_PATH") {
            self.interpreter_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CELLRUN_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CELLRUN_TMP_DIR") {
            self.tmp_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CELLRUN_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CELLRUN_TIMEOUT_MS").and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent)) {
            self.timeout_ms = v;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_configuration_surface() {
        let config = ExecutorConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.memory_limit_mb, 512);
        assert_eq!(config.rpc_timeout_ms, 10_000);
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.total_memory_cap_mb, 3072);
        assert!(!config.memory_pressure_enabled);
        assert_eq!(config.memory_pressure_pct, 80);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.cache.ttl_seconds, 300);
        assert!(config.isolate_for_basic_run);
    }

    #[test]
    fn partial_toml_overlays_only_the_listed_keys() {
        let config = ExecutorConfig::from_toml_str(
            r#"
            timeout_ms = 5000
            [cache]
            enabled = false
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.timeout_ms, 5000);
        assert!(!config.cache.enabled);
        // Unlisted keys keep their defaults.
        assert_eq!(config.max_concurrent, 10);
    }

    #[test]
    fn empty_toml_document_yields_defaults() {
        let config = ExecutorConfig::from_toml_str("").expect("empty document is valid");
        assert_eq!(config, ExecutorConfig::default());
    }
}
