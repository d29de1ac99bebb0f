use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Decision a policy can hand down for a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    #[default]
    Allow,
    Block,
    Hitl,
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
            Self::Hitl => write!(f, "hitl"),
        }
    }
}

/// Policy for a single `(category, tool)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicyConfig {
    /// Base decision when nothing more specific matches.
    #[serde(default)]
    pub policy: PolicyDecision,
    /// Decision applied when the caller passes a non-empty `workspace_dir`.
    #[serde(default, rename = "workspaceOverride")]
    pub workspace_override: PolicyDecision,
    /// Glob patterns on `params.path` that force a block.
    #[serde(default, rename = "blockPatterns")]
    pub block_patterns: Vec<String>,
    /// Glob patterns on `params.path` that force HITL review.
    #[serde(default, rename = "hitlPatterns")]
    pub hitl_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    /// Fallback policy for tools without an explicit override.
    #[serde(default)]
    pub defaults: ToolPolicyConfig,
    /// Per-category, per-tool overrides: `[tools.overrides.fs.write]`.
    #[serde(default)]
    pub overrides: HashMap<String, HashMap<String, ToolPolicyConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Sandbox root. Every filesystem and shell operation resolves beneath it.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./workspace")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// `.env`-format secrets file; reload is explicit.
    #[serde(default = "default_secrets_file")]
    pub file: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            file: default_secrets_file(),
        }
    }
}

fn default_secrets_file() -> PathBuf {
    PathBuf::from("./secrets.env")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./toolgate.sqlite3")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    /// Default TTL for approval requests, in seconds.
    #[serde(default = "default_hitl_ttl", rename = "defaultTtlSeconds")]
    pub default_ttl_seconds: u64,
    /// Interval of the background expiry sweep.
    #[serde(default = "default_cleanup_interval", rename = "cleanupIntervalSeconds")]
    pub cleanup_interval_seconds: u64,
    /// How long terminal requests stay in memory before eviction.
    #[serde(default = "default_hitl_retention", rename = "retentionSeconds")]
    pub retention_seconds: u64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_hitl_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
            retention_seconds: default_hitl_retention(),
        }
    }
}

fn default_hitl_ttl() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    10
}

fn default_hitl_retention() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Default command timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub timeout: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout: default_shell_timeout(),
        }
    }
}

fn default_shell_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Default request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub hitl: HitlConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Load configuration from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!("config file not found at {}; using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
