//! Agent configuration loading and parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostagent/hostagent.toml";
pub const CONFIG_ENV: &str = "HOSTAGENT_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub agent: ListenConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub gopher: GopherConfig,
    #[serde(default)]
    pub collect: CollectConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            token_file: default_token_file(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GopherConfig {
    #[serde(default = "default_gopher_config")]
    pub config_path: PathBuf,
}

impl Default for GopherConfig {
    fn default() -> Self {
        Self {
            config_path: default_gopher_config(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectConfig {
    #[serde(default = "default_scanned_applications")]
    pub scanned_applications: Vec<String>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            scanned_applications: default_scanned_applications(),
        }
    }
}

// Default value functions
fn default_ip() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 12000 }
fn default_token_file() -> PathBuf { "/etc/hostagent/token".into() }
fn default_log_level() -> String { "info".into() }
fn default_timeout() -> u64 { 10 }
fn default_gopher_config() -> PathBuf { "/opt/gala-gopher/gala-gopher.conf".into() }
fn default_scanned_applications() -> Vec<String> {
    ["mysql", "kubernetes", "hadoop", "nginx", "docker", "gala-gopher"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Path of the config file: explicit argument, then `HOSTAGENT_CONFIG`,
/// then the default location.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}

/// Load configuration from `path`. A missing file yields the defaults; a
/// file that exists but cannot be parsed is an error.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        Ok(AgentConfig::default())
    }
}

/// Rewrite `[agent].port`, keeping every other key of the file.
pub fn set_port(path: &Path, port: u16) -> Result<()> {
    let mut root: toml::Table = if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?
    } else {
        toml::Table::new()
    };

    let agent = root
        .entry("agent")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let agent = agent
        .as_table_mut()
        .context("[agent] in config is not a table")?;
    agent.insert("port".into(), toml::Value::Integer(i64::from(port)));

    let content = toml::to_string(&root).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, content)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    tracing::info!("Agent port set to {port} in {}", path.display());
    Ok(())
}
