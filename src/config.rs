//! Wrapper configuration with file and environment overrides.
//!
//! Loading flow:
//! 1. Start with [`WrapperConfig::default()`]
//! 2. If the config file exists and parses, use it (missing fields keep their defaults)
//! 3. Apply environment variable overrides (highest priority)
//!
//! An unreadable or malformed config file is logged and ignored. A malformed
//! environment override is fatal, since the operator asked for it explicitly.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Environment variable overriding `server.command`
pub const ENV_COMMAND: &str = "MCP_COMMAND";
/// Environment variable overriding `server.args` (JSON array of strings)
pub const ENV_ARGS: &str = "MCP_ARGS";
/// Environment variable overriding `server.port`
pub const ENV_PORT: &str = "PORT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a JSON array of strings: {source}")]
    InvalidArgs {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{var} must be a port number, got {value:?}")]
    InvalidPort { var: &'static str, value: String },
}

/// Top-level configuration record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    pub server: ServerConfig,
}

/// The wrapped MCP server and the HTTP port it is exposed on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used in the health report (`<name>-http-wrapper`)
    pub name: String,
    /// Executable launched as the MCP server
    pub command: String,
    /// Arguments passed to `command`, in order
    pub args: Vec<String>,
    /// Overrides merged over the inherited process environment
    pub env: HashMap<String, String>,
    /// HTTP listen port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "generic-mcp-server".to_string(),
            command: "python".to_string(),
            args: vec!["server.py".to_string()],
            env: HashMap::new(),
            port: 3050,
        }
    }
}

impl ServerConfig {
    /// Service name reported by the health endpoint
    pub fn service_name(&self) -> String {
        format!("{}-http-wrapper", self.name)
    }

    /// Command line rendered for log output
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Load configuration from `path` with overrides from the process environment.
pub fn load_config(path: &Path) -> Result<WrapperConfig, ConfigError> {
    load_config_with(path, |name| std::env::var(name).ok())
}

/// Load configuration from `path`, resolving overrides through `lookup`.
pub fn load_config_with<F>(path: &Path, lookup: F) -> Result<WrapperConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = read_config_file(path).unwrap_or_default();
    apply_env_overrides(&mut config, lookup)?;
    Ok(config)
}

/// Read and parse the config file. `None` when it is absent or unusable.
fn read_config_file(path: &Path) -> Option<WrapperConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return None;
    }

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                "Failed to read config file: {}, using defaults",
                e
            );
            return None;
        }
    };

    match toml::from_str::<WrapperConfig>(&content) {
        Ok(config) => {
            tracing::info!("Loaded configuration from {}", path.display());
            Some(config)
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                "Failed to parse config file: {}, using defaults",
                e
            );
            None
        }
    }
}

/// Apply `MCP_COMMAND`, `MCP_ARGS` and `PORT` on top of `config`.
///
/// Empty values are treated as unset.
pub fn apply_env_overrides<F>(config: &mut WrapperConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(command) = read(ENV_COMMAND) {
        config.server.command = command;
    }
    if let Some(raw) = read(ENV_ARGS) {
        config.server.args = parse_args(&raw)?;
    }
    if let Some(raw) = read(ENV_PORT) {
        config.server.port = parse_port(&raw)?;
    }
    Ok(())
}

fn parse_args(raw: &str) -> Result<Vec<String>, ConfigError> {
    serde_json::from_str(raw).map_err(|source| ConfigError::InvalidArgs {
        var: ENV_ARGS,
        source,
    })
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidPort {
        var: ENV_PORT,
        value: raw.to_string(),
    })
}
