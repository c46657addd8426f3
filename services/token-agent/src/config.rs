//! Configuration types and loading
//!
//! Config precedence: `--config` CLI arg > `CONFIG_PATH` env var > default
//! file name. The helper command is the only token source; its output never
//! lands in the config file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use token_lifecycle::RefreshPolicy;

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub refresh: RefreshPolicy,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

/// Credential helper invocation
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// File that receives every refreshed token
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub path: PathBuf,
}

/// Prometheus scrape endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub listen_addr: SocketAddr,
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetcher.command.trim().is_empty() {
            return Err(Error::Config("fetcher.command must not be empty".into()));
        }

        if self.fetcher.timeout_secs == 0 {
            return Err(Error::Config(
                "fetcher.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sinks.is_empty() {
            return Err(Error::Config("at least one [[sinks]] entry is required".into()));
        }

        if let Some(sink) = self.sinks.iter().find(|s| s.path.file_name().is_none()) {
            return Err(Error::Config(format!(
                "sink path must name a file, got: {}",
                sink.path.display()
            )));
        }

        self.refresh
            .validate()
            .map_err(|e| Error::Config(format!("[refresh]: {e}")))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-agent.toml")
    }
}
