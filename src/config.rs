//! Fleet configuration.
//!
//! Owned here rather than by any CLI layer: the list of engine endpoints
//! to manage, optional TLS material for reaching them, the snapshot file
//! path and the health-poll cadence. Loadable from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default snapshot location.
pub const DEFAULT_SNAPSHOT_PATH: &str = "/tmp/garrison.state";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// TLS certificate material for engine endpoints that require it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA certificate path.
    pub ca_cert: PathBuf,
    /// Client certificate path.
    pub client_cert: PathBuf,
    /// Client key path.
    pub client_key: PathBuf,
}

/// Top-level fleet manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Engine endpoint addresses to connect on a first run.
    pub endpoints: Vec<String>,
    /// TLS material, applied to every endpoint connection when present.
    pub tls: Option<TlsConfig>,
    /// Snapshot file path.
    pub snapshot_path: PathBuf,
    /// Health poll period in seconds.
    pub poll_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            tls: None,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            poll_interval_secs: 1,
        }
    }
}

impl FleetConfig {
    /// The health poll period as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read and
    /// [`ConfigError::Parse`] on malformed TOML.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }
}
