//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::id::Udid;
use crate::protocol::constants::DEFAULT_EXPECT_TIMEOUT;

fn default_request_timeout_ms() -> u64 {
    DEFAULT_EXPECT_TIMEOUT.as_millis() as u64
}

/// Configuration for the node bus daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the persistent node cache. In-memory cache when unset.
    pub cache_path: Option<PathBuf>,
    /// How long to wait for each acknowledgement.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Hardware ids of the nodes present on the simulated bus.
    pub nodes: Vec<Udid>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            request_timeout_ms: default_request_timeout_ms(),
            nodes: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!(path = %path.as_ref().display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
