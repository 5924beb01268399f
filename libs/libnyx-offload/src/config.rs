//! Bridge configuration

use crate::error::{OffloadError, Result};
use crate::wire::HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file name
pub const CONFIG_FILE: &str = "offload.toml";

/// Offload bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Handshake reply timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Largest frame sent to the remote processor, header included
    pub max_frame_size: usize,

    /// Number of distinct remote endpoint names served at once
    pub max_services: usize,

    /// Endpoint name field size, terminating NUL included
    pub max_name_len: usize,

    /// Buffers importable from one shared reference
    pub max_shared_buffers: usize,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            max_frame_size: 512,
            max_services: 8,
            max_name_len: 48,
            max_shared_buffers: 2,
        }
    }
}

impl OffloadConfig {
    /// Load configuration from a TOML file, falling back to defaults if absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| OffloadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| OffloadError::Config(e.to_string()))
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(OffloadError::Config("connect_timeout_ms must be non-zero".into()));
        }
        if self.max_frame_size <= HEADER_SIZE {
            return Err(OffloadError::Config(format!(
                "max_frame_size must exceed the {}-byte header",
                HEADER_SIZE
            )));
        }
        if self.max_frame_size < HEADER_SIZE + self.max_name_len {
            return Err(OffloadError::Config(
                "max_frame_size cannot carry a connect request".into(),
            ));
        }
        if self.max_services == 0 || self.max_services > u16::MAX as usize {
            return Err(OffloadError::Config("max_services out of range".into()));
        }
        if self.max_name_len < 2 {
            return Err(OffloadError::Config("max_name_len must be at least 2".into()));
        }
        Ok(())
    }

    /// Handshake timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Largest application payload a single write may carry
    pub fn max_payload(&self) -> usize {
        self.max_frame_size - HEADER_SIZE
    }
}
