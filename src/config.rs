//! Session tuning and the optional TOML config file.
//!
//! ```toml
//! mode = "pull"
//! filter = "2010-*"
//! shard_len = 7
//!
//! [session]
//! chunk_size = 65536
//! queue_depth = 16
//! handshake_timeout_secs = 30
//! ```

use crate::error::{Result, SyncError};
use crate::replicate::channel::{DATA_CHUNK_SIZE, QUEUE_DEPTH};
use crate::replicate::inventory::{Capability, KeyFilter, Mode};
use crate::replicate::protocol::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Knobs for one replication session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Largest CHUNK payload in bytes
    pub chunk_size: usize,
    /// Frames buffered between each pump task and the wire
    pub queue_depth: usize,
    /// Give up if both HELLOs are not exchanged in time
    pub handshake_timeout_secs: Option<u64>,
    /// Give up if the peer sends nothing for this long during transfer
    pub idle_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DATA_CHUNK_SIZE,
            queue_depth: QUEUE_DEPTH,
            handshake_timeout_secs: None,
            idle_timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_SIZE as usize {
            return Err(SyncError::Config(format!(
                "chunk_size must be between 1 and {} bytes, got {}",
                MAX_FRAME_SIZE, self.chunk_size
            )));
        }
        if self.queue_depth == 0 {
            return Err(SyncError::Config("queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}

/// Contents of `config.toml`. Every field is optional; command-line flags
/// take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub mode: Option<Mode>,
    /// Glob over keys this side advertises
    pub filter: Option<String>,
    /// Regex over keys this side advertises
    pub filter_regex: Option<String>,
    pub shard_len: Option<usize>,
    pub session: SessionConfig,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `<config dir>/blobsync/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("blobsync").join("config.toml"))
    }

    /// Load the default config file if one exists.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Build the local capability from the configured mode and filters.
    pub fn capability(&self) -> Result<Capability> {
        let mut filter = KeyFilter::accept_all();
        if let Some(pattern) = &self.filter {
            filter = filter.and(KeyFilter::glob(pattern)?);
        }
        if let Some(pattern) = &self.filter_regex {
            filter = filter.and(KeyFilter::regex(pattern)?);
        }
        Ok(Capability::from_mode(self.mode.unwrap_or_default()).with_filter(filter))
    }
}
