//! Engine configuration types
//!
//! Each component takes its own section by reference at construction time.
//! There is no process-wide settings object; the application layer owns the
//! values and decides where they come from.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the whole engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub framer: FramerConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Framer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramerConfig {
    /// Largest accepted message length (standard header onwards)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

/// Indexer behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Apply the active filter set while indexing
    #[serde(default = "default_true")]
    pub filters_enabled: bool,

    /// Order the filtered index by storage time
    #[serde(default)]
    pub sort_by_time: bool,

    /// Directory for persisted absolute indices (disabled when None)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Read size per scan step; cancellation is checked once per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Emit a progress event every this many bytes
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            filters_enabled: true,
            sort_by_time: false,
            cache_dir: None,
            chunk_size: default_chunk_size(),
            progress_interval: default_progress_interval(),
        }
    }
}

/// Live connection and log writing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// File that receives live traffic (nothing is written when None)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Also write control messages to the log file
    #[serde(default)]
    pub write_control: bool,

    /// Rotate the log file once it would exceed this many MiB (0 = never)
    #[serde(default)]
    pub max_file_size_mb: u64,

    /// Remove contexts when an UnregisterContext message arrives
    #[serde(default = "default_true")]
    pub update_contexts_on_unregister: bool,

    /// Send GetLogInfo right after a connection comes up
    #[serde(default)]
    pub request_log_info_on_connect: bool,

    /// Bytes read from a link per poll
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            write_control: false,
            max_file_size_mb: 0,
            update_contexts_on_unregister: true,
            request_log_info_on_connect: false,
            read_size: default_read_size(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    usize::from(u16::MAX)
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_progress_interval() -> u64 {
    4 * 1024 * 1024
}

fn default_read_size() -> usize {
    64 * 1024
}

impl EngineConfig {
    /// Create a new engine configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.framer.max_message_size = size;
        self
    }

    /// Builder method: enable or disable filtering during indexing
    pub fn with_filters(mut self, enabled: bool) -> Self {
        self.indexer.filters_enabled = enabled;
        self
    }

    /// Builder method: enable sort by time
    pub fn with_sort_by_time(mut self, enabled: bool) -> Self {
        self.indexer.sort_by_time = enabled;
        self
    }

    /// Builder method: persist indices in this directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.indexer.cache_dir = Some(dir.into());
        self
    }

    /// Builder method: set the live log file
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection.log_file = Some(path.into());
        self
    }

    /// Builder method: write control messages to the log file
    pub fn with_write_control(mut self, enabled: bool) -> Self {
        self.connection.write_control = enabled;
        self
    }

    /// Builder method: rotate the log file at this size
    pub fn with_max_file_size_mb(mut self, size: u64) -> Self {
        self.connection.max_file_size_mb = size;
        self
    }

    /// Check the values that would make components misbehave
    pub fn validate(&self) -> crate::Result<()> {
        if self.framer.max_message_size < 4 {
            return Err(crate::EngineError::Config("max_message_size must be at least 4".into()));
        }
        if self.indexer.chunk_size == 0 {
            return Err(crate::EngineError::Config("chunk_size must be positive".into()));
        }
        if self.connection.read_size == 0 {
            return Err(crate::EngineError::Config("read_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new()
            .with_sort_by_time(true)
            .with_cache_dir("/tmp/cache")
            .with_log_file("live.dlt")
            .with_write_control(true)
            .with_max_file_size_mb(10);

        assert!(config.indexer.sort_by_time);
        assert!(config.indexer.filters_enabled);
        assert_eq!(config.indexer.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(config.connection.log_file, Some(PathBuf::from("live.dlt")));
        assert!(config.connection.write_control);
        assert_eq!(config.connection.max_file_size_mb, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.framer.max_message_size, 65535);
        assert!(config.connection.update_contexts_on_unregister);
        assert!(!config.connection.request_log_info_on_connect);
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let mut config = EngineConfig::new();
        config.indexer.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
