//! Client-side session configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! server_url = "ws://relay.example:9090"
//! room = "design-review"
//!
//! [data_channel]
//! max_retransmits = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mesh::DataChannelConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Relay WebSocket URL
    pub server_url: String,
    pub room: String,
    pub awareness_throttle_ms: u64,
    pub background_debounce_ms: u64,
    /// Quiet period after a stroke before `ContentChanged` fires
    pub content_debounce_ms: u64,
    pub stale_after_ms: u64,
    pub evict_after_ms: u64,
    pub cleanup_interval_ms: u64,
    pub init_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub dedupe_capacity: usize,
    pub offline_queue_capacity: usize,
    pub data_channel: DataChannelConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            room: "default".to_string(),
            awareness_throttle_ms: 100,
            background_debounce_ms: 100,
            content_debounce_ms: 2_000,
            stale_after_ms: 30_000,
            evict_after_ms: 5 * 60_000,
            cleanup_interval_ms: 30_000,
            init_timeout_ms: 10_000,
            reconnect_interval_ms: 5_000,
            dedupe_capacity: crate::dedupe::DEFAULT_CAPACITY,
            offline_queue_capacity: crate::client::DEFAULT_OFFLINE_QUEUE_CAPACITY,
            data_channel: DataChannelConfig::default(),
        }
    }
}

impl CollabConfig {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            room: room.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_toml(path)
    }

    pub fn awareness_throttle(&self) -> Duration {
        Duration::from_millis(self.awareness_throttle_ms)
    }

    pub fn background_debounce(&self) -> Duration {
        Duration::from_millis(self.background_debounce_ms)
    }

    pub fn content_debounce(&self) -> Duration {
        Duration::from_millis(self.content_debounce_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Read and parse any TOML config file.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.awareness_throttle(), Duration::from_millis(100));
        assert_eq!(config.background_debounce(), Duration::from_millis(100));
        assert_eq!(config.content_debounce(), Duration::from_secs(2));
        assert_eq!(config.stale_after_ms, 30_000);
        assert_eq!(config.evict_after_ms, 300_000);
        assert_eq!(config.dedupe_capacity, 4096);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CollabConfig::from_toml_str(
            r#"
            room = "r1"
            content_debounce_ms = 500

            [data_channel]
            ordered = false
            "#,
        )
        .unwrap();
        assert_eq!(config.room, "r1");
        assert_eq!(config.content_debounce(), Duration::from_millis(500));
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert!(!config.data_channel.ordered);
        assert_eq!(config.data_channel.label, "inkboard");
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = CollabConfig::from_toml_str("room = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_url = \"ws://relay:1\"").unwrap();
        let config = CollabConfig::load(file.path()).unwrap();
        assert_eq!(config.server_url, "ws://relay:1");

        assert!(matches!(
            CollabConfig::load("/definitely/missing.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
