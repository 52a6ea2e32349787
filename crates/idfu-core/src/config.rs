//! Engine configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Tunables for a transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for each control transfer in milliseconds.
    pub control_timeout_ms: u64,
    /// Timeout for each bulk transfer in milliseconds.
    pub bulk_timeout_ms: u64,
    /// Status reads allowed per chunk before giving up.
    pub status_poll_retries: u32,
    /// Delay between status reads in milliseconds.
    pub status_poll_interval_ms: u64,
    /// Status reads after the end-of-image request.
    pub finalize_status_reads: u32,
    /// Reset the device once the image has been finalized.
    pub reset_after_finalize: bool,
    /// Configuration selected when the channel is not yet configured.
    pub configuration: u8,
    /// Interface claimed when the channel has none.
    pub interface: u8,
    pub alt_setting: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            bulk_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            status_poll_retries: DEFAULT_STATUS_RETRIES,
            status_poll_interval_ms: DEFAULT_STATUS_INTERVAL.as_millis() as u64,
            finalize_status_reads: DEFAULT_FINALIZE_STATUS_READS,
            reset_after_finalize: true,
            configuration: DEFAULT_CONFIGURATION,
            interface: DEFAULT_INTERFACE,
            alt_setting: DEFAULT_ALT_SETTING,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.control_timeout(), Duration::from_secs(10));
        assert_eq!(config.status_poll_retries, 20);
        assert_eq!(config.finalize_status_reads, 3);
        assert!(config.reset_after_finalize);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig =
            toml::from_str("status_poll_retries = 5\nreset_after_finalize = false\n").unwrap();
        assert_eq!(config.status_poll_retries, 5);
        assert!(!config.reset_after_finalize);
        assert_eq!(config.configuration, 1);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("idfu-config-{}.toml", std::process::id()));
        let config = EngineConfig {
            status_poll_interval_ms: 0,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
