//! Configuration file support for vpnmgrd
//!
//! Loads and validates vpnmgrd configuration from TOML files.
//! Default location: /etc/sonic/vpnmgrd.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use vpnmgr_common::{DeferConfig, DeferError, Result};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/vpnmgrd.toml";

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Learned MAC entry cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacCacheConfig {
    /// Lifetime of a learned entry in seconds
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,

    /// Reaper wake-up interval in milliseconds
    #[serde(default = "default_reaper_tick_ms")]
    pub reaper_tick_ms: u64,
}

/// Complete vpnmgrd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnMgrConfig {
    /// Dependency coordinator configuration
    #[serde(default)]
    pub defer: DeferConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// MAC entry cache configuration
    #[serde(default)]
    pub mac_cache: MacCacheConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_entry_ttl_secs() -> u64 {
    300
}

fn default_reaper_tick_ms() -> u64 {
    1000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for MacCacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: default_entry_ttl_secs(),
            reaper_tick_ms: default_reaper_tick_ms(),
        }
    }
}

impl VpnMgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                DeferError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "vpnmgrd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(DeferError::Io(e)),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DeferError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get MAC entry lifetime as Duration
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.mac_cache.entry_ttl_secs)
    }

    /// Get reaper interval as Duration
    pub fn reaper_tick(&self) -> Duration {
        Duration::from_millis(self.mac_cache.reaper_tick_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.defer.validate()?;

        if self.mac_cache.entry_ttl_secs == 0 {
            return Err(DeferError::Config(
                "entry_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.mac_cache.reaper_tick_ms == 0 {
            return Err(DeferError::Config(
                "reaper_tick_ms must be > 0".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(DeferError::Config("logging level must be set".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use vpnmgr_common::ResolutionMode;

    #[test]
    fn test_default_config() {
        let config = VpnMgrConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.entry_ttl(), Duration::from_secs(300));
        assert_eq!(config.reaper_tick(), Duration::from_secs(1));
        assert_eq!(config.defer, DeferConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[defer]
default_retry_budget = 5
default_resolution_mode = "poll"

[mac_cache]
entry_ttl_secs = 60
"#;

        let config: VpnMgrConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.defer.default_retry_budget, 5);
        assert_eq!(config.defer.default_resolution_mode, ResolutionMode::Poll);
        assert_eq!(config.mac_cache.entry_ttl_secs, 60);
        // Unspecified values should use defaults
        assert_eq!(config.defer.default_poll_interval_ms, 1000);
        assert_eq!(config.mac_cache.reaper_tick_ms, 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = VpnMgrConfig::load_or_default("/nonexistent/vpnmgrd.toml").unwrap();
        assert_eq!(config, VpnMgrConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        let config = VpnMgrConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[defer\nsweep_tick_ms = ").unwrap();

        let result = VpnMgrConfig::load_or_default(file.path());
        assert!(matches!(result, Err(DeferError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnmgrd.toml");

        let mut config = VpnMgrConfig::default();
        config.defer.sweep_tick_ms = 250;
        config.mac_cache.entry_ttl_secs = 42;
        config.save(&path).unwrap();

        let loaded = VpnMgrConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let mut config = VpnMgrConfig::default();
        config.mac_cache.entry_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = VpnMgrConfig::default();
        config.defer.sweep_tick_ms = 0;
        assert!(config.validate().is_err());
    }
}
