//! Tunables for the dependency coordinator.

use crate::error::{DeferError, Result};
use crate::event::ResolutionMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator configuration, usually the `[defer]` section of the daemon
/// config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferConfig {
    /// Poll intervals an event may stay deferred before it expires
    #[serde(default = "default_retry_budget")]
    pub default_retry_budget: u32,

    /// Interval between direct re-reads of an event's dependencies
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Resolution mode for events built through the coordinator
    #[serde(default)]
    pub default_resolution_mode: ResolutionMode,

    /// Granularity of the sweep timer
    #[serde(default = "default_sweep_tick_ms")]
    pub sweep_tick_ms: u64,

    /// Subscription attempts before a listener is abandoned
    #[serde(default = "default_registration_max_attempts")]
    pub registration_max_attempts: u32,

    /// Pause between subscription attempts
    #[serde(default = "default_registration_retry_tick_ms")]
    pub registration_retry_tick_ms: u64,
}

fn default_retry_budget() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_sweep_tick_ms() -> u64 {
    100
}

fn default_registration_max_attempts() -> u32 {
    8
}

fn default_registration_retry_tick_ms() -> u64 {
    500
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            default_retry_budget: default_retry_budget(),
            default_poll_interval_ms: default_poll_interval_ms(),
            default_resolution_mode: ResolutionMode::default(),
            sweep_tick_ms: default_sweep_tick_ms(),
            registration_max_attempts: default_registration_max_attempts(),
            registration_retry_tick_ms: default_registration_retry_tick_ms(),
        }
    }
}

impl DeferConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.default_poll_interval_ms)
    }

    pub fn sweep_tick(&self) -> Duration {
        Duration::from_millis(self.sweep_tick_ms)
    }

    pub fn registration_retry_tick(&self) -> Duration {
        Duration::from_millis(self.registration_retry_tick_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_retry_budget == 0 {
            return Err(DeferError::Config(
                "default_retry_budget must be > 0".to_string(),
            ));
        }
        if self.default_poll_interval_ms == 0 {
            return Err(DeferError::Config(
                "default_poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.sweep_tick_ms == 0 {
            return Err(DeferError::Config("sweep_tick_ms must be > 0".to_string()));
        }
        if self.registration_max_attempts == 0 {
            return Err(DeferError::Config(
                "registration_max_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
