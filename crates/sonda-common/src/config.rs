//! Session configuration

use crate::types::Fingerprint;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one ping session.
///
/// Immutable once handed to a session. Every field has a sensible default,
/// so `PingConfiguration::default()` pings once a second with a two second
/// reply timeout, forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfiguration {
    /// Delay between consecutive probes, in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// How long to wait for an echo reply before declaring a probe lost,
    /// in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on a single socket send, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Time-to-live for outgoing packets; kernel default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,

    /// ICMP payload size in bytes; never less than the 16-byte
    /// correlation token
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,

    /// Stop after this many probes; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_count: Option<u64>,

    /// When the target count is reached, also tear the socket down
    /// ("halt") instead of merely stopping the schedule
    #[serde(default)]
    pub halt_after_target: bool,

    /// Run the receive loop on a dedicated OS thread instead of a task on
    /// the caller's runtime
    #[serde(default)]
    pub dedicated_worker: bool,
}

impl Default for PingConfiguration {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            ttl: None,
            payload_size: default_payload_size(),
            target_count: None,
            halt_after_target: false,
            dedicated_worker: false,
        }
    }
}

// Default value functions
fn default_interval_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_send_timeout_ms() -> u64 {
    1_000
}
fn default_payload_size() -> usize {
    56
}

impl PingConfiguration {
    /// Delay between consecutive probes
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Reply timeout per probe
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Bound on a single socket send
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Check the configuration for values a session cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_ms == 0 {
            return Err(crate::Error::Config(
                "probe interval must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(crate::Error::Config(
                "reply timeout must be greater than zero".to_string(),
            ));
        }
        if self.payload_size < Fingerprint::LEN {
            return Err(crate::Error::Config(format!(
                "payload size {} is below the {}-byte correlation token",
                self.payload_size,
                Fingerprint::LEN
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        let config: PingConfiguration = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {}", e)))?;

        Ok(())
    }
}
