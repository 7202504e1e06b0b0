//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use crate::error::EngineError;

/// Tunable knobs for the routing/connection engine.
///
/// Loaded from TOML by hosts that expose a config file; everything has a
/// default suitable for production.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-route buffered packet ceiling.
    #[serde(default = "default_buffer_packets")]
    pub buffer_max_packets: usize,
    /// Per-route buffered byte ceiling.
    #[serde(default = "default_buffer_bytes")]
    pub buffer_max_bytes: usize,
    /// A connected route idle longer than this is evicted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How often the idle sweeper runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Per-candidate reachability probe budget.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How many catalog candidates to probe, best-first.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Server catalog cache lifetime.
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
    /// How long a handshake may take before the attempt fails.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_buffer_packets() -> usize {
    100
}

fn default_buffer_bytes() -> usize {
    256 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_max_candidates() -> usize {
    5
}

fn default_catalog_ttl_secs() -> u64 {
    15 * 60
}

fn default_handshake_timeout_secs() -> u64 {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_max_packets: default_buffer_packets(),
            buffer_max_bytes: default_buffer_bytes(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_candidates: default_max_candidates(),
            catalog_ttl_secs: default_catalog_ttl_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, EngineError> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.buffer_max_packets, 100);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert!(config.sweep_interval() < config.idle_timeout());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml("idle_timeout_secs = 60\nmax_candidates = 3\n").unwrap();
        assert_eq!(config.idle_timeout_secs, 60);
        assert_eq!(config.max_candidates, 3);
        assert_eq!(config.buffer_max_packets, 100);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_toml("idle_timeout_secs = \"soon\""),
            Err(EngineError::Config(_))
        ));
    }
}
