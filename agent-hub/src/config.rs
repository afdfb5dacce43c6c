//! Hub configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which bus implementation the hub hands to its agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Deliver and forget
    Plain,
    /// Remember the last value per topic and replay it to late subscribers
    #[default]
    Stateful,
}

/// Overall hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Lower bound applied to every periodic agent's period (milliseconds)
    #[serde(default = "default_min_period_ms")]
    pub min_period_ms: u64,

    /// Capacity of the channel between the upstream feed and the dispatcher
    #[serde(default = "default_tick_buffer")]
    pub tick_buffer: usize,

    #[serde(default)]
    pub bus: BusKind,

    /// Upstream reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            min_period_ms: default_min_period_ms(),
            tick_buffer: default_tick_buffer(),
            bus: BusKind::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn min_period(&self) -> Duration {
        Duration::from_millis(self.min_period_ms)
    }
}

fn default_min_period_ms() -> u64 {
    10
}

fn default_tick_buffer() -> usize {
    1024
}

/// Exponential backoff for upstream reconnects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Random spread applied to each delay, as a fraction of it
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Consecutive failed attempts before giving up; retry forever when unset
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect number `attempt` (0-based): doubling from the base delay,
    /// capped at the max delay, with ± `jitter_factor` spread.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2f64.powi(attempt.min(32) as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            (fastrand::f64() * 2.0 - 1.0) * range
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

/// Parse a hub configuration from TOML
pub fn from_toml_str(content: &str) -> anyhow::Result<HubConfig> {
    Ok(toml::from_str(content)?)
}

/// Load a hub configuration from a TOML file
pub fn load_config(path: &str) -> anyhow::Result<HubConfig> {
    let content = std::fs::read_to_string(path)?;
    from_toml_str(&content)
}
