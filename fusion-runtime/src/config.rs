//! Runtime configuration.
//!
//! Every field has a documented default, so an empty TOML document is a valid
//! config. Durations are stored as integer milliseconds and exposed as
//! `Duration` through accessors.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, InvalidConfigSnafu};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub registry: RegistryConfig,
    pub bus: BusConfig,
    pub errors: ErrorServiceConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text).context(ConfigParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.registry.validate()?;
        self.bus.validate()?;
        self.errors.validate()
    }
}

/// Component load registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Background preload loop period. Default 2 s.
    pub tick_interval_ms: u64,
    /// Loaded entries untouched for longer than this may be evicted. Default 5 min.
    pub idle_window_ms: u64,
    /// Background-tier preloads only run below this heap usage. Default 30 %.
    pub idle_memory_percent: f64,
    /// Base of the exponential retry backoff (`base * 2^attempt`). Default 1 s.
    pub backoff_base_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            idle_window_ms: 5 * 60 * 1_000,
            idle_memory_percent: 30.0,
            backoff_base_ms: 1_000,
        }
    }
}

impl RegistryConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        ensure!(
            self.tick_interval_ms > 0,
            InvalidConfigSnafu {
                reason: "registry.tick_interval_ms must be positive"
            }
        );
        ensure!(
            (0.0..=100.0).contains(&self.idle_memory_percent),
            InvalidConfigSnafu {
                reason: "registry.idle_memory_percent must be within 0..=100"
            }
        );
        Ok(())
    }
}

/// Navigation event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-listener invocation timeout. Default 1 s.
    pub listener_timeout_ms: u64,
    /// Route-change bursts within this window become one event. Default 16 ms.
    pub route_debounce_ms: u64,
    /// Only storage keys with this prefix produce storage-change events.
    pub storage_namespace: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listener_timeout_ms: 1_000,
            route_debounce_ms: 16,
            storage_namespace: "ff_".to_string(),
        }
    }
}

impl BusConfig {
    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    pub fn route_debounce(&self) -> Duration {
        Duration::from_millis(self.route_debounce_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        ensure!(
            self.listener_timeout_ms > 0,
            InvalidConfigSnafu {
                reason: "bus.listener_timeout_ms must be positive"
            }
        );
        Ok(())
    }
}

/// Error classification, recovery and health check settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorServiceConfig {
    /// Ring buffer capacity for recorded errors. Default 100.
    pub ring_capacity: usize,
    /// "Recent" window used by stats. Default 1 h.
    pub recent_window_ms: u64,
    /// Periodic health check period. Default 30 s.
    pub health_interval_ms: u64,
    /// Network probe timeout. Default 5 s.
    pub network_timeout_ms: u64,
    /// Round trips slower than this rate the network as degraded. Default 1 s.
    pub network_degraded_latency_ms: u64,
    /// Heap usage rated degraded at or above this. Default 70 %.
    pub memory_degraded_percent: f64,
    /// Heap usage rated critical at or above this. Default 90 %.
    pub memory_critical_percent: f64,
    /// Automatic recoveries allowed per error category. Default 3.
    pub max_recoveries_per_category: u32,
    /// Upper bound on a single recovery action. Default 5 s.
    pub recovery_timeout_ms: u64,
    /// Storage namespace that recovery actions may clean.
    pub storage_namespace: String,
    /// Storage key holding the auth token.
    pub auth_token_key: String,
    /// Storage key set when the reduced-feature mode is enabled.
    pub degraded_mode_key: String,
    /// Redirect target after credentials are reset.
    pub login_path: String,
    /// Cached values larger than this are dropped by the memory cleanup.
    pub cache_entry_limit_bytes: usize,
}

impl Default for ErrorServiceConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100,
            recent_window_ms: 60 * 60 * 1_000,
            health_interval_ms: 30_000,
            network_timeout_ms: 5_000,
            network_degraded_latency_ms: 1_000,
            memory_degraded_percent: 70.0,
            memory_critical_percent: 90.0,
            max_recoveries_per_category: 3,
            recovery_timeout_ms: 5_000,
            storage_namespace: "ff_".to_string(),
            auth_token_key: "ff_auth_token".to_string(),
            degraded_mode_key: "ff_degraded_mode".to_string(),
            login_path: "/login".to_string(),
            cache_entry_limit_bytes: 64 * 1024,
        }
    }
}

impl ErrorServiceConfig {
    pub fn recent_window(&self) -> Duration {
        Duration::from_millis(self.recent_window_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn network_degraded_latency(&self) -> Duration {
        Duration::from_millis(self.network_degraded_latency_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        ensure!(
            self.ring_capacity > 0,
            InvalidConfigSnafu {
                reason: "errors.ring_capacity must be positive"
            }
        );
        ensure!(
            self.health_interval_ms > 0,
            InvalidConfigSnafu {
                reason: "errors.health_interval_ms must be positive"
            }
        );
        ensure!(
            self.memory_degraded_percent <= self.memory_critical_percent,
            InvalidConfigSnafu {
                reason: "errors.memory_degraded_percent must not exceed memory_critical_percent"
            }
        );
        Ok(())
    }
}
