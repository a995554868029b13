//! Registry entry types: priority tiers, load states and per-entry config.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{BoxError, InvalidComponentConfigSnafu, LoadError};

/// Boxed future returned by a loader.
pub type LoadFuture<C> = Pin<Box<dyn Future<Output = Result<C, BoxError>> + Send>>;

/// Deferred factory producing a component definition.
pub type Loader<C> = Arc<dyn Fn() -> LoadFuture<C> + Send + Sync>;

/// Load order and eviction exemption tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        }
    }

    /// Edges of the entry state machine. `Loaded -> Unloaded` is eviction,
    /// `Failed -> Loading` is a caller-initiated retry cycle.
    pub const fn can_transition_to(self, next: LoadState) -> bool {
        matches!(
            (self, next),
            (Self::Unloaded, Self::Loading)
                | (Self::Failed, Self::Loading)
                | (Self::Loading, Self::Loaded)
                | (Self::Loading, Self::Failed)
                | (Self::Loaded, Self::Unloaded)
        )
    }
}

/// One observed state change, broadcast to `ComponentRegistry::watch_transitions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub id: String,
    pub from: LoadState,
    pub to: LoadState,
}

/// Per-component registration settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentConfig {
    pub priority: Priority,
    /// Schedule a load right after registration (ignored for `Background`).
    pub preload: bool,
    /// Total load attempts per retry cycle. Default 3.
    pub max_retries: u32,
    /// Per-attempt timeout. Default 10 s.
    pub timeout: Duration,
    /// Heap usage percent above which a load first runs the eviction pass. Default 50.
    pub memory_threshold: f64,
}

impl ComponentConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_MEMORY_THRESHOLD: f64 = 50.0;

    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            preload: false,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            timeout: Self::DEFAULT_TIMEOUT,
            memory_threshold: Self::DEFAULT_MEMORY_THRESHOLD,
        }
    }

    #[must_use]
    pub fn preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn memory_threshold(mut self, percent: f64) -> Self {
        self.memory_threshold = percent;
        self
    }

    pub(crate) fn validate(&self, id: &str) -> crate::Result<()> {
        ensure!(
            !id.is_empty(),
            InvalidComponentConfigSnafu {
                id,
                reason: "id must not be empty"
            }
        );
        ensure!(
            self.max_retries >= 1,
            InvalidComponentConfigSnafu {
                id,
                reason: "max_retries must be at least 1"
            }
        );
        ensure!(
            !self.timeout.is_zero(),
            InvalidComponentConfigSnafu {
                id,
                reason: "timeout must be positive"
            }
        );
        ensure!(
            self.memory_threshold > 0.0 && self.memory_threshold <= 100.0,
            InvalidComponentConfigSnafu {
                id,
                reason: "memory_threshold must be within (0, 100]"
            }
        );
        Ok(())
    }
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self::new(Priority::Normal)
    }
}

/// Outcome of one retry cycle, shared with every waiter.
pub(crate) type Settled<C> = Result<Arc<C>, (u32, LoadError)>;

pub(crate) type InflightRx<C> = watch::Receiver<Option<Settled<C>>>;

/// Registry-owned mutable state for one component.
pub(crate) struct Slot<C> {
    pub(crate) loader: Loader<C>,
    pub(crate) config: ComponentConfig,
    pub(crate) state: LoadState,
    pub(crate) component: Option<Arc<C>>,
    pub(crate) retry_count: u32,
    pub(crate) last_used_at: Instant,
    pub(crate) last_error: Option<LoadError>,
    pub(crate) load_count: u64,
    pub(crate) eviction_count: u64,
    /// Bumped at the start of every retry cycle. A cycle whose epoch no
    /// longer matches must not write its result.
    pub(crate) epoch: u64,
    pub(crate) inflight: Option<InflightRx<C>>,
    /// Task driving the current retry cycle.
    pub(crate) cycle: Option<AbortHandle>,
}

impl<C> Slot<C> {
    pub(crate) fn new(loader: Loader<C>, config: ComponentConfig) -> Self {
        Self {
            loader,
            config,
            state: LoadState::Unloaded,
            component: None,
            retry_count: 0,
            last_used_at: Instant::now(),
            last_error: None,
            load_count: 0,
            eviction_count: 0,
            epoch: 0,
            inflight: None,
            cycle: None,
        }
    }

    pub(crate) fn snapshot(&self, id: &str, now: Instant) -> EntrySnapshot {
        EntrySnapshot {
            id: id.to_string(),
            priority: self.config.priority,
            state: self.state,
            retry_count: self.retry_count,
            max_retries: self.config.max_retries,
            timeout: self.config.timeout,
            idle_for: now.saturating_duration_since(self.last_used_at),
            load_count: self.load_count,
            eviction_count: self.eviction_count,
            last_error: self.last_error.as_ref().map(ToString::to_string),
        }
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub id: String,
    pub priority: Priority,
    pub state: LoadState,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub idle_for: Duration,
    pub load_count: u64,
    pub eviction_count: u64,
    pub last_error: Option<String>,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use LoadState::*;
        assert!(Unloaded.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Loaded));
        assert!(Loading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Loading));
        assert!(Loaded.can_transition_to(Unloaded));

        assert!(!Unloaded.can_transition_to(Loaded));
        assert!(!Failed.can_transition_to(Loaded));
        assert!(!Loading.can_transition_to(Unloaded));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::Background);
        assert_eq!(Priority::ALL[Priority::Low.index()], Priority::Low);
    }

    #[test]
    fn test_config_validation() {
        assert!(ComponentConfig::default().validate("a").is_ok());
        assert!(ComponentConfig::default().validate("").is_err());
        assert!(ComponentConfig::default().max_retries(0).validate("a").is_err());
        assert!(ComponentConfig::default().timeout(Duration::ZERO).validate("a").is_err());
        assert!(ComponentConfig::default().memory_threshold(120.0).validate("a").is_err());
    }
}
