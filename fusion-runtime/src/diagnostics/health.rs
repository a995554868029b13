//! Subsystem health probes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ErrorServiceConfig;
use crate::host::{KeyValueStore, MemoryMonitor, NetworkProbe};

/// Ordered from best to worst, so the overall rating is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthRating {
    Healthy,
    Degraded,
    Critical,
}

impl HealthRating {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemHealth {
    pub rating: HealthRating,
    pub detail: String,
}

impl SubsystemHealth {
    fn new(rating: HealthRating, detail: impl Into<String>) -> Self {
        Self {
            rating,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub overall: HealthRating,
    pub auth: SubsystemHealth,
    pub network: SubsystemHealth,
    pub storage: SubsystemHealth,
    pub memory: SubsystemHealth,
    pub network_latency_ms: Option<u64>,
    pub memory_percent: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn subsystems(&self) -> [(&'static str, &SubsystemHealth); 4] {
        [
            ("auth", &self.auth),
            ("network", &self.network),
            ("storage", &self.storage),
            ("memory", &self.memory),
        ]
    }
}

/// Runs the four subsystem probes against the host seams.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    store: Arc<dyn KeyValueStore>,
    network: Arc<dyn NetworkProbe>,
    memory: MemoryMonitor,
    config: ErrorServiceConfig,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        network: Arc<dyn NetworkProbe>,
        memory: MemoryMonitor,
        config: ErrorServiceConfig,
    ) -> Self {
        Self {
            store,
            network,
            memory,
            config,
        }
    }

    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    pub async fn check(&self) -> HealthReport {
        let auth = self.check_auth();
        let (network, network_latency_ms) = self.check_network().await;
        let storage = self.check_storage();
        let (memory, memory_percent) = self.check_memory();
        let overall = [&auth, &network, &storage, &memory]
            .iter()
            .map(|s| s.rating)
            .max()
            .unwrap_or(HealthRating::Healthy);
        HealthReport {
            overall,
            auth,
            network,
            storage,
            memory,
            network_latency_ms,
            memory_percent,
            checked_at: Utc::now(),
        }
    }

    fn check_auth(&self) -> SubsystemHealth {
        match self.store.get(&self.config.auth_token_key) {
            Some(token) if !token.is_empty() => SubsystemHealth::new(HealthRating::Healthy, "token present"),
            _ => SubsystemHealth::new(HealthRating::Degraded, "no auth token"),
        }
    }

    async fn check_network(&self) -> (SubsystemHealth, Option<u64>) {
        let timeout = self.config.network_timeout();
        match tokio::time::timeout(timeout, self.network.round_trip()).await {
            Ok(Ok(latency)) => {
                let ms = latency.as_millis() as u64;
                let health = if latency > self.config.network_degraded_latency() {
                    SubsystemHealth::new(HealthRating::Degraded, format!("slow round trip ({ms} ms)"))
                } else {
                    SubsystemHealth::new(HealthRating::Healthy, format!("{ms} ms"))
                };
                (health, Some(ms))
            }
            Ok(Err(err)) => (
                SubsystemHealth::new(HealthRating::Critical, format!("unreachable: {err}")),
                None,
            ),
            Err(_) => (
                SubsystemHealth::new(
                    HealthRating::Critical,
                    format!("no response within {} ms", timeout.as_millis()),
                ),
                None,
            ),
        }
    }

    fn check_storage(&self) -> SubsystemHealth {
        let key = format!("{}health_probe", self.config.storage_namespace);
        if let Err(err) = self.store.set(&key, "ok") {
            return SubsystemHealth::new(HealthRating::Critical, format!("write failed: {err}"));
        }
        let read_back = self.store.remove(&key);
        if read_back.as_deref() == Some("ok") {
            SubsystemHealth::new(HealthRating::Healthy, "read/write ok")
        } else {
            SubsystemHealth::new(HealthRating::Critical, "read back mismatch")
        }
    }

    fn check_memory(&self) -> (SubsystemHealth, Option<f64>) {
        let Some(sample) = self.memory.sample() else {
            return (
                SubsystemHealth::new(HealthRating::Healthy, "heap metrics unavailable"),
                None,
            );
        };
        let percent = sample.percent();
        let rating = if percent >= self.config.memory_critical_percent {
            HealthRating::Critical
        } else if percent >= self.config.memory_degraded_percent {
            HealthRating::Degraded
        } else {
            HealthRating::Healthy
        };
        (
            SubsystemHealth::new(rating, format!("{percent:.1}% of heap limit")),
            Some(percent),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::host::{MemoryStore, StaticMemoryProbe, StaticNetworkProbe};

    struct Fixture {
        checker: HealthChecker,
        store: Arc<MemoryStore>,
        network: Arc<StaticNetworkProbe>,
        memory: Arc<StaticMemoryProbe>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let network = Arc::new(StaticNetworkProbe::default());
        let memory = Arc::new(StaticMemoryProbe::with_percent(20.0));
        store.set("ff_auth_token", "abc").unwrap();
        let checker = HealthChecker::new(
            store.clone(),
            network.clone(),
            MemoryMonitor::from_arc(memory.clone()),
            ErrorServiceConfig::default(),
        );
        Fixture {
            checker,
            store,
            network,
            memory,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_healthy() {
        let f = fixture();
        let report = f.checker.check().await;
        assert_eq!(report.overall, HealthRating::Healthy);
        assert_eq!(report.network_latency_ms, Some(20));
        assert!(f.store.get("ff_health_probe").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_thresholds() {
        let f = fixture();
        f.memory.set_percent(75.0);
        assert_eq!(f.checker.check().await.memory.rating, HealthRating::Degraded);
        f.memory.set_percent(95.0);
        let report = f.checker.check().await;
        assert_eq!(report.memory.rating, HealthRating::Critical);
        assert_eq!(report.overall, HealthRating::Critical);
        f.memory.set_unavailable();
        assert_eq!(f.checker.check().await.memory.rating, HealthRating::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_ratings() {
        let f = fixture();
        f.network.set_latency(Duration::from_millis(1_500));
        assert_eq!(f.checker.check().await.network.rating, HealthRating::Degraded);

        f.network.set_latency(Duration::from_secs(30));
        let report = f.checker.check().await;
        assert_eq!(report.network.rating, HealthRating::Critical);
        assert_eq!(report.network_latency_ms, None);

        f.network.set_latency(Duration::ZERO);
        f.network.set_online(false);
        assert_eq!(f.checker.check().await.network.rating, HealthRating::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_and_broken_storage() {
        let f = fixture();
        f.store.remove("ff_auth_token");
        let report = f.checker.check().await;
        assert_eq!(report.auth.rating, HealthRating::Degraded);
        assert_eq!(report.overall, HealthRating::Degraded);

        f.store.set_read_only(true);
        assert_eq!(f.checker.check().await.storage.rating, HealthRating::Critical);
    }
}
