//! Lightweight network round-trip probe used by the health check.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BoxError;

#[async_trait]
pub trait NetworkProbe: Send + Sync + Debug + 'static {
    /// Perform one round trip and return its latency.
    async fn round_trip(&self) -> Result<Duration, BoxError>;
}

/// Probe with a configurable latency and online flag.
#[derive(Debug)]
pub struct StaticNetworkProbe {
    latency_ms: AtomicU64,
    online: AtomicBool,
}

impl StaticNetworkProbe {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency_ms: AtomicU64::new(latency.as_millis() as u64),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

impl Default for StaticNetworkProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

#[async_trait]
impl NetworkProbe for StaticNetworkProbe {
    async fn round_trip(&self) -> Result<Duration, BoxError> {
        let latency = Duration::from_millis(self.latency_ms.load(Ordering::Relaxed));
        tokio::time::sleep(latency).await;
        if self.online.load(Ordering::Relaxed) {
            Ok(latency)
        } else {
            Err("network unreachable".into())
        }
    }
}
