//! Heap usage probes and the `MemoryMonitor` shared by the registry and the
//! error service.
//!
//! Probes may be unable to report anything (no host metrics, sandboxed
//! process). The monitor treats a missing sample as 0 % usage so callers never
//! fail on it.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One reading of heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemorySample {
    /// Used fraction in `[0, 1]`. A zero limit reads as empty.
    pub fn ratio(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.limit_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn percent(&self) -> f64 {
        self.ratio() * 100.0
    }
}

/// Source of heap usage readings.
pub trait MemoryProbe: Send + Sync + Debug + 'static {
    /// Returns `None` when the host cannot report memory usage.
    fn sample(&self) -> Option<MemorySample>;
}

/// Probe for hosts without any memory metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        None
    }
}

/// Probe with a settable reading, used by simulations and tests.
#[derive(Debug)]
pub struct StaticMemoryProbe {
    used: AtomicU64,
    limit: AtomicU64,
    available: AtomicBool,
}

impl StaticMemoryProbe {
    const DEFAULT_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            limit: AtomicU64::new(limit_bytes),
            available: AtomicBool::new(true),
        }
    }

    /// A probe reporting `percent` of a 4 GiB heap.
    pub fn with_percent(percent: f64) -> Self {
        let probe = Self::new(0, Self::DEFAULT_LIMIT);
        probe.set_percent(percent);
        probe
    }

    pub fn set(&self, used_bytes: u64, limit_bytes: u64) {
        self.limit.store(limit_bytes, Ordering::Relaxed);
        self.used.store(used_bytes, Ordering::Relaxed);
        self.available.store(true, Ordering::Relaxed);
    }

    pub fn set_percent(&self, percent: f64) {
        let limit = self.limit.load(Ordering::Relaxed).max(1);
        let used = (limit as f64 * percent.clamp(0.0, 100.0) / 100.0).round() as u64;
        self.used.store(used, Ordering::Relaxed);
        self.available.store(true, Ordering::Relaxed);
    }

    /// Make the probe report nothing until the next `set`.
    pub fn set_unavailable(&self) {
        self.available.store(false, Ordering::Relaxed);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        if !self.available.load(Ordering::Relaxed) {
            return None;
        }
        Some(MemorySample {
            used_bytes: self.used.load(Ordering::Relaxed),
            limit_bytes: self.limit.load(Ordering::Relaxed),
        })
    }
}

/// Probe reading this process's resident memory against total system memory.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = e, "memory.probe.no_pid"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemoryProbe").field("pid", &self.pid).finish()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let limit_bytes = system.total_memory();
        let used_bytes = system.process(pid)?.memory();
        Some(MemorySample {
            used_bytes,
            limit_bytes,
        })
    }
}

/// Shared read-only view over a `MemoryProbe`.
#[derive(Debug, Clone)]
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryMonitor {
    pub fn new(probe: impl MemoryProbe) -> Self {
        Self {
            probe: Arc::new(probe),
        }
    }

    pub fn from_arc(probe: Arc<dyn MemoryProbe>) -> Self {
        Self { probe }
    }

    /// A monitor that always reports "unknown".
    pub fn unavailable() -> Self {
        Self::new(NoMemoryProbe)
    }

    pub fn sample(&self) -> Option<MemorySample> {
        self.probe.sample()
    }

    pub fn is_available(&self) -> bool {
        self.sample().is_some()
    }

    /// Used heap percentage, 0 when unknown.
    pub fn usage_percent(&self) -> f64 {
        self.sample().map(|s| s.percent()).unwrap_or(0.0)
    }

    /// True when the known usage is strictly above `threshold_percent`.
    pub fn exceeds(&self, threshold_percent: f64) -> bool {
        self.usage_percent() > threshold_percent
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_reads_as_zero() {
        let monitor = MemoryMonitor::unavailable();
        assert!(!monitor.is_available());
        assert_eq!(monitor.usage_percent(), 0.0);
        assert!(!monitor.exceeds(0.0));
    }

    #[test]
    fn test_static_probe_percent() {
        let probe = Arc::new(StaticMemoryProbe::with_percent(90.0));
        let monitor = MemoryMonitor::from_arc(probe.clone());
        assert!((monitor.usage_percent() - 90.0).abs() < 0.01);
        assert!(monitor.exceeds(50.0));

        probe.set_percent(10.0);
        assert!(!monitor.exceeds(50.0));

        probe.set_unavailable();
        assert_eq!(monitor.usage_percent(), 0.0);
    }

    #[test]
    fn test_zero_limit_is_empty() {
        let sample = MemorySample {
            used_bytes: 10,
            limit_bytes: 0,
        };
        assert_eq!(sample.ratio(), 0.0);
    }
}
