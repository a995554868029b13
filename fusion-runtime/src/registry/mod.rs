//! Lazy component load registry.
//!
//! Components are registered with a deferred loader and loaded on first use
//! (or ahead of time through the priority preload queues). Each entry walks
//! the state machine `unloaded -> loading -> loaded | failed`, with
//! `loaded -> unloaded` reserved for idle eviction.
//!
//! A retry cycle runs in its own task and publishes its outcome once through a
//! per-entry `watch` slot, so every concurrent `get_component` caller awaits
//! the same load and a caller that goes away does not strand the entry in
//! `loading`.

mod entry;
mod queue;
#[cfg(test)]
mod tests;

pub use entry::{
    ComponentConfig, EntrySnapshot, LoadFuture, LoadState, Loader, Priority, StateTransition,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use snafu::{prelude::*, IntoError};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::config::RegistryConfig;
use crate::error::{
    BoxError, DuplicateComponentSnafu, LoadError, LoadRetriesExhaustedSnafu, NotRegisteredSnafu,
};
use crate::host::MemoryMonitor;
use crate::task::{self, TaskTracker};
use entry::{InflightRx, Settled, Slot};
use queue::PriorityQueues;

#[derive(Debug, Default)]
struct Counters {
    loads_started: AtomicU64,
    loads_succeeded: AtomicU64,
    loads_failed: AtomicU64,
    failed_attempts: AtomicU64,
    evictions: AtomicU64,
    eviction_passes: AtomicU64,
}

/// Point-in-time registry figures for debug panels.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryMetrics {
    pub registered: usize,
    pub unloaded: usize,
    pub loading: usize,
    pub loaded: usize,
    pub failed: usize,
    pub queued: usize,
    pub loads_started: u64,
    pub loads_succeeded: u64,
    pub loads_failed: u64,
    pub failed_attempts: u64,
    pub evictions: u64,
    pub eviction_passes: u64,
    pub memory_percent: f64,
    pub background_tasks: usize,
}

struct Inner<C> {
    config: RegistryConfig,
    memory: MemoryMonitor,
    entries: Mutex<HashMap<String, Slot<C>>>,
    queues: Mutex<PriorityQueues>,
    counters: Counters,
    transitions: broadcast::Sender<StateTransition>,
    tasks: Mutex<TaskTracker>,
}

impl<C: Send + Sync + 'static> Inner<C> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Slot<C>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queues(&self) -> MutexGuard<'_, PriorityQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks(&self) -> MutexGuard<'_, TaskTracker> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, id: &str, slot: &mut Slot<C>, to: LoadState) {
        let from = slot.state;
        debug_assert!(
            from.can_transition_to(to),
            "illegal transition {from:?} -> {to:?} for '{id}'"
        );
        slot.state = to;
        tracing::debug!(
            component = id,
            from = from.as_str(),
            to = to.as_str(),
            "registry.transition"
        );
        let _ = self.transitions.send(StateTransition {
            id: id.to_string(),
            from,
            to,
        });
    }

    /// Record a failed attempt. Returns false when the cycle went stale.
    fn note_failed_attempt(&self, id: &str, epoch: u64, attempt: u32, err: &LoadError) -> bool {
        self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries();
        match entries.get_mut(id) {
            Some(slot) if slot.epoch == epoch && slot.state == LoadState::Loading => {
                slot.retry_count = attempt;
                slot.last_error = Some(err.clone());
                true
            }
            _ => false,
        }
    }

    /// Write a settled cycle back onto its entry, unless the entry moved on.
    fn finish(&self, id: &str, epoch: u64, outcome: &Settled<C>) {
        let mut entries = self.entries();
        let Some(slot) = entries.get_mut(id) else {
            return;
        };
        if slot.epoch != epoch || slot.state != LoadState::Loading {
            tracing::debug!(component = id, epoch, "registry.load.stale");
            return;
        }
        slot.inflight = None;
        slot.cycle = None;
        match outcome {
            Ok(component) => {
                slot.component = Some(Arc::clone(component));
                slot.retry_count = 0;
                slot.last_error = None;
                slot.load_count += 1;
                slot.last_used_at = Instant::now();
                self.transition(id, slot, LoadState::Loaded);
                self.counters.loads_succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(component = id, "registry.loaded");
            }
            Err((attempts, err)) => {
                slot.component = None;
                slot.last_error = Some(err.clone());
                self.transition(id, slot, LoadState::Failed);
                self.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(component = id, attempts, error = %err, "registry.load.failed");
            }
        }
    }

    /// Fail every entry that is still loading and abort its cycle. The
    /// aborted cycles find a bumped epoch and leave the entries alone.
    fn cancel_inflight(&self) -> usize {
        let mut cancelled = 0;
        let mut entries = self.entries();
        for (id, slot) in entries.iter_mut() {
            if slot.state != LoadState::Loading {
                continue;
            }
            slot.epoch += 1;
            slot.inflight = None;
            if let Some(cycle) = slot.cycle.take() {
                cycle.abort();
            }
            slot.component = None;
            slot.last_error = Some(LoadError::Abandoned);
            self.transition(id, slot, LoadState::Failed);
            self.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(component = %id, "registry.load.cancelled");
            cancelled += 1;
        }
        cancelled
    }

    fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.config.idle_window();
        let mut evicted = 0;
        {
            let mut entries = self.entries();
            for (id, slot) in entries.iter_mut() {
                let idle = now.saturating_duration_since(slot.last_used_at);
                if slot.state == LoadState::Loaded
                    && slot.config.priority != Priority::Critical
                    && idle > window
                {
                    slot.component = None;
                    slot.eviction_count += 1;
                    self.transition(id, slot, LoadState::Unloaded);
                    tracing::debug!(component = %id, idle_ms = idle.as_millis() as u64, "registry.evicted");
                    evicted += 1;
                }
            }
        }
        self.counters.eviction_passes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::info!(
            evicted,
            memory_percent = self.memory.usage_percent(),
            "registry.eviction_pass"
        );
        evicted
    }
}

/// Settles a retry cycle exactly once. Dropping it unsettled (the driving
/// task was aborted) reports the load as abandoned.
struct LoadCycle<C: Send + Sync + 'static> {
    inner: Arc<Inner<C>>,
    id: String,
    epoch: u64,
    tx: watch::Sender<Option<Settled<C>>>,
    settled: bool,
}

impl<C: Send + Sync + 'static> LoadCycle<C> {
    fn settle(&mut self, outcome: Settled<C>) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.inner.finish(&self.id, self.epoch, &outcome);
        self.tx.send_replace(Some(outcome));
    }
}

impl<C: Send + Sync + 'static> Drop for LoadCycle<C> {
    fn drop(&mut self) {
        if !self.settled {
            self.settle(Err((0, LoadError::Abandoned)));
        }
    }
}

enum Begin<C> {
    Ready(Arc<C>),
    Wait(InflightRx<C>),
    Started(InflightRx<C>),
}

/// Registry of lazily loaded components of type `C`.
///
/// Cloning is cheap and yields another handle to the same registry. One
/// registry is meant to be constructed at bootstrap (see `ClientRuntime`) and
/// handed to consumers.
pub struct ComponentRegistry<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ComponentRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> ComponentRegistry<C> {
    pub fn new(config: RegistryConfig, memory: MemoryMonitor) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                memory,
                entries: Mutex::new(HashMap::new()),
                queues: Mutex::new(PriorityQueues::default()),
                counters: Counters::default(),
                transitions,
                tasks: Mutex::new(TaskTracker::new()),
            }),
        }
    }

    /// Register a component loader.
    ///
    /// With `config.preload` set (and a priority other than `Background`) a
    /// load is spawned immediately, which requires a running tokio runtime.
    pub fn register<F, Fut>(
        &self,
        id: impl Into<String>,
        factory: F,
        config: ComponentConfig,
    ) -> crate::Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C, BoxError>> + Send + 'static,
    {
        let id = id.into();
        config.validate(&id)?;
        let loader: Loader<C> = Arc::new(move || Box::pin(factory()) as LoadFuture<C>);
        {
            let mut entries = self.inner.entries();
            ensure!(
                !entries.contains_key(&id),
                DuplicateComponentSnafu { id: id.as_str() }
            );
            entries.insert(id.clone(), Slot::new(loader, config.clone()));
        }
        tracing::info!(
            component = %id,
            priority = config.priority.as_str(),
            preload = config.preload,
            "registry.registered"
        );
        if config.preload && config.priority != Priority::Background {
            self.begin_load(&id)?;
        }
        Ok(())
    }

    /// Return the loaded component, loading it first if needed.
    ///
    /// Concurrent callers share one retry cycle. A `failed` entry starts a
    /// fresh cycle. Fails with `NotRegistered` for unknown ids and with
    /// `LoadRetriesExhausted` (wrapping the last attempt's error) when every
    /// attempt failed.
    pub async fn get_component(&self, id: &str) -> crate::Result<Arc<C>> {
        match self.begin_load(id)? {
            Begin::Ready(component) => Ok(component),
            Begin::Wait(rx) | Begin::Started(rx) => self.wait_settled(id, rx).await,
        }
    }

    /// Queue a component for the background preload loop.
    ///
    /// Returns false when it is already loaded, loading or queued.
    pub fn preload(&self, id: &str) -> crate::Result<bool> {
        let priority = {
            let entries = self.inner.entries();
            let slot = entries.get(id).context(NotRegisteredSnafu { id })?;
            if matches!(slot.state, LoadState::Loaded | LoadState::Loading) {
                return Ok(false);
            }
            slot.config.priority
        };
        let queued = self.inner.queues().push(id, priority);
        if queued {
            tracing::debug!(component = id, priority = priority.as_str(), "registry.preload.queued");
        }
        Ok(queued)
    }

    /// One pass of the preload loop: at most one load per tier, most urgent
    /// tier first. The background tier only runs while memory usage is below
    /// the idle threshold. Returns how many loads were started.
    pub async fn preload_tick(&self) -> usize {
        let mut started = 0;
        for tier in Priority::ALL {
            if tier == Priority::Background
                && self.inner.memory.usage_percent() >= self.inner.config.idle_memory_percent
            {
                tracing::trace!("registry.preload.background_deferred");
                continue;
            }
            loop {
                let next = self.inner.queues().pop(tier);
                let Some(id) = next else {
                    break;
                };
                match self.begin_load(&id) {
                    Ok(Begin::Started(_)) => {
                        started += 1;
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(component = %id, error = %err, "registry.preload.skipped");
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        started
    }

    /// Unload every non-critical entry idle for longer than the idle window.
    /// Returns the number of evicted entries.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_idle()
    }

    /// Start the background preload loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks();
        if tasks.active_count() > 0 {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.tick_interval();
        tasks.track(task::spawn_periodic("registry.preload", period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                let started = ComponentRegistry { inner }.preload_tick().await;
                if started > 0 {
                    tracing::debug!(started, "registry.preload.tick");
                }
                true
            }
        }));
        tracing::info!(period_ms = period.as_millis() as u64, "registry.started");
    }

    /// Stop the preload loop, drop pending preloads and cancel in-flight
    /// loads. Cancelled entries end `failed` and their waiters receive
    /// [`LoadError::Abandoned`]. Returns the number of background tasks that
    /// were stopped.
    pub fn shutdown(&self) -> usize {
        let stopped = self.inner.tasks().abort_all();
        self.inner.queues().clear();
        let cancelled = self.inner.cancel_inflight();
        tracing::info!(stopped, cancelled, "registry.shutdown");
        stopped
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.entries().contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<LoadState> {
        self.inner.entries().get(id).map(|slot| slot.state)
    }

    pub fn entry(&self, id: &str) -> Option<EntrySnapshot> {
        let now = Instant::now();
        self.inner.entries().get(id).map(|slot| slot.snapshot(id, now))
    }

    /// Snapshots of every entry, most urgent tier first, then by id.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .inner
            .entries()
            .iter()
            .map(|(id, slot)| slot.snapshot(id, now))
            .collect();
        snapshots.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Subscribe to every state transition from now on.
    pub fn watch_transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let mut metrics = RegistryMetrics::default();
        for slot in self.inner.entries().values() {
            metrics.registered += 1;
            match slot.state {
                LoadState::Unloaded => metrics.unloaded += 1,
                LoadState::Loading => metrics.loading += 1,
                LoadState::Loaded => metrics.loaded += 1,
                LoadState::Failed => metrics.failed += 1,
            }
        }
        let counters = &self.inner.counters;
        metrics.queued = self.inner.queues().len();
        metrics.loads_started = counters.loads_started.load(Ordering::Relaxed);
        metrics.loads_succeeded = counters.loads_succeeded.load(Ordering::Relaxed);
        metrics.loads_failed = counters.loads_failed.load(Ordering::Relaxed);
        metrics.failed_attempts = counters.failed_attempts.load(Ordering::Relaxed);
        metrics.evictions = counters.evictions.load(Ordering::Relaxed);
        metrics.eviction_passes = counters.eviction_passes.load(Ordering::Relaxed);
        metrics.memory_percent = self.inner.memory.usage_percent();
        metrics.background_tasks = self.inner.tasks().active_count();
        metrics
    }

    fn begin_load(&self, id: &str) -> crate::Result<Begin<C>> {
        let mut entries = self.inner.entries();
        let slot = entries.get_mut(id).context(NotRegisteredSnafu { id })?;
        match (slot.state, &slot.component, &slot.inflight) {
            (LoadState::Loaded, Some(component), _) => {
                let component = Arc::clone(component);
                slot.last_used_at = Instant::now();
                return Ok(Begin::Ready(component));
            }
            (LoadState::Loading, _, Some(rx)) => return Ok(Begin::Wait(rx.clone())),
            _ => {}
        }

        let (tx, rx) = watch::channel(None);
        slot.epoch += 1;
        slot.retry_count = 0;
        slot.inflight = Some(rx.clone());
        self.inner.transition(id, slot, LoadState::Loading);
        let cycle = LoadCycle {
            inner: Arc::clone(&self.inner),
            id: id.to_string(),
            epoch: slot.epoch,
            tx,
            settled: false,
        };
        let loader = Arc::clone(&slot.loader);
        let config = slot.config.clone();
        tracing::debug!(component = id, max_retries = config.max_retries, "registry.load.start");
        // Spawned under the entries lock so the handle is stored before the
        // cycle can settle and clear it.
        let handle = tokio::spawn(run_cycle(cycle, loader, config));
        slot.cycle = Some(handle.abort_handle());
        drop(entries);

        self.inner
            .counters
            .loads_started
            .fetch_add(1, Ordering::Relaxed);
        Ok(Begin::Started(rx))
    }

    async fn wait_settled(&self, id: &str, mut rx: InflightRx<C>) -> crate::Result<Arc<C>> {
        let settled = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match settled {
            Some(Ok(component)) => Ok(component),
            Some(Err((attempts, source))) => {
                Err(LoadRetriesExhaustedSnafu { id, attempts }.into_error(source))
            }
            None => Err(LoadRetriesExhaustedSnafu { id, attempts: 0u32 }.into_error(LoadError::Abandoned)),
        }
    }
}

async fn run_cycle<C: Send + Sync + 'static>(
    mut cycle: LoadCycle<C>,
    loader: Loader<C>,
    config: ComponentConfig,
) {
    let inner = Arc::clone(&cycle.inner);
    if inner.memory.exceeds(config.memory_threshold) {
        tracing::debug!(
            component = %cycle.id,
            memory_percent = inner.memory.usage_percent(),
            threshold = config.memory_threshold,
            "registry.load.memory_pressure"
        );
        inner.evict_idle();
    }

    let mut last_error = LoadError::Abandoned;
    for attempt in 1..=config.max_retries {
        match run_attempt(&loader, config.timeout).await {
            Ok(component) => {
                cycle.settle(Ok(Arc::new(component)));
                return;
            }
            Err(err) => {
                tracing::warn!(component = %cycle.id, attempt, error = %err, "registry.load.attempt_failed");
                if !inner.note_failed_attempt(&cycle.id, cycle.epoch, attempt, &err) {
                    return;
                }
                last_error = err;
                if attempt < config.max_retries {
                    tokio::time::sleep(backoff_delay(inner.config.backoff_base(), attempt)).await;
                }
            }
        }
    }
    cycle.settle(Err((config.max_retries, last_error)));
}

/// `base * 2^attempt`, with `attempt` counting failures so far.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

async fn run_attempt<C: Send + 'static>(loader: &Loader<C>, timeout: Duration) -> Result<C, LoadError> {
    let mut handle = tokio::spawn(loader());
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(component))) => Ok(component),
        Ok(Ok(Err(err))) => Err(LoadError::Rejected {
            message: err.to_string(),
        }),
        Ok(Err(join)) if join.is_panic() => Err(LoadError::Panicked),
        Ok(Err(_)) => Err(LoadError::Abandoned),
        Err(_) => {
            handle.abort();
            Err(LoadError::Timeout { timeout })
        }
    }
}
