//! Navigation event bus.
//!
//! Host signals (route changes, storage writes, auth changes, error reports)
//! are normalized into [`NavigationEvent`]s, queued on an unbounded channel and
//! dispatched FIFO by a single drain task. Each listener invocation runs as its
//! own task under a timeout, so a listener that fails, panics or hangs is
//! logged and counted while the rest still run.
//!
//! Route changes are driven explicitly through [`NavigationBus::navigate`] and
//! friends over a [`HistoryBackend`], then debounced into one event per burst.

mod event;
mod listener;

pub use event::{EventKind, NavigationEvent};
pub use listener::{ListenerFn, ListenerFuture, ListenerOptions, Subscription};

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::BusConfig;
use crate::error::{BoxError, BusDestroyedSnafu, ListenerTimeoutSnafu};
use crate::host::HistoryBackend;
use crate::task::{self, TaskTracker};
use listener::SharedTable;

/// Programmatic navigation, as consumed by recovery actions.
pub trait Navigator: Send + Sync + Debug + 'static {
    fn navigate(&self, path: &str) -> crate::Result<()>;
    fn replace(&self, path: &str) -> crate::Result<()>;
    fn current_path(&self) -> String;
}

#[derive(Debug, Default)]
struct BusCounters {
    emitted: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    storage_filtered: AtomicU64,
    routes_coalesced: AtomicU64,
    invocations: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusMetrics {
    pub events_emitted: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub storage_events_filtered: u64,
    pub route_changes_coalesced: u64,
    pub listener_invocations: u64,
    pub listener_errors: u64,
    pub listener_timeouts: u64,
    pub listeners: usize,
    pub queue_depth: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub destroyed: bool,
}

struct BusInner {
    config: BusConfig,
    history: Arc<dyn HistoryBackend>,
    listeners: SharedTable,
    queue: mpsc::UnboundedSender<NavigationEvent>,
    routes: mpsc::UnboundedSender<String>,
    pending: AtomicUsize,
    destroyed: AtomicBool,
    counters: BusCounters,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<TaskTracker>,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, listener::ListenerTable> {
        listener::lock(&self.listeners)
    }

    fn emit(&self, event: NavigationEvent) -> bool {
        if self.destroyed.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let kind = event.kind;
        let timestamp = event.timestamp;
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(event).is_err() {
            self.take_pending();
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        *self
            .last_event_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(timestamp);
        tracing::trace!(kind = kind.as_str(), "bus.emit");
        true
    }

    fn take_pending(&self) {
        // Saturating: `destroy` may have zeroed the count under us.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    async fn dispatch(&self, event: NavigationEvent) {
        self.take_pending();
        let event = Arc::new(event);
        let targets = self.listeners().snapshot();
        for (id, callback, once) in targets {
            // Unsubscribed after the snapshot was taken.
            {
                let mut table = self.listeners();
                if !table.contains(id) {
                    continue;
                }
                if once {
                    table.remove(id);
                }
            }
            self.invoke(id, callback, Arc::clone(&event)).await;
        }
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    async fn invoke(&self, id: u64, callback: ListenerFn, event: Arc<NavigationEvent>) {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind.as_str();
        let timeout = self.config.listener_timeout();
        let mut handle = tokio::spawn(async move { callback(event).await });
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(listener = id, kind, error = %err, "bus.listener.failed");
            }
            Ok(Err(join)) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(listener = id, kind, panicked = join.is_panic(), "bus.listener.failed");
            }
            Err(_) => {
                handle.abort();
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let err = ListenerTimeoutSnafu {
                    listener: id,
                    timeout,
                }
                .build();
                tracing::warn!(listener = id, kind, error = %err, "bus.listener.timeout");
            }
        }
    }
}

/// Event bus handle. Clones share the same bus.
///
/// Construction spawns the drain and debounce tasks, so it needs a running
/// tokio runtime.
#[derive(Clone)]
pub struct NavigationBus {
    inner: Arc<BusInner>,
}

impl Debug for NavigationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationBus")
            .field("listeners", &self.listener_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl NavigationBus {
    pub fn new(config: BusConfig, history: Arc<dyn HistoryBackend>) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (routes, routes_rx) = mpsc::unbounded_channel();
        let debounce = config.route_debounce();
        let inner = Arc::new(BusInner {
            config,
            history,
            listeners: SharedTable::default(),
            queue,
            routes,
            pending: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            counters: BusCounters::default(),
            last_event_at: Mutex::new(None),
            tasks: Mutex::new(TaskTracker::new()),
        });

        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.track(task::spawn(
                "bus.drain",
                drain(Arc::downgrade(&inner), queue_rx),
            ));
            tasks.track(task::spawn(
                "bus.debounce",
                debounce_routes(Arc::downgrade(&inner), routes_rx, debounce),
            ));
        }
        tracing::debug!(debounce_ms = debounce.as_millis() as u64, "bus.created");
        Self { inner }
    }

    /// Subscribe an async listener.
    pub fn add_listener<F, Fut>(&self, callback: F, options: ListenerOptions) -> Subscription
    where
        F: Fn(Arc<NavigationEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let callback: ListenerFn = Arc::new(move |event: Arc<NavigationEvent>| {
            Box::pin(callback(event)) as ListenerFuture
        });
        let inserted = self.inner.listeners().insert(callback, options);
        match inserted {
            Some(id) => {
                tracing::debug!(listener = id, priority = options.priority, once = options.once, "bus.listener.added");
                Subscription::new(id, &self.inner.listeners)
            }
            None => {
                tracing::debug!("bus.listener.rejected_after_destroy");
                Subscription::detached()
            }
        }
    }

    /// Subscribe a plain closure. It still runs on its own task.
    pub fn add_sync_listener<F>(&self, callback: F, options: ListenerOptions) -> Subscription
    where
        F: Fn(&NavigationEvent) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.add_listener(
            move |event| {
                let callback = Arc::clone(&callback);
                async move {
                    callback(&event);
                    Ok::<(), BoxError>(())
                }
            },
            options,
        )
    }

    pub(crate) fn emit(&self, event: NavigationEvent) -> bool {
        self.inner.emit(event)
    }

    /// Push a new history entry and schedule a route-change event.
    pub fn navigate(&self, path: &str) -> crate::Result<()> {
        self.ensure_alive()?;
        self.inner.history.push(path);
        self.notify_route_change(path);
        Ok(())
    }

    /// Replace the current history entry and schedule a route-change event.
    pub fn replace(&self, path: &str) -> crate::Result<()> {
        self.ensure_alive()?;
        self.inner.history.replace(path);
        self.notify_route_change(path);
        Ok(())
    }

    /// Go back one entry. Returns the new location, or `None` at the root.
    pub fn back(&self) -> crate::Result<Option<String>> {
        self.ensure_alive()?;
        let location = self.inner.history.back();
        if let Some(location) = &location {
            self.notify_route_change(location);
        }
        Ok(location)
    }

    pub fn current_path(&self) -> String {
        self.inner.history.current()
    }

    /// Report a route change observed by the host. Bursts within the
    /// debounce window produce one event for the last location.
    pub fn notify_route_change(&self, location: &str) {
        if self.is_destroyed() {
            return;
        }
        let _ = self.inner.routes.send(location.to_string());
    }

    /// Report a storage write. Keys outside the application namespace are
    /// ignored. Returns whether an event was emitted.
    pub fn notify_storage_change(
        &self,
        key: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) -> bool {
        if !key.starts_with(&self.inner.config.storage_namespace) {
            self.inner
                .counters
                .storage_filtered
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let event = NavigationEvent::new(EventKind::StorageChange, &self.current_path())
            .with_meta(serde_json::json!({
                "key": key,
                "old_value": old_value,
                "new_value": new_value,
            }));
        self.inner.emit(event)
    }

    pub fn notify_auth_change(&self, authenticated: bool) -> bool {
        let event = NavigationEvent::new(EventKind::AuthChange, &self.current_path())
            .with_meta(serde_json::json!({ "authenticated": authenticated }));
        self.inner.emit(event)
    }

    /// Report a runtime error. A leading `TypeName: ` prefix, as in
    /// `"TypeError: Failed to fetch"`, becomes the error name; otherwise the
    /// name is `Error`.
    pub fn notify_error(&self, message: &str) -> bool {
        let (name, message) = split_error_name(message);
        self.notify_named_error(name, message)
    }

    pub fn notify_named_error(&self, name: &str, message: &str) -> bool {
        let event = NavigationEvent::new(EventKind::Error, &self.current_path())
            .with_meta(serde_json::json!({ "name": name, "message": message }));
        self.inner.emit(event)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> BusMetrics {
        let counters = &self.inner.counters;
        BusMetrics {
            events_emitted: counters.emitted.load(Ordering::Relaxed),
            events_dispatched: counters.dispatched.load(Ordering::Relaxed),
            events_dropped: counters.dropped.load(Ordering::Relaxed),
            storage_events_filtered: counters.storage_filtered.load(Ordering::Relaxed),
            route_changes_coalesced: counters.routes_coalesced.load(Ordering::Relaxed),
            listener_invocations: counters.invocations.load(Ordering::Relaxed),
            listener_errors: counters.errors.load(Ordering::Relaxed),
            listener_timeouts: counters.timeouts.load(Ordering::Relaxed),
            listeners: self.listener_count(),
            queue_depth: if self.is_destroyed() {
                0
            } else {
                self.inner.pending.load(Ordering::Acquire)
            },
            last_event_at: *self
                .inner
                .last_event_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            destroyed: self.is_destroyed(),
        }
    }

    /// Stop the drain and debounce tasks and drop every listener.
    ///
    /// Only the first call succeeds; later calls fail with `BusDestroyed`.
    pub fn destroy(&self) -> crate::Result<()> {
        ensure!(
            !self.inner.destroyed.swap(true, Ordering::AcqRel),
            BusDestroyedSnafu
        );
        let stopped = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        let listeners = self.inner.listeners().close();
        let undelivered = self.inner.pending.swap(0, Ordering::AcqRel);
        self.inner
            .counters
            .dropped
            .fetch_add(undelivered as u64, Ordering::Relaxed);
        tracing::info!(stopped, listeners, undelivered, "bus.destroyed");
        Ok(())
    }

    fn ensure_alive(&self) -> crate::Result<()> {
        ensure!(!self.is_destroyed(), BusDestroyedSnafu);
        Ok(())
    }
}

impl Navigator for NavigationBus {
    fn navigate(&self, path: &str) -> crate::Result<()> {
        NavigationBus::navigate(self, path)
    }

    fn replace(&self, path: &str) -> crate::Result<()> {
        NavigationBus::replace(self, path)
    }

    fn current_path(&self) -> String {
        NavigationBus::current_path(self)
    }
}

fn split_error_name(text: &str) -> (&str, &str) {
    if let Some((name, rest)) = text.split_once(": ") {
        let is_type_name = name.starts_with(|c: char| c.is_ascii_uppercase())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if is_type_name {
            return (name, rest);
        }
    }
    ("Error", text)
}

async fn drain(bus: Weak<BusInner>, mut rx: mpsc::UnboundedReceiver<NavigationEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = bus.upgrade() else {
            break;
        };
        inner.dispatch(event).await;
        drop(inner);
        tokio::task::yield_now().await;
    }
    tracing::debug!("bus.drain.stopped");
}

async fn debounce_routes(
    bus: Weak<BusInner>,
    mut rx: mpsc::UnboundedReceiver<String>,
    window: Duration,
) {
    while let Some(mut latest) = rx.recv().await {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                next = rx.recv() => match next {
                    Some(location) => {
                        latest = location;
                        if let Some(inner) = bus.upgrade() {
                            inner.counters.routes_coalesced.fetch_add(1, Ordering::Relaxed);
                        }
                        deadline.as_mut().reset(Instant::now() + window);
                    }
                    None => break,
                },
            }
        }
        let Some(inner) = bus.upgrade() else {
            break;
        };
        inner.emit(NavigationEvent::new(EventKind::RouteChange, &latest));
    }
    tracing::debug!("bus.debounce.stopped");
}
