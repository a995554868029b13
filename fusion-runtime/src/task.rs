//! Task management for service-owned background work.
//!
//! Every repeating job a service runs (the preload loop, the periodic health
//! check, the bus drain loop) is spawned through this module and tracked by the
//! owning service's `TaskTracker`, so that `shutdown()` or dropping the service
//! cancels it. Nothing here is tied to a UI component's mount/unmount cycle.

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// A handle to a spawned, named task that can be aborted.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    abort_handle: AbortHandle,
}

impl TaskHandle {
    pub fn new(name: &'static str, abort_handle: AbortHandle) -> Self {
        Self { name, abort_handle }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Abort the task. The task will be cancelled at the next await point.
    pub fn abort(&self) {
        self.abort_handle.abort();
    }

    /// Check if the task has finished (either completed or aborted).
    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }
}

/// Spawn a named task on the current tokio runtime.
pub fn spawn<F>(name: &'static str, fut: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::trace!(task = name, "task.spawn");
    let handle = tokio::spawn(fut);
    TaskHandle::new(name, handle.abort_handle())
}

/// Spawn a task that runs `tick` every `period`.
///
/// The first tick fires one full period after spawning. Ticks that overrun
/// the period are skipped rather than bunched up, and the next tick is not
/// started before the previous one returns. The loop stops when `tick`
/// returns `false`.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    spawn(name, async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !tick().await {
                tracing::debug!(task = name, "task.periodic.stopped");
                break;
            }
        }
    })
}

/// A collection of task handles that are cancelled together.
///
/// Dropping the tracker aborts everything it still tracks.
#[derive(Debug, Default)]
pub struct TaskTracker {
    handles: Vec<TaskHandle>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self { handles: Vec::new() }
    }

    /// Track a task handle. Finished handles are pruned on every call.
    pub fn track(&mut self, handle: TaskHandle) {
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Abort all tracked tasks and return how many were still running.
    pub fn abort_all(&mut self) -> usize {
        let mut aborted = 0;
        for handle in self.handles.drain(..) {
            if !handle.is_finished() {
                tracing::debug!(task = handle.name(), "task.abort");
                aborted += 1;
            }
            handle.abort();
        }
        aborted
    }

    /// Number of tracked tasks that have not finished.
    pub fn active_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Names of tracked tasks that have not finished.
    pub fn active_names(&self) -> Vec<&'static str> {
        self.handles
            .iter()
            .filter(|h| !h.is_finished())
            .map(TaskHandle::name)
            .collect()
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_handle_abort() {
        let handle = spawn("forever", async {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        assert!(!handle.is_finished());
        handle.abort();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_tracker_abort_all() {
        let mut tracker = TaskTracker::new();
        tracker.track(spawn("a", std::future::pending()));
        tracker.track(spawn("b", std::future::pending()));
        assert_eq!(tracker.active_count(), 2);
        assert_eq!(tracker.active_names(), vec!["a", "b"]);

        assert_eq!(tracker.abort_all(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_until_aborted() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut tracker = TaskTracker::new();
        tracker.track(spawn_periodic("tick", Duration::from_secs(2), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        }));

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        drop(tracker);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_stops_when_tick_returns_false() {
        let handle = spawn_periodic("once", Duration::from_millis(100), || async { false });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(handle.is_finished());
    }
}
