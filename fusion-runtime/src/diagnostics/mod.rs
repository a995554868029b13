//! Error classification, recording, recovery and health monitoring.
//!
//! [`ErrorService`] turns raw host errors into [`ClassifiedError`] records,
//! keeps the most recent ones in a bounded log, applies one category-specific
//! [`RecoveryAction`] per error instance through a [`Remediator`], and runs a
//! periodic [`HealthChecker`] whose last report is published as an
//! [`Observable`].

mod classify;
mod health;
mod record;
mod recovery;

pub use classify::{
    match_rule, ErrorCategory, ErrorContext, PerformanceSnapshot, RawError, Severity,
};
pub use health::{HealthChecker, HealthRating, HealthReport, SubsystemHealth};
pub use record::{ClassifiedError, ErrorStats};
pub use recovery::{HostRemediator, RecoveryAction, RecoveryOutcome, Remediator};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::watch;

use crate::config::ErrorServiceConfig;
use crate::state::Observable;
use crate::task::{self, TaskTracker};
use record::ErrorLog;

struct ServiceInner {
    config: ErrorServiceConfig,
    log: Mutex<ErrorLog>,
    remediator: Arc<dyn Remediator>,
    checker: HealthChecker,
    health: Observable<Option<HealthReport>>,
    next_id: AtomicU64,
    tasks: Mutex<TaskTracker>,
}

impl ServiceInner {
    fn log(&self) -> MutexGuard<'_, ErrorLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_rating(&self) -> Option<HealthRating> {
        self.health
            .read(|report| report.as_ref().map(|r| r.overall))
            .ok()
            .flatten()
    }
}

/// Writes the outcome of one recovery attempt back onto its record exactly
/// once. Dropping it unsettled (the caller's future was cancelled) records a
/// `cancelled` failure.
struct RecoveryAttempt<'a> {
    inner: &'a ServiceInner,
    id: u64,
    action: RecoveryAction,
    settled: bool,
}

impl RecoveryAttempt<'_> {
    fn settle(&mut self, outcome: RecoveryOutcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        let (id, action) = (self.id, self.action);
        let mut log = self.inner.log();
        if outcome.is_success() {
            log.note_recovery_success();
            tracing::info!(id, action = action.as_str(), "errors.recovery.succeeded");
        } else {
            tracing::warn!(id, action = action.as_str(), outcome = ?outcome, "errors.recovery.failed");
        }
        // The record may have left the ring while the action ran.
        if let Some(record) = log.get_mut(id) {
            if !outcome.is_success() {
                record.recoverable = false;
            }
            record.recovery = Some(outcome);
        }
    }
}

impl Drop for RecoveryAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let action = self.action;
            self.settle(RecoveryOutcome::Failed {
                action,
                reason: "cancelled".to_string(),
            });
        }
    }
}

/// Error service handle. Clones share the same log and health state.
#[derive(Clone)]
pub struct ErrorService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ErrorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorService")
            .field("buffered", &self.inner.log().len())
            .field("health", &self.inner.last_rating())
            .finish()
    }
}

impl ErrorService {
    pub fn new(
        config: ErrorServiceConfig,
        checker: HealthChecker,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                log: Mutex::new(ErrorLog::new(config.ring_capacity)),
                config,
                remediator,
                checker,
                health: Observable::new(None),
                next_id: AtomicU64::new(1),
                tasks: Mutex::new(TaskTracker::new()),
            }),
        }
    }

    /// Classify a raw error.
    ///
    /// When the last health report rated the runtime critical, severity is
    /// raised to at least `High`. A performance snapshot is attached when the
    /// context carries none.
    pub fn classify(&self, raw: &RawError, mut context: ErrorContext) -> ClassifiedError {
        let (category, mut severity, recoverable) = match_rule(raw);
        if self.inner.last_rating() == Some(HealthRating::Critical) && severity < Severity::High {
            tracing::debug!(category = category.as_str(), "errors.escalated");
            severity = Severity::High;
        }
        if context.performance.is_none() {
            context.performance = Some(PerformanceSnapshot {
                memory_percent: self.inner.checker.memory().sample().map(|s| s.percent()),
                captured_at: Some(Utc::now()),
            });
        }
        ClassifiedError {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            name: raw.name.clone(),
            message: raw.message.clone(),
            stack: raw.stack.clone(),
            category,
            severity,
            recoverable,
            retry_count: 0,
            context,
            recovery: None,
        }
    }

    /// Store a classified error and bump its counters. Returns its id.
    pub fn record_error(&self, error: ClassifiedError) -> u64 {
        let id = error.id;
        match error.severity {
            Severity::Critical | Severity::High => tracing::error!(
                id,
                category = error.category.as_str(),
                severity = error.severity.as_str(),
                component = error.context.component.as_deref(),
                message = %error.message,
                "errors.recorded"
            ),
            Severity::Medium | Severity::Low => tracing::warn!(
                id,
                category = error.category.as_str(),
                severity = error.severity.as_str(),
                component = error.context.component.as_deref(),
                message = %error.message,
                "errors.recorded"
            ),
        }
        if let Some(evicted) = self.inner.log().push(error) {
            tracing::trace!(evicted = evicted.id, "errors.ring.evicted");
        }
        id
    }

    /// Run the recovery action for a recorded error.
    ///
    /// Each record gets at most one attempt; later calls return
    /// `AlreadyAttempted`. A failed or timed-out action marks the record
    /// non-recoverable.
    pub async fn attempt_recovery(&self, id: u64) -> RecoveryOutcome {
        let (action, category) = {
            let mut log = self.inner.log();
            let Some(record) = log.get_mut(id) else {
                return RecoveryOutcome::Skipped {
                    reason: format!("no buffered error with id {id}"),
                };
            };
            if record.recovery.is_some() {
                return RecoveryOutcome::AlreadyAttempted;
            }
            let action = RecoveryAction::for_category(record.category);
            record.retry_count += 1;
            record.recovery = Some(RecoveryOutcome::InProgress { action });
            let category = record.category;
            log.note_recovery_attempt(category);
            (action, category)
        };
        tracing::info!(id, action = action.as_str(), category = category.as_str(), "errors.recovery.start");
        let mut attempt = RecoveryAttempt {
            inner: &self.inner,
            id,
            action,
            settled: false,
        };

        let timeout = self.inner.config.recovery_timeout();
        let outcome = match tokio::time::timeout(timeout, self.inner.remediator.apply(action)).await {
            Ok(Ok(detail)) => RecoveryOutcome::Succeeded { action, detail },
            Ok(Err(err)) => RecoveryOutcome::Failed {
                action,
                reason: err.to_string(),
            },
            Err(_) => RecoveryOutcome::Failed {
                action,
                reason: format!("timed out after {} ms", timeout.as_millis()),
            },
        };
        attempt.settle(outcome.clone());
        outcome
    }

    /// Classify and record an error, then attempt automatic recovery when it
    /// is critical and its category is still under the recovery cap.
    pub async fn handle_error(&self, raw: &RawError, context: ErrorContext) -> ClassifiedError {
        let classified = self.classify(raw, context);
        let critical = classified.severity == Severity::Critical;
        let category = classified.category;
        let id = self.record_error(classified.clone());
        if !critical {
            return classified;
        }

        let capped = {
            let mut log = self.inner.log();
            let capped =
                log.recoveries_for(category) >= self.inner.config.max_recoveries_per_category;
            if capped {
                if let Some(record) = log.get_mut(id) {
                    record.recovery = Some(RecoveryOutcome::Skipped {
                        reason: "recovery limit reached for category".to_string(),
                    });
                }
            }
            capped
        };
        if capped {
            tracing::warn!(id, category = category.as_str(), "errors.recovery.capped");
        } else {
            self.attempt_recovery(id).await;
        }
        self.error(id).unwrap_or(classified)
    }

    pub fn error(&self, id: u64) -> Option<ClassifiedError> {
        self.inner.log().get(id).cloned()
    }

    /// Buffered errors, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ClassifiedError> {
        self.inner.log().latest(limit)
    }

    /// Drop buffered records. Lifetime counters and recovery caps are kept.
    pub fn clear_errors(&self) -> usize {
        self.inner.log().clear_records()
    }

    pub fn stats(&self) -> ErrorStats {
        let mut stats = self
            .inner
            .log()
            .stats(self.inner.config.recent_window(), Utc::now());
        stats.health = self.last_health();
        stats
    }

    /// Probe every subsystem now and publish the report.
    pub async fn check_health(&self) -> HealthReport {
        let report = self.inner.checker.check().await;
        if report.overall == HealthRating::Healthy {
            tracing::debug!("errors.health.healthy");
        } else {
            let failing: Vec<&str> = report
                .subsystems()
                .into_iter()
                .filter(|(_, s)| s.rating != HealthRating::Healthy)
                .map(|(name, _)| name)
                .collect();
            tracing::warn!(overall = report.overall.as_str(), ?failing, "errors.health.degraded");
        }
        let published = report.clone();
        if let Err(err) = self.inner.health.update(move |slot| *slot = Some(published)) {
            tracing::warn!(error = %err, "errors.health.publish_failed");
        }
        report
    }

    pub fn last_health(&self) -> Option<HealthReport> {
        self.inner.health.get().ok().flatten()
    }

    /// Shared health snapshot for polling UIs.
    pub fn health(&self) -> Observable<Option<HealthReport>> {
        self.inner.health.clone()
    }

    /// Notified with a new version after every published report.
    pub fn subscribe_health(&self) -> watch::Receiver<u64> {
        self.inner.health.subscribe()
    }

    /// Start the periodic health check. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.active_count() > 0 {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_interval();
        tasks.track(task::spawn_periodic("errors.health", period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                ErrorService { inner }.check_health().await;
                true
            }
        }));
        tracing::info!(period_ms = period.as_millis() as u64, "errors.started");
    }

    pub fn shutdown(&self) -> usize {
        let stopped = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        tracing::info!(stopped, "errors.shutdown");
        stopped
    }
}
