//! Classified error records and the bounded error log.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::classify::{ErrorCategory, ErrorContext, Severity};
use super::health::HealthReport;
use super::recovery::RecoveryOutcome;

/// An error after classification, as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedError {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub retry_count: u32,
    pub context: ErrorContext,
    pub recovery: Option<RecoveryOutcome>,
}

impl ClassifiedError {
    /// Counter key: `category:name`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.category, self.name)
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}: {}",
            self.category, self.severity, self.name, self.message
        )
    }
}

impl std::error::Error for ClassifiedError {}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub critical_errors: u64,
    pub recent_errors: usize,
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    pub errors_by_key: BTreeMap<String, u64>,
    pub distinct_error_keys: usize,
    pub recovery_attempts: u64,
    pub successful_recoveries: u64,
    /// Successful recoveries over attempts, 0 when nothing was attempted.
    pub recovery_rate: f64,
    pub health: Option<HealthReport>,
}

/// Ring buffer of recent records plus lifetime counters.
#[derive(Debug)]
pub(crate) struct ErrorLog {
    capacity: usize,
    records: VecDeque<ClassifiedError>,
    total: u64,
    critical: u64,
    by_category: BTreeMap<ErrorCategory, u64>,
    by_key: BTreeMap<String, u64>,
    recovery_attempts: u64,
    successful_recoveries: u64,
    recoveries_by_category: HashMap<ErrorCategory, u32>,
}

impl ErrorLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
            total: 0,
            critical: 0,
            by_category: BTreeMap::new(),
            by_key: BTreeMap::new(),
            recovery_attempts: 0,
            successful_recoveries: 0,
            recoveries_by_category: HashMap::new(),
        }
    }

    /// Append a record, evicting the oldest when full. Returns the evicted one.
    pub(crate) fn push(&mut self, record: ClassifiedError) -> Option<ClassifiedError> {
        self.total += 1;
        if record.severity == Severity::Critical {
            self.critical += 1;
        }
        *self.by_category.entry(record.category).or_default() += 1;
        *self.by_key.entry(record.key()).or_default() += 1;
        let evicted = if self.records.len() == self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub(crate) fn get(&self, id: u64) -> Option<&ClassifiedError> {
        self.records.iter().find(|r| r.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut ClassifiedError> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Newest first.
    pub(crate) fn latest(&self, limit: usize) -> Vec<ClassifiedError> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn recoveries_for(&self, category: ErrorCategory) -> u32 {
        self.recoveries_by_category
            .get(&category)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn note_recovery_attempt(&mut self, category: ErrorCategory) {
        self.recovery_attempts += 1;
        *self.recoveries_by_category.entry(category).or_default() += 1;
    }

    pub(crate) fn note_recovery_success(&mut self) {
        self.successful_recoveries += 1;
    }

    /// Drop the buffered records. Lifetime counters are kept.
    pub(crate) fn clear_records(&mut self) -> usize {
        let cleared = self.records.len();
        self.records.clear();
        cleared
    }

    pub(crate) fn stats(&self, recent_window: Duration, now: DateTime<Utc>) -> ErrorStats {
        let recent_errors = self
            .records
            .iter()
            .filter(|r| {
                (now - r.timestamp)
                    .to_std()
                    .map_or(true, |age| age <= recent_window)
            })
            .count();
        let recovery_rate = if self.recovery_attempts == 0 {
            0.0
        } else {
            self.successful_recoveries as f64 / self.recovery_attempts as f64
        };
        ErrorStats {
            total_errors: self.total,
            critical_errors: self.critical,
            recent_errors,
            errors_by_category: self.by_category.clone(),
            errors_by_key: self.by_key.clone(),
            distinct_error_keys: self.by_key.len(),
            recovery_attempts: self.recovery_attempts,
            successful_recoveries: self.successful_recoveries,
            recovery_rate,
            health: None,
        }
    }
}
