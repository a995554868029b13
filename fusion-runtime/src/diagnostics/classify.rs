//! Rule-based error classification.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Authentication,
    Navigation,
    Network,
    Memory,
    Rendering,
    Permissions,
    Performance,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Authentication,
        ErrorCategory::Navigation,
        ErrorCategory::Network,
        ErrorCategory::Memory,
        ErrorCategory::Rendering,
        ErrorCategory::Permissions,
        ErrorCategory::Performance,
        ErrorCategory::Unknown,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Navigation => "navigation",
            Self::Network => "network",
            Self::Memory => "memory",
            Self::Rendering => "rendering",
            Self::Permissions => "permissions",
            Self::Performance => "performance",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime figures captured when an error is classified.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub memory_percent: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Where an error happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    pub component: Option<String>,
    pub url: Option<String>,
    pub session_id: Option<String>,
    pub performance: Option<PerformanceSnapshot>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// An unclassified error as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RawError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture a Rust error. The source chain stands in for the stack.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            name: "Error".to_string(),
            message: err.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\ncaused by: ")),
        }
    }

    fn haystack(&self) -> String {
        let mut text = format!("{} {}", self.name, self.message);
        if let Some(stack) = &self.stack {
            text.push(' ');
            text.push_str(stack);
        }
        text.to_lowercase()
    }
}

struct Rule {
    tokens: &'static [&'static str],
    category: ErrorCategory,
    severity: Severity,
    recoverable: bool,
}

/// Checked in order; the first rule with a matching token wins.
const RULES: &[Rule] = &[
    Rule {
        tokens: &["auth", "token", "unauthorized", "401", "login", "session expired", "jwt"],
        category: ErrorCategory::Authentication,
        severity: Severity::High,
        recoverable: true,
    },
    Rule {
        tokens: &["memory", "heap", "allocation failed"],
        category: ErrorCategory::Memory,
        severity: Severity::Critical,
        recoverable: false,
    },
    Rule {
        tokens: &["network", "fetch", "timeout", "timed out", "connection", "econnrefused", "offline"],
        category: ErrorCategory::Network,
        severity: Severity::Medium,
        recoverable: true,
    },
    Rule {
        tokens: &["react", "render", "component", "hydration"],
        category: ErrorCategory::Rendering,
        severity: Severity::Medium,
        recoverable: true,
    },
    Rule {
        tokens: &["permission", "forbidden", "403", "denied"],
        category: ErrorCategory::Permissions,
        severity: Severity::High,
        recoverable: false,
    },
    Rule {
        tokens: &["chunkloaderror", "loading chunk", "route", "navigation"],
        category: ErrorCategory::Navigation,
        severity: Severity::Medium,
        recoverable: true,
    },
    Rule {
        tokens: &["performance", "long task", "frame budget", "slow"],
        category: ErrorCategory::Performance,
        severity: Severity::Low,
        recoverable: true,
    },
];

/// Category, base severity and recoverability for a raw error.
pub fn match_rule(raw: &RawError) -> (ErrorCategory, Severity, bool) {
    let text = raw.haystack();
    RULES
        .iter()
        .find(|rule| rule.tokens.iter().any(|token| text.contains(token)))
        .map(|rule| (rule.category, rule.severity, rule.recoverable))
        .unwrap_or((ErrorCategory::Unknown, Severity::Medium, true))
}
