//! Client-side runtime services for a single-page application shell.
//!
//! Three services share one bootstrap ([`ClientRuntime`]):
//! a lazy [`ComponentRegistry`], a [`NavigationBus`] and an [`ErrorService`].
//! Host capabilities are injected through the traits in [`host`].

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod navigation;
pub mod registry;
pub mod runtime;
pub mod state;
pub mod task;
pub mod telemetry;

pub use error::{BoxError, Error, LoadError, Result};

// Re-export common types for convenience
pub use config::{BusConfig, ErrorServiceConfig, RegistryConfig, RuntimeConfig};
pub use diagnostics::{
    ClassifiedError, ErrorCategory, ErrorContext, ErrorService, ErrorStats, HealthRating,
    HealthReport, RawError, RecoveryAction, RecoveryOutcome, Severity,
};
pub use host::ClientHost;
pub use navigation::{
    EventKind, ListenerOptions, NavigationBus, NavigationEvent, Navigator, Subscription,
};
pub use registry::{ComponentConfig, ComponentRegistry, LoadState, Priority};
pub use runtime::{ClientRuntime, RuntimeSnapshot};
pub use state::Observable;
pub use task::{TaskHandle, TaskTracker};
