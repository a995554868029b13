use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Component '{id}' is not registered"))]
    NotRegistered { id: String },

    #[snafu(display("Component '{id}' is already registered"))]
    DuplicateComponent { id: String },

    #[snafu(display("Invalid config for component '{id}': {reason}"))]
    InvalidComponentConfig { id: String, reason: String },

    #[snafu(display("Component '{id}' failed after {attempts} attempt(s): {source}"))]
    LoadRetriesExhausted {
        id: String,
        attempts: u32,
        source: LoadError,
    },

    #[snafu(display("Listener {listener} timed out after {timeout:?}"))]
    ListenerTimeout { listener: u64, timeout: Duration },

    #[snafu(display("Navigation bus has been destroyed"))]
    BusDestroyed,

    #[snafu(display("Storage write for '{key}' failed: {reason}"))]
    StorageWrite { key: String, reason: String },

    #[snafu(display("Failed to lock mutex: poisoned"))]
    LockPoisoned,

    #[snafu(display("Failed to read config {}: {source}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config: {source}"))]
    ConfigParse { source: toml::de::Error },

    #[snafu(display("Invalid runtime config: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("Failed to install tracing subscriber: {message}"))]
    TracingInit { message: String },
}

/// Failure of a single load attempt.
///
/// Clonable so that one settled failure can be handed to every caller waiting
/// on the same in-flight load.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoadError {
    #[snafu(display("load timed out after {timeout:?}"))]
    Timeout { timeout: Duration },

    #[snafu(display("loader rejected: {message}"))]
    Rejected { message: String },

    #[snafu(display("loader panicked"))]
    Panicked,

    #[snafu(display("load abandoned before it settled"))]
    Abandoned,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by loaders, listeners and other host callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
