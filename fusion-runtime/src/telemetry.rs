//! Tracing subscriber setup.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::error::TracingInitSnafu;

/// Environment variable overriding the default filter, e.g.
/// `FUSION_LOG=fusion_runtime=debug`.
pub const LOG_ENV: &str = "FUSION_LOG";

pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a global fmt subscriber writing to stderr.
pub fn init_tracing(default_filter: &str) -> crate::Result<()> {
    init_tracing_with_writer(default_filter, std::io::stderr)
}

/// Install a global fmt subscriber writing to `writer`, without ANSI colors.
/// Fails if a global subscriber is already set.
pub fn init_tracing_with_writer<W>(default_filter: &str, writer: W) -> crate::Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let result = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_filter))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init();
    if let Err(err) = result {
        return TracingInitSnafu {
            message: err.to_string(),
        }
        .fail();
    }
    Ok(())
}
