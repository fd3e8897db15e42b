//! Tracing subscriber bootstrap.
//!
//! Installs a global `tracing-subscriber` registry with an `EnvFilter` and a
//! human-readable or JSON formatting layer, selected by [`LogConfig`].

use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

/// Errors from installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Installs the process-wide tracing subscriber.
///
/// The configured filter is always validated; `RUST_LOG` replaces it when
/// present and parseable.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidFilter` for a malformed `config.filter`
/// and `TelemetryError::AlreadyInitialized` if a subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), TelemetryError> {
    let configured =
        EnvFilter::try_new(&config.filter).map_err(|source| TelemetryError::InvalidFilter {
            filter: config.filter.clone(),
            source,
        })?;
    let filter = EnvFilter::try_from_default_env().unwrap_or(configured);

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init()?,
    }
    Ok(())
}
