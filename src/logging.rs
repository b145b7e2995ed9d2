//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events; embedding processes call
//! [`init_logging`] once at startup to route them somewhere.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Default filter directive for a verbosity level.
pub fn default_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `verbosity`. Fails if a global
/// subscriber is already set.
pub fn init_logging(
    verbosity: u8,
    format: LogFormat,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(verbosity >= 3))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(verbosity >= 3))
            .try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
}
