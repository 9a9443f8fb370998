use tracing_subscriber::EnvFilter;

use crate::error::{RelayError, Result};

/// Install a formatted `tracing` subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. HTTP client internals are
/// capped at `warn`. Returns `Config` if a global subscriber is already
/// installed; callers that may initialize twice can ignore that error.
pub fn init_logging(default_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(default_level))
        .with_target(false)
        .try_init()
        .map_err(|e| RelayError::Config(format!("Failed to install tracing subscriber: {}", e)))
}

fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level))
        .add_directive(
            "hyper=warn"
                .parse()
                .unwrap_or_else(|_| tracing::Level::WARN.into()),
        )
        .add_directive(
            "reqwest=warn"
                .parse()
                .unwrap_or_else(|_| tracing::Level::WARN.into()),
        )
}
