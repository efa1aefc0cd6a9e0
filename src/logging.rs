//! Logging setup
//!
//! Installs a `tracing` subscriber driven by [`LoggingConfig`]. `RUST_LOG`
//! takes precedence over the configured level when set.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Default filter directives for a configured level
pub fn default_directives(level: &str) -> String {
    format!("wshub={level},tower_http={level}")
}

/// Install the global subscriber
///
/// Returns an error if a subscriber was already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&config.level)))?;

    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        "pretty" => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        other => {
            registry.with(tracing_subscriber::fmt::layer()).try_init()?;
            tracing::warn!(format = %other, "Unknown log format, using pretty");
        }
    }

    Ok(())
}
