//! Tracing subscriber initialisation for Condensat binaries.

use crate::config::LoggingConfig;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Logging initialisation errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directive}': {source}")]
    InvalidFilter {
        directive: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the event filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|source| LoggingError::InvalidFilter {
        directive: config.level.clone(),
        source,
    })
}

fn fmt_layer<S>(config: &LoggingConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if config.format == "json" {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    }
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    init_with_layer(config, None::<tracing_subscriber::layer::Identity>)
}

/// Install the global subscriber with an extra layer below the filter.
pub fn init_with_layer<L>(config: &LoggingConfig, extra: Option<L>) -> Result<(), LoggingError>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    let filter = env_filter(config)?;
    tracing_subscriber::registry()
        .with(extra)
        .with(filter)
        .with(fmt_layer(config))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        let config = LoggingConfig {
            level: "condensat=verbose".to_owned(),
            format: "human".to_owned(),
            ..LoggingConfig::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(
                env_filter(&config),
                Err(LoggingError::InvalidFilter { .. })
            ));
        }
    }

    #[test]
    fn test_valid_directives_parse() {
        let config = LoggingConfig {
            level: "info,condensat_monitor=debug".to_owned(),
            format: "json".to_owned(),
            ..LoggingConfig::default()
        };
        assert!(env_filter(&config).is_ok());
    }
}
