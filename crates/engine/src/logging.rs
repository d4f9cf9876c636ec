//! Logging initialization for fconv
//!
//! Logs go to stderr so they never mix with the progress display, which
//! draws to the terminal separately.

use fconv_config::LoggingConfig;
use tracing::Subscriber;
use tracing_subscriber::{fmt, EnvFilter};

/// Builds the filter: `RUST_LOG` wins over the configured level
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Subscriber writing plain or JSON lines to stderr
fn subscriber(config: &LoggingConfig) -> Box<dyn Subscriber + Send + Sync> {
    let filter = env_filter(config);

    if config.json {
        Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .finish(),
        )
    } else {
        Box::new(
            fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .finish(),
        )
    }
}

/// Installs the global tracing subscriber
///
/// Calling it again after a subscriber is installed has no effect.
pub fn init_logging(config: &LoggingConfig) {
    tracing::subscriber::set_global_default(subscriber(config)).ok();
}
