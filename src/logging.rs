//! Logging initialization
//!
//! Installs a `tracing_subscriber` fmt subscriber. `RUST_LOG` directives,
//! when set, take precedence over the configured level.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Install the global subscriber
///
/// Returns `false` if a subscriber was already installed, which is
/// expected when several tests initialize logging.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target);

    let result = match (config.format.as_str(), config.timestamps) {
        ("json", true) => builder.json().try_init(),
        ("json", false) => builder.json().without_time().try_init(),
        (_, true) => builder.try_init(),
        (_, false) => builder.without_time().try_init(),
    };
    result.is_ok()
}
