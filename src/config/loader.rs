//! Configuration loading
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::SuiteConfig;
use crate::error::ConfigError;

/// Log level override
pub const ENV_LOG_LEVEL: &str = "IPSEC_CHAIN_LOG_LEVEL";
/// Probe timeout override, in milliseconds
pub const ENV_PROBE_TIMEOUT_MS: &str = "IPSEC_CHAIN_PROBE_TIMEOUT_MS";
/// Network service name override
pub const ENV_NETWORK_SERVICE: &str = "IPSEC_CHAIN_NETWORK_SERVICE";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<SuiteConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: SuiteConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: endpoint={} client={} prefixes={:?}",
        config.endpoint.name, config.client.name, config.endpoint.prefixes
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<SuiteConfig, ConfigError> {
    let config: SuiteConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `IPSEC_CHAIN_LOG_LEVEL`: Override log level
/// - `IPSEC_CHAIN_PROBE_TIMEOUT_MS`: Override probe timeout
/// - `IPSEC_CHAIN_NETWORK_SERVICE`: Override requested network service
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<SuiteConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides looked up through `lookup`, then re-validate
fn apply_env(
    config: &mut SuiteConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(timeout) = lookup(ENV_PROBE_TIMEOUT_MS) {
        config.verify.probe_timeout_ms = timeout.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_PROBE_TIMEOUT_MS.into(),
            reason: format!("Invalid number: {timeout}"),
        })?;
        debug!("Probe timeout overridden to {}ms", config.verify.probe_timeout_ms);
    }

    if let Some(service) = lookup(ENV_NETWORK_SERVICE) {
        config.network_service = service;
        debug!("Network service overridden to {}", config.network_service);
    }

    // Re-validate after overrides
    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = SuiteConfig::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
