//! Configuration module
//!
//! This module provides the suite configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use ipsec_chain::config::{load_config, SuiteConfig};
//!
//! let config: SuiteConfig = load_config("/etc/ipsec-chain/suite.json").unwrap();
//! println!("Endpoint prefixes: {:?}", config.endpoint.prefixes);
//! ```

mod loader;
mod types;

pub use loader::{
    create_default_config, load_config, load_config_str, load_config_with_env, ENV_LOG_LEVEL,
    ENV_NETWORK_SERVICE, ENV_PROBE_TIMEOUT_MS,
};
pub use types::{ClientConfig, EndpointConfig, LogConfig, SuiteConfig, TokenConfig, VerifyConfig};
