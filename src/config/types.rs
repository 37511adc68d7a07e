//! Configuration types for the verification suite
//!
//! All types implement `Deserialize` and `Serialize` for JSON configuration
//! files. Everything except the two underlay addresses has a default.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Main suite configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Network service requested by the client
    #[serde(default = "default_network_service")]
    pub network_service: String,

    /// Endpoint (server) side
    pub endpoint: EndpointConfig,

    /// Client side
    pub client: ClientConfig,

    /// Token issuance
    #[serde(default)]
    pub token: TokenConfig,

    /// Reachability verification
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl SuiteConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_service.is_empty() {
            return Err(ConfigError::ValidationError(
                "network_service cannot be empty".into(),
            ));
        }

        self.endpoint.validate()?;
        self.client.validate()?;

        if self.endpoint.name == self.client.name {
            return Err(ConfigError::ValidationError(format!(
                "endpoint and client share the name {}",
                self.endpoint.name
            )));
        }

        if self.endpoint.underlay_ip == self.client.underlay_ip {
            return Err(ConfigError::ValidationError(format!(
                "endpoint and client share the underlay address {}",
                self.client.underlay_ip
            )));
        }

        if let Some(prefix) = self
            .endpoint
            .prefixes
            .iter()
            .find(|p| p.contains(&self.client.underlay_ip))
        {
            return Err(ConfigError::ValidationError(format!(
                "client underlay address {} lies inside connection prefix {prefix}",
                self.client.underlay_ip
            )));
        }

        self.token.validate()?;
        self.verify.validate()?;
        self.log.validate()?;

        Ok(())
    }

    /// Configuration used when no file is given
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            network_service: default_network_service(),
            endpoint: EndpointConfig {
                name: default_endpoint_name(),
                prefixes: default_prefixes(),
                underlay_ip: IpAddr::from([172, 16, 0, 1]),
            },
            client: ClientConfig {
                name: default_client_name(),
                underlay_ip: IpAddr::from([172, 16, 0, 2]),
            },
            token: TokenConfig::default(),
            verify: VerifyConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Endpoint settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Endpoint name, used as its path segment name
    #[serde(default = "default_endpoint_name")]
    pub name: String,

    /// Connection address prefixes, one point-to-point pair per prefix
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<IpNet>,

    /// Endpoint underlay address (tunnel outer address)
    pub underlay_ip: IpAddr,
}

impl EndpointConfig {
    /// Validate endpoint settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "endpoint name cannot be empty".into(),
            ));
        }

        if self.prefixes.len() != 2 {
            return Err(ConfigError::ValidationError(format!(
                "endpoint needs exactly 2 prefixes, got {}",
                self.prefixes.len()
            )));
        }

        let (first, second) = (self.prefixes[0].trunc(), self.prefixes[1].trunc());
        if first.contains(&second) || second.contains(&first) {
            return Err(ConfigError::ValidationError(format!(
                "prefixes {first} and {second} overlap"
            )));
        }

        for prefix in &self.prefixes {
            // A point-to-point pair needs two host addresses
            let max = match prefix {
                IpNet::V4(_) => 30,
                IpNet::V6(_) => 126,
            };
            if prefix.prefix_len() > max {
                return Err(ConfigError::ValidationError(format!(
                    "prefix {prefix} is too small for an address pair"
                )));
            }
            if prefix.contains(&self.underlay_ip) {
                return Err(ConfigError::ValidationError(format!(
                    "endpoint underlay address {} lies inside connection prefix {prefix}",
                    self.underlay_ip
                )));
            }
        }

        Ok(())
    }
}

/// Client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Client name, used as its path segment name
    #[serde(default = "default_client_name")]
    pub name: String,

    /// Client underlay address (tunnel outer address)
    pub underlay_ip: IpAddr,
}

impl ClientConfig {
    /// Validate client settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "client name cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Token issuance settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Token lifetime in seconds
    #[serde(default = "default_token_lifetime_secs")]
    pub lifetime_secs: u64,
}

impl TokenConfig {
    /// Token lifetime
    #[must_use]
    pub const fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    /// Validate token settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lifetime_secs == 0 {
            return Err(ConfigError::ValidationError(
                "token lifetime_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: default_token_lifetime_secs(),
        }
    }
}

/// Verification settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyConfig {
    /// Bound on a single probe in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl VerifyConfig {
    /// Probe timeout
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate verification settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "unknown log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "log format must be json or text, got {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

fn default_network_service() -> String {
    "ipsec".into()
}

fn default_endpoint_name() -> String {
    "ipsec-endpoint".into()
}

fn default_client_name() -> String {
    "ipsec-client".into()
}

fn default_prefixes() -> Vec<IpNet> {
    vec![
        IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 24)),
        IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7)),
    ]
}

const fn default_token_lifetime_secs() -> u64 {
    600
}

const fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
