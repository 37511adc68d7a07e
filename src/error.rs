//! Error types for ipsec-chain
//!
//! This module defines the error hierarchy for the connection chain.
//! Errors are grouped by subsystem: the chain itself, the collaborators
//! it drives (dataplane, address allocator), the verification layer and
//! configuration loading. Each group carries recovery hints.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by chain elements and composed chains
#[derive(Debug, Error)]
pub enum ChainError {
    /// The authorization gate rejected the request
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// No registered handler for any of the requested mechanisms
    #[error("Unsupported mechanism: {requested:?}")]
    UnsupportedMechanism { requested: Vec<String> },

    /// The address allocator could not provide an address
    #[error("Address allocation failed in {element} for connection {connection_id}: {source}")]
    AllocationFailed {
        element: String,
        connection_id: String,
        #[source]
        source: AllocatorError,
    },

    /// A dataplane side effect failed
    #[error("Dataplane programming failed in {element} for connection {connection_id}: {source}")]
    DataplaneProgrammingFailed {
        element: String,
        connection_id: String,
        #[source]
        source: DataplaneError,
    },

    /// The context was cancelled or its deadline passed
    #[error("Operation cancelled in {element} for connection {connection_id}")]
    Cancelled {
        element: String,
        connection_id: String,
    },

    /// The transport boundary failed to carry the request
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A value could not be stored in the connection metadata
    #[error("Metadata value for {key} not stored: {reason}")]
    Metadata { key: String, reason: String },

    /// The request was turned away before it was admitted
    ///
    /// Wraps failures raised before the authorization gate let the request
    /// in, on either side of the transport boundary.
    #[error("Connection {connection_id} not admitted: {source}")]
    NotAdmitted {
        connection_id: String,
        #[source]
        source: Box<ChainError>,
    },

    /// One or more elements failed while closing
    #[error("Close failed for connection {connection_id}: {}", ElementFailures(.failures))]
    CloseFailed {
        connection_id: String,
        failures: Vec<ElementFailure>,
    },
}

impl ChainError {
    /// Check if the connection may have been admitted past the authorization gate
    ///
    /// `false` means nothing was programmed for the request. `true` means
    /// elements after the gate may have left partial dataplane state
    /// behind, which closing the connection id releases.
    ///
    /// Transport errors count as not admitted: a transport either fails
    /// before the endpoint sees the request or withdraws what the endpoint
    /// set up when the answer cannot be delivered.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        !matches!(
            self,
            Self::Unauthorized { .. } | Self::NotAdmitted { .. } | Self::Transport(_)
        )
    }

    /// Connection id the error refers to, when it carries one
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            Self::AllocationFailed { connection_id, .. }
            | Self::DataplaneProgrammingFailed { connection_id, .. }
            | Self::Cancelled { connection_id, .. }
            | Self::NotAdmitted { connection_id, .. }
            | Self::CloseFailed { connection_id, .. } => Some(connection_id),
            _ => None,
        }
    }

    /// Check if a fresh request may succeed
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Unauthorized { .. } => false,
            Self::UnsupportedMechanism { .. } => false,
            Self::AllocationFailed { .. } => true,
            Self::DataplaneProgrammingFailed { source, .. } => source.is_recoverable(),
            Self::Cancelled { .. } => true,
            Self::Transport(_) => true,
            Self::InvalidRequest(_) => false,
            Self::NotAdmitted { source, .. } => source.is_recoverable(),
            Self::Metadata { .. } => false,
            Self::CloseFailed { .. } => false,
        }
    }

    /// Create an allocation error
    pub fn allocation(
        element: impl Into<String>,
        connection_id: impl Into<String>,
        source: AllocatorError,
    ) -> Self {
        Self::AllocationFailed {
            element: element.into(),
            connection_id: connection_id.into(),
            source,
        }
    }

    /// Create a dataplane programming error
    pub fn dataplane(
        element: impl Into<String>,
        connection_id: impl Into<String>,
        source: DataplaneError,
    ) -> Self {
        Self::DataplaneProgrammingFailed {
            element: element.into(),
            connection_id: connection_id.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(element: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self::Cancelled {
            element: element.into(),
            connection_id: connection_id.into(),
        }
    }

    /// Mark `source` as raised before admission
    ///
    /// Errors that already read as not admitted are returned unchanged.
    pub fn not_admitted(connection_id: impl Into<String>, source: ChainError) -> Self {
        if !source.is_admitted() {
            return source;
        }
        Self::NotAdmitted {
            connection_id: connection_id.into(),
            source: Box::new(source),
        }
    }

    /// Create an authorization error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }
}

/// A single element failure collected during close
#[derive(Debug)]
pub struct ElementFailure {
    /// Name of the element that failed
    pub element: String,
    /// The error it returned
    pub error: ChainError,
}

impl fmt::Display for ElementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.element, self.error)
    }
}

struct ElementFailures<'a>(&'a [ElementFailure]);

impl fmt::Display for ElementFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Errors reported by the dataplane control client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataplaneError {
    /// The interface does not exist (already deleted or never created)
    #[error("Interface {0} not found")]
    InterfaceNotFound(u32),

    /// No programmed path towards the address
    #[error("No route to {0}")]
    NoRoute(IpAddr),

    /// The dataplane refused the operation
    #[error("Operation {operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },

    /// The control channel to the dataplane is unavailable
    #[error("Dataplane unavailable: {0}")]
    Unavailable(String),
}

impl DataplaneError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Create a rejection error
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by the address allocator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// No free address left in the pool
    #[error("Address pool {0} exhausted")]
    Exhausted(String),

    /// The address does not belong to the pool
    #[error("Address {addr} is outside pool {pool}")]
    OutOfPool { addr: IpAddr, pool: String },

    /// The address is allocated to someone else
    #[error("Address {0} is already allocated")]
    InUse(IpAddr),
}

/// Errors produced by the verification layer
///
/// Never returned by production chain elements.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// No reply before the context was cancelled or timed out
    #[error("Probe to {addr} timed out after {elapsed:?}")]
    Timeout { addr: IpAddr, elapsed: Duration },

    /// The probe could not be sent
    #[error("Probe to {addr} could not be sent: {source}")]
    Transport {
        addr: IpAddr,
        #[source]
        source: DataplaneError,
    },

    /// An address still answers after the connection was closed
    #[error("Address {0} is still reachable after close")]
    StillReachable(IpAddr),
}

impl VerifyError {
    /// Address the failed probe targeted
    #[must_use]
    pub const fn addr(&self) -> IpAddr {
        match self {
            Self::Timeout { addr, .. } | Self::Transport { addr, .. } => *addr,
            Self::StillReachable(addr) => *addr,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}
