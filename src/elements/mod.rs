//! Chain elements
//!
//! - [`authorize`]: authorization gate
//! - [`update_path`]: path segment and token maintenance
//! - [`metadata`]: per-connection metadata store
//! - [`connection_context`]: interface addresses and routes
//! - [`up`]: interface admin state
//! - [`pinhole`]: firewall openings for the tunnel underlay
//!
//! Dataplane elements run on both sides of the transport boundary; the
//! [`Side`] they are built for decides which addresses are local and which
//! metadata slots they use.

pub mod authorize;
pub mod connection_context;
pub mod metadata;
pub mod pinhole;
pub mod up;
pub mod update_path;

pub use authorize::{AuthorizationPolicy, Authorize, ValidTokens};
pub use connection_context::ConnectionContextElement;
pub use metadata::Metadata;
pub use pinhole::PinholeElement;
pub use up::Up;
pub use update_path::UpdatePath;

use std::net::IpAddr;

use ipnet::IpNet;

use crate::connection::IpContext;

/// Which side of the transport boundary an element runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Connection initiator
    Client,
    /// Connection endpoint
    Server,
}

impl Side {
    /// Metadata key of the tunnel interface index
    #[must_use]
    pub const fn if_index_key(self) -> &'static str {
        match self {
            Self::Client => "client.if_index",
            Self::Server => "server.if_index",
        }
    }

    /// Metadata key of the pinholes to open
    #[must_use]
    pub const fn pinholes_key(self) -> &'static str {
        match self {
            Self::Client => "client.pinholes",
            Self::Server => "server.pinholes",
        }
    }

    /// Metadata key of the routes programmed by the connection context element
    #[must_use]
    pub const fn routes_key(self) -> &'static str {
        match self {
            Self::Client => "client.routes",
            Self::Server => "server.routes",
        }
    }

    /// Addresses owned by this side
    #[must_use]
    pub fn local_addrs(self, ip_context: &IpContext) -> &[IpNet] {
        match self {
            Self::Client => ip_context.src_ip_addrs(),
            Self::Server => ip_context.dst_ip_addrs(),
        }
    }

    /// Addresses owned by the peer
    #[must_use]
    pub fn remote_addrs(self, ip_context: &IpContext) -> &[IpNet] {
        match self {
            Self::Client => ip_context.dst_ip_addrs(),
            Self::Server => ip_context.src_ip_addrs(),
        }
    }

    /// Host addresses the peer should answer on, as probed by verification
    #[must_use]
    pub fn probe_targets(self, ip_context: &IpContext) -> Vec<IpAddr> {
        self.remote_addrs(ip_context).iter().map(IpNet::addr).collect()
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}
