//! Dataplane control client trait
//!
//! The chain never constructs or closes a dataplane handle itself; an
//! `Arc<dyn Dataplane>` is injected into every element that programs it
//! and into the reachability verifier.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::DataplaneError;

/// Dataplane interface handle
pub type InterfaceIndex = u32;

/// IKE port
pub const IKE_PORT: u16 = 500;

/// IKE/ESP NAT traversal port
pub const NAT_T_PORT: u16 = 4500;

/// Parameters of an IPsec tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpsecTunnel {
    /// Local underlay address
    pub local_ip: IpAddr,
    /// Remote underlay address
    pub remote_ip: IpAddr,
    /// Inbound security parameter index
    pub spi_in: u32,
    /// Outbound security parameter index
    pub spi_out: u32,
    /// Opaque shared key material
    pub psk: String,
}

impl IpsecTunnel {
    /// Check if `other` is the far end of this tunnel
    ///
    /// The far end swaps the underlay addresses and the SPIs and holds the
    /// same key material.
    #[must_use]
    pub fn mirrors(&self, other: &Self) -> bool {
        self.local_ip == other.remote_ip
            && self.remote_ip == other.local_ip
            && self.spi_in == other.spi_out
            && self.spi_out == other.spi_in
            && self.psk == other.psk
    }
}

/// Transport protocol of a pinhole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinholeProtocol {
    Udp,
    Tcp,
}

/// Firewall opening admitting traffic from `addr` to a local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pinhole {
    /// Remote address allowed in
    pub addr: IpAddr,
    /// Local port
    pub port: u16,
    /// Protocol
    pub protocol: PinholeProtocol,
}

impl Pinhole {
    /// UDP pinhole
    #[must_use]
    pub const fn udp(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            protocol: PinholeProtocol::Udp,
        }
    }
}

impl std::fmt::Display for Pinhole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            PinholeProtocol::Udp => "udp",
            PinholeProtocol::Tcp => "tcp",
        };
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{proto}://{addr}:{}", self.port),
            IpAddr::V6(addr) => write!(f, "{proto}://[{addr}]:{}", self.port),
        }
    }
}

/// Operations the chain needs from the dataplane
///
/// Implementations must treat deletions of things already gone as
/// `InterfaceNotFound` (for interfaces) or success (for routes and
/// pinholes), so that close paths stay idempotent.
#[async_trait]
pub trait Dataplane: Send + Sync {
    /// Create an IPsec tunnel interface (admin down, no addresses)
    async fn create_ipsec_tunnel(&self, tunnel: &IpsecTunnel) -> Result<InterfaceIndex, DataplaneError>;

    /// Delete an interface together with its addresses and routes
    async fn delete_interface(&self, if_index: InterfaceIndex) -> Result<(), DataplaneError>;

    /// Add an address to an interface
    async fn add_interface_address(&self, if_index: InterfaceIndex, addr: IpNet) -> Result<(), DataplaneError>;

    /// Set interface admin state
    async fn set_interface_admin_up(&self, if_index: InterfaceIndex, up: bool) -> Result<(), DataplaneError>;

    /// Route `prefix` through an interface
    async fn add_route(&self, if_index: InterfaceIndex, prefix: IpNet) -> Result<(), DataplaneError>;

    /// Remove a route
    async fn del_route(&self, if_index: InterfaceIndex, prefix: IpNet) -> Result<(), DataplaneError>;

    /// Open a pinhole
    async fn add_pinhole(&self, pinhole: Pinhole) -> Result<(), DataplaneError>;

    /// Close a pinhole
    async fn del_pinhole(&self, pinhole: Pinhole) -> Result<(), DataplaneError>;

    /// Send one echo request towards `addr` and wait for the reply
    ///
    /// Returns the round-trip time. An error means the probe could not be
    /// sent; a missing reply shows up as a future that never resolves, so
    /// callers must bound it with a context.
    async fn echo(&self, addr: IpAddr) -> Result<Duration, DataplaneError>;
}
