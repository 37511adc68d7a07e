//! Connection descriptor types
//!
//! These types cross the transport boundary between the initiator and the
//! endpoint, so everything except the metadata map is serializable.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::SystemTime;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::metadata::MetadataMap;

/// Connection state as seen by the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Path programmed
    Up,
    /// Not (yet) programmed, or torn down
    #[default]
    Down,
}

/// Negotiated dataplane mechanism
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    /// Mechanism identifier, e.g. `IPSEC`
    #[serde(rename = "type")]
    pub mechanism_type: String,
    /// Mechanism-specific parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
    /// Create a mechanism with no parameters
    pub fn new(mechanism_type: impl Into<String>) -> Self {
        Self {
            mechanism_type: mechanism_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Get a parameter
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Parse a parameter holding an IP address
    #[must_use]
    pub fn ip_parameter(&self, key: &str) -> Option<IpAddr> {
        self.parameter(key).and_then(|value| value.parse().ok())
    }
}

/// Addresses and routes assigned to a connection
///
/// Addresses are only ever added, never replaced: once an address family
/// has been assigned for a connection it stays fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpContext {
    /// Client-side addresses
    #[serde(default)]
    src_ip_addrs: Vec<IpNet>,
    /// Endpoint-side addresses
    #[serde(default)]
    dst_ip_addrs: Vec<IpNet>,
}

impl IpContext {
    /// Client-side addresses
    #[must_use]
    pub fn src_ip_addrs(&self) -> &[IpNet] {
        &self.src_ip_addrs
    }

    /// Endpoint-side addresses
    #[must_use]
    pub fn dst_ip_addrs(&self) -> &[IpNet] {
        &self.dst_ip_addrs
    }

    /// Host addresses of the source set
    pub fn src_addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.src_ip_addrs.iter().map(IpNet::addr)
    }

    /// Host addresses of the destination set
    pub fn dst_addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.dst_ip_addrs.iter().map(IpNet::addr)
    }

    /// Check if an address of the given family is already assigned
    #[must_use]
    pub fn has_family(&self, ipv4: bool) -> bool {
        self.src_ip_addrs
            .iter()
            .chain(&self.dst_ip_addrs)
            .any(|net| matches!(net, IpNet::V4(_)) == ipv4)
    }

    /// Assign a source/destination pair
    ///
    /// Returns `false` and leaves the context untouched if either address
    /// is already present.
    pub fn assign_pair(&mut self, src: IpNet, dst: IpNet) -> bool {
        if self.src_ip_addrs.contains(&src) || self.dst_ip_addrs.contains(&dst) {
            return false;
        }
        self.src_ip_addrs.push(src);
        self.dst_ip_addrs.push(dst);
        true
    }

    /// Check if both addresses of a pair are assigned
    #[must_use]
    pub fn contains_pair(&self, src: &IpNet, dst: &IpNet) -> bool {
        self.src_ip_addrs.contains(src) && self.dst_ip_addrs.contains(dst)
    }
}

/// Connection context carried across the boundary
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionContext {
    /// IP addressing for the connection
    #[serde(default)]
    pub ip_context: IpContext,
}

/// One hop of the connection path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Name of the chain that owns the hop
    pub name: String,
    /// Connection id as known to that hop
    pub id: String,
    /// Opaque credential issued by the hop
    pub token: String,
    /// Token expiry
    pub expires: SystemTime,
}

/// Ordered list of hops and the index of the current one
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Path {
    /// Index of the hop currently processing the connection
    pub index: usize,
    /// Hops in traversal order
    #[serde(default)]
    pub segments: Vec<PathSegment>,
}

impl Path {
    /// Segment at the current index
    #[must_use]
    pub fn current(&self) -> Option<&PathSegment> {
        self.segments.get(self.index)
    }
}

/// A single logical path between client and endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    /// Unique connection id
    pub id: String,
    /// Requested network service
    #[serde(default)]
    pub network_service: String,
    /// Selected mechanism, set by the endpoint
    #[serde(default)]
    pub mechanism: Option<Mechanism>,
    /// Addressing context
    #[serde(default)]
    pub context: ConnectionContext,
    /// Traversed hops
    #[serde(default)]
    pub path: Path,
    /// Programming state
    #[serde(default)]
    pub state: State,
    /// Process-local metadata, never serialized
    #[serde(skip)]
    pub metadata: MetadataMap,
}

impl Connection {
    /// Create a connection descriptor for a network service
    pub fn new(id: impl Into<String>, network_service: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_service: network_service.into(),
            ..Self::default()
        }
    }

    /// Shortcut to the IP context
    #[must_use]
    pub fn ip_context(&self) -> &IpContext {
        &self.context.ip_context
    }

    /// Selected mechanism type, if any
    #[must_use]
    pub fn mechanism_type(&self) -> Option<&str> {
        self.mechanism.as_ref().map(|m| m.mechanism_type.as_str())
    }
}

/// A request traversing a chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// Target connection, partially populated by the client
    pub connection: Connection,
    /// Mechanisms offered by the client, most preferred first
    #[serde(default)]
    pub mechanism_preferences: Vec<Mechanism>,
}

impl Request {
    /// Create a request for a connection
    #[must_use]
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            mechanism_preferences: Vec::new(),
        }
    }

    /// Builder-style preference append
    #[must_use]
    pub fn with_preference(mut self, mechanism: Mechanism) -> Self {
        self.mechanism_preferences.push(mechanism);
        self
    }

    /// Connection id shortcut
    #[must_use]
    pub fn id(&self) -> &str {
        &self.connection.id
    }
}
