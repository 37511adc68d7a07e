//! Point-to-point address assignment element
//!
//! Allocates one endpoint-side (destination) and one client-side (source)
//! host address per connection from a single prefix and writes them into
//! the connection's IP context.
//!
//! # Lifecycle
//!
//! - First request for an id: allocate destination then source.
//! - Refresh: reuse the recorded pair; the IP context is never rewritten.
//! - Close: release the pair once; later closes are no-ops.
//! - Request after close: a connection still carrying a pair from this
//!   prefix claims that pair back, and fails if either address has since
//!   gone to another connection.
//!
//! A connection that already carries an address of this prefix's family
//! from outside the prefix (assigned by another element) is left alone.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tracing::{debug, info};

use super::pool::AddressAllocator;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, IpContext, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Addresses handed to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Client-side address
    pub src: IpAddr,
    /// Endpoint-side address
    pub dst: IpAddr,
}

impl Allocation {
    fn src_net(&self) -> IpNet {
        host_net(self.src)
    }

    fn dst_net(&self) -> IpNet {
        host_net(self.dst)
    }
}

/// Host prefix (/32 or /128) for an address
#[must_use]
pub fn host_net(addr: IpAddr) -> IpNet {
    match addr {
        IpAddr::V4(addr) => IpNet::V4(Ipv4Net::from(addr)),
        IpAddr::V6(addr) => IpNet::V6(Ipv6Net::from(addr)),
    }
}

/// Point-to-point IPAM element
pub struct PointToPointIpam {
    name: String,
    allocator: Arc<dyn AddressAllocator>,
    allocations: DashMap<String, Allocation>,
}

impl PointToPointIpam {
    /// Create an element backed by `allocator`
    pub fn new(allocator: Arc<dyn AddressAllocator>) -> Self {
        Self {
            name: format!("point2pointipam[{}]", allocator.prefix()),
            allocator,
            allocations: DashMap::new(),
        }
    }

    /// Allocation recorded for a connection
    #[must_use]
    pub fn allocation(&self, connection_id: &str) -> Option<Allocation> {
        self.allocations.get(connection_id).map(|a| *a)
    }

    /// Number of connections holding addresses
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    fn is_ipv4(&self) -> bool {
        matches!(self.allocator.prefix(), IpNet::V4(_))
    }

    fn allocate_pair(&self, connection_id: &str) -> Result<Allocation, ChainError> {
        let dst = self
            .allocator
            .allocate()
            .map_err(|e| ChainError::allocation(&self.name, connection_id, e))?;
        let src = match self.allocator.allocate() {
            Ok(src) => src,
            Err(e) => {
                self.allocator.release(dst);
                return Err(ChainError::allocation(&self.name, connection_id, e));
            }
        };
        Ok(Allocation { src, dst })
    }

    /// Pair from this prefix carried by the connection
    fn carried_pair(&self, ip_context: &IpContext) -> Option<Allocation> {
        let prefix = self.allocator.prefix();
        let src = ip_context.src_addrs().find(|a| prefix.contains(a))?;
        let dst = ip_context.dst_addrs().find(|a| prefix.contains(a))?;
        Some(Allocation { src, dst })
    }

    fn claim_pair(&self, connection_id: &str, pair: Allocation) -> Result<Allocation, ChainError> {
        self.allocator
            .claim(pair.dst)
            .map_err(|e| ChainError::allocation(&self.name, connection_id, e))?;
        if let Err(e) = self.allocator.claim(pair.src) {
            self.allocator.release(pair.dst);
            return Err(ChainError::allocation(&self.name, connection_id, e));
        }
        Ok(pair)
    }
}

#[async_trait]
impl NetworkServiceElement for PointToPointIpam {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let id = request.connection.id.clone();
        if id.is_empty() {
            return Err(ChainError::InvalidRequest("connection id is empty".into()));
        }

        let ip_context = &mut request.connection.context.ip_context;
        let allocation = match self.allocations.entry(id.clone()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                if let Some(pair) = self.carried_pair(ip_context) {
                    let allocation = self.claim_pair(&id, pair)?;
                    info!(
                        element = %self.name,
                        connection_id = %id,
                        src = %allocation.src,
                        dst = %allocation.dst,
                        "addresses reclaimed"
                    );
                    *entry.insert(allocation)
                } else if ip_context.has_family(self.is_ipv4()) {
                    debug!(element = %self.name, connection_id = %id, "address family already assigned");
                    return Ok(());
                } else {
                    let allocation = self.allocate_pair(&id)?;
                    info!(
                        element = %self.name,
                        connection_id = %id,
                        src = %allocation.src,
                        dst = %allocation.dst,
                        "addresses allocated"
                    );
                    *entry.insert(allocation)
                }
            }
        };

        let (src, dst) = (allocation.src_net(), allocation.dst_net());
        if !ip_context.contains_pair(&src, &dst) {
            ip_context.assign_pair(src, dst);
        }
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some((_, allocation)) = self.allocations.remove(&conn.id) {
            self.allocator.release(allocation.src);
            self.allocator.release(allocation.dst);
            debug!(element = %self.name, connection_id = %conn.id, "addresses released");
        }
        Ok(())
    }
}
