//! Address pool allocation
//!
//! This module defines the `AddressAllocator` collaborator interface and
//! `IpPool`, a prefix-backed implementation that hands out host addresses
//! unique among the addresses it currently has out.
//!
//! # Address Range
//!
//! - The network address is never handed out.
//! - For IPv4 prefixes shorter than /31 the broadcast address is skipped.
//! - Addresses are handed out lowest-first; released addresses are reused.

use std::collections::BTreeSet;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::Mutex;

use crate::error::AllocatorError;

/// Address allocator collaborator
///
/// Invoked once per connection per address family. Implementations must
/// never return an address that is still allocated.
pub trait AddressAllocator: Send + Sync {
    /// Prefix the allocator serves
    fn prefix(&self) -> IpNet;

    /// Allocate a free address
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::Exhausted` when no address is left.
    fn allocate(&self) -> Result<IpAddr, AllocatorError>;

    /// Allocate a specific address
    ///
    /// # Errors
    ///
    /// Returns `AllocatorError::OutOfPool` for addresses the allocator never
    /// hands out and `AllocatorError::InUse` if it is already allocated.
    fn claim(&self, addr: IpAddr) -> Result<(), AllocatorError>;

    /// Release an address, returning `true` if it was allocated
    fn release(&self, addr: IpAddr) -> bool;

    /// Check if an address is currently allocated
    fn is_allocated(&self, addr: IpAddr) -> bool;

    /// Number of allocated addresses
    fn allocated_count(&self) -> usize;
}

/// Prefix-backed address pool
#[derive(Debug)]
pub struct IpPool {
    /// The network range for membership testing
    network: IpNet,
    /// Currently allocated addresses
    allocated: Mutex<BTreeSet<IpAddr>>,
}

impl IpPool {
    /// Create a pool over `network`
    #[must_use]
    pub fn new(network: IpNet) -> Self {
        Self {
            network: network.trunc(),
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Check if an address is within this pool's range
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.network.contains(&addr)
    }

    /// Check if `addr` may ever be handed out
    fn usable(&self, addr: IpAddr) -> bool {
        if addr == self.network.network() {
            return false;
        }
        match self.network {
            IpNet::V4(net) if net.prefix_len() < 31 => addr != IpAddr::V4(net.broadcast()),
            _ => true,
        }
    }

    /// Get the network range
    #[must_use]
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// All allocated addresses, lowest first
    #[must_use]
    pub fn allocated_addrs(&self) -> Vec<IpAddr> {
        self.allocated.lock().iter().copied().collect()
    }
}

impl AddressAllocator for IpPool {
    fn prefix(&self) -> IpNet {
        self.network
    }

    fn allocate(&self) -> Result<IpAddr, AllocatorError> {
        let mut allocated = self.allocated.lock();

        let addr = self
            .network
            .hosts()
            .filter(|addr| self.usable(*addr))
            .find(|addr| !allocated.contains(addr))
            .ok_or_else(|| AllocatorError::Exhausted(self.network.to_string()))?;

        allocated.insert(addr);
        Ok(addr)
    }

    fn claim(&self, addr: IpAddr) -> Result<(), AllocatorError> {
        if !self.contains(addr) || !self.usable(addr) {
            return Err(AllocatorError::OutOfPool {
                addr,
                pool: self.network.to_string(),
            });
        }
        if !self.allocated.lock().insert(addr) {
            return Err(AllocatorError::InUse(addr));
        }
        Ok(())
    }

    fn release(&self, addr: IpAddr) -> bool {
        self.allocated.lock().remove(&addr)
    }

    fn is_allocated(&self, addr: IpAddr) -> bool {
        self.allocated.lock().contains(&addr)
    }

    fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_allocation_order() {
        let pool = IpPool::new("10.0.0.0/24".parse().unwrap());
        assert_eq!(pool.allocate().unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pool.allocate().unwrap(), "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn test_ipv4_exhaustion_skips_network_and_broadcast() {
        let pool = IpPool::new("10.0.0.0/30".parse().unwrap());
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(b, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert!(matches!(pool.allocate(), Err(AllocatorError::Exhausted(_))));
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = IpPool::new("10.0.0.0/30".parse().unwrap());
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.release(a));
        assert!(!pool.release(a));
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    fn test_ipv6_allocation() {
        let pool = IpPool::new("fc00::/64".parse().unwrap());
        assert_eq!(pool.allocate().unwrap(), "fc00::1".parse::<IpAddr>().unwrap());
        assert_eq!(pool.allocate().unwrap(), "fc00::2".parse::<IpAddr>().unwrap());
        assert!(pool.contains("fc00::ffff".parse().unwrap()));
        assert!(!pool.contains("fc01::1".parse().unwrap()));
    }

    #[test]
    fn test_prefix_is_truncated() {
        let pool = IpPool::new("10.0.0.77/24".parse().unwrap());
        assert_eq!(pool.prefix(), "10.0.0.0/24".parse::<IpNet>().unwrap());
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(IpPool::new("10.1.0.0/24".parse().unwrap()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || (0..16).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<IpAddr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        assert_eq!(pool.allocated_count(), 128);
    }

    #[test]
    fn test_claim_specific_address() {
        let pool = IpPool::new("10.0.0.0/24".parse().unwrap());
        let addr: IpAddr = "10.0.0.7".parse().unwrap();

        pool.claim(addr).unwrap();
        assert!(pool.is_allocated(addr));
        assert!(matches!(pool.claim(addr), Err(AllocatorError::InUse(a)) if a == addr));
        assert!(matches!(
            pool.claim("10.0.0.0".parse().unwrap()),
            Err(AllocatorError::OutOfPool { .. })
        ));
        assert!(matches!(
            pool.claim("10.1.0.1".parse().unwrap()),
            Err(AllocatorError::OutOfPool { .. })
        ));

        // Claimed addresses are skipped by allocate
        assert_eq!(pool.allocate().unwrap(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(pool.allocated_count(), 2);
    }
}
