//! In-memory dataplane
//!
//! `MemoryDataplane` keeps interfaces, routes and pinholes in a table and
//! answers echo requests from that table. It records every mutating call
//! and supports failure injection, which is what the chain tests assert
//! against.
//!
//! # Reachability Model
//!
//! An echo to `addr` is answered when an admin-up interface owns `addr`.
//! Routed traffic needs an admin-up interface routing `addr` and a UDP
//! pinhole on [`NAT_T_PORT`] open for the tunnel's remote underlay address.
//!
//! Dataplanes joined to an [`Underlay`] also need the far end: the
//! dataplane registered at the tunnel's remote underlay address must have
//! an admin-up interface owning `addr` whose tunnel mirrors the local one,
//! and its own pinhole open for the local underlay address. A standalone
//! dataplane has no peers to ask and answers routed echoes from its own
//! tables.
//!
//! Otherwise the echo fails with `NoRoute`. In blackhole mode the echo is
//! sent but never answered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::trace;

use super::traits::{Dataplane, InterfaceIndex, IpsecTunnel, Pinhole, NAT_T_PORT};
use crate::error::DataplaneError;

/// Dataplane operation kinds, used for call logs and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTunnel,
    DeleteInterface,
    AddAddress,
    SetAdminState,
    AddRoute,
    DelRoute,
    AddPinhole,
    DelPinhole,
    Echo,
}

impl Operation {
    /// Check if the operation changes dataplane state
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        !matches!(self, Self::Echo)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CreateTunnel => "create_ipsec_tunnel",
            Self::DeleteInterface => "delete_interface",
            Self::AddAddress => "add_interface_address",
            Self::SetAdminState => "set_interface_admin_up",
            Self::AddRoute => "add_route",
            Self::DelRoute => "del_route",
            Self::AddPinhole => "add_pinhole",
            Self::DelPinhole => "del_pinhole",
            Self::Echo => "echo",
        };
        f.write_str(name)
    }
}

/// A recorded dataplane call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataplaneCall {
    pub operation: Operation,
    pub detail: String,
}

/// State of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub tunnel: IpsecTunnel,
    pub admin_up: bool,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
}

#[derive(Debug, Default)]
struct Tables {
    next_if_index: InterfaceIndex,
    interfaces: BTreeMap<InterfaceIndex, Interface>,
    pinholes: HashSet<Pinhole>,
    calls: Vec<DataplaneCall>,
}

/// Underlay network joining in-memory dataplanes by address
///
/// Clones share the same network. Entries are weak: a dropped dataplane
/// stops answering.
#[derive(Debug, Clone, Default)]
pub struct Underlay {
    hosts: Arc<DashMap<IpAddr, Weak<Mutex<Tables>>>>,
}

impl Underlay {
    /// Create an empty underlay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dataplanes still attached
    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.iter().filter(|h| h.strong_count() > 0).count()
    }

    /// Check if no dataplane is attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn host(&self, addr: IpAddr) -> Option<Arc<Mutex<Tables>>> {
        self.hosts.get(&addr).and_then(|h| h.upgrade())
    }

    /// Check if the far end of `tunnel` delivers an echo to `addr` and answers
    fn answers(&self, tunnel: &IpsecTunnel, addr: IpAddr) -> bool {
        let Some(peer) = self.host(tunnel.remote_ip) else {
            return false;
        };
        let peer = peer.lock();
        peer.pinholes.contains(&Pinhole::udp(tunnel.local_ip, NAT_T_PORT))
            && peer.interfaces.values().any(|iface| {
                iface.admin_up
                    && iface.tunnel.mirrors(tunnel)
                    && iface.addresses.iter().any(|net| net.addr() == addr)
            })
    }
}

/// In-memory dataplane for tests and in-process suites
#[derive(Debug)]
pub struct MemoryDataplane {
    name: String,
    tables: Arc<Mutex<Tables>>,
    underlay: Option<Underlay>,
    failures: Mutex<HashMap<Operation, String>>,
    blackhole: AtomicBool,
    rtt_us: AtomicU64,
}

impl MemoryDataplane {
    /// Create an empty standalone dataplane
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create an empty dataplane reachable at `addr` on `underlay`
    ///
    /// A dataplane attached later at the same address replaces this one.
    pub fn on_underlay(name: impl Into<String>, underlay: &Underlay, addr: IpAddr) -> Self {
        let dataplane = Self::build(name.into(), Some(underlay.clone()));
        underlay.hosts.insert(addr, Arc::downgrade(&dataplane.tables));
        dataplane
    }

    fn build(name: String, underlay: Option<Underlay>) -> Self {
        Self {
            name,
            tables: Arc::new(Mutex::new(Tables {
                next_if_index: 1,
                ..Tables::default()
            })),
            underlay,
            failures: Mutex::new(HashMap::new()),
            blackhole: AtomicBool::new(false),
            rtt_us: AtomicU64::new(0),
        }
    }

    /// Dataplane name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every future call of `operation` fail with `reason`
    pub fn fail(&self, operation: Operation, reason: &str) {
        self.failures.lock().insert(operation, reason.to_string());
    }

    /// Stop failing `operation`
    pub fn heal(&self, operation: Operation) {
        self.failures.lock().remove(&operation);
    }

    /// Swallow echo requests without answering
    pub fn set_blackhole(&self, enabled: bool) {
        self.blackhole.store(enabled, Ordering::SeqCst);
    }

    /// Artificial round-trip time for answered echoes
    pub fn set_rtt(&self, rtt: Duration) {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
        self.rtt_us.store(micros, Ordering::SeqCst);
    }

    /// All recorded calls, in order
    #[must_use]
    pub fn calls(&self) -> Vec<DataplaneCall> {
        self.tables.lock().calls.clone()
    }

    /// Recorded calls that changed state
    #[must_use]
    pub fn mutations(&self) -> Vec<DataplaneCall> {
        self.tables
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation.is_mutating())
            .cloned()
            .collect()
    }

    /// Number of recorded calls of one kind
    #[must_use]
    pub fn call_count(&self, operation: Operation) -> usize {
        self.tables
            .lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Snapshot of one interface
    #[must_use]
    pub fn interface(&self, if_index: InterfaceIndex) -> Option<Interface> {
        self.tables.lock().interfaces.get(&if_index).cloned()
    }

    /// Number of live interfaces
    #[must_use]
    pub fn interface_count(&self) -> usize {
        self.tables.lock().interfaces.len()
    }

    /// Check if a pinhole is open
    #[must_use]
    pub fn has_pinhole(&self, pinhole: &Pinhole) -> bool {
        self.tables.lock().pinholes.contains(pinhole)
    }

    /// Number of open pinholes
    #[must_use]
    pub fn pinhole_count(&self) -> usize {
        self.tables.lock().pinholes.len()
    }

    /// Record a call and check injected failures
    fn enter(&self, operation: Operation, detail: String) -> Result<(), DataplaneError> {
        trace!(dataplane = %self.name, %operation, %detail, "dataplane call");
        self.tables.lock().calls.push(DataplaneCall { operation, detail });
        match self.failures.lock().get(&operation) {
            Some(reason) => Err(DataplaneError::rejected(operation.to_string(), reason.clone())),
            None => Ok(()),
        }
    }

    fn reachable(&self, addr: IpAddr) -> bool {
        // The far end is consulted without holding the local tables
        let routed: Vec<IpsecTunnel> = {
            let tables = self.tables.lock();
            let mut routed = Vec::new();
            for iface in tables.interfaces.values().filter(|i| i.admin_up) {
                if iface.addresses.iter().any(|net| net.addr() == addr) {
                    return true;
                }
                if iface.routes.iter().any(|net| net.contains(&addr))
                    && tables
                        .pinholes
                        .contains(&Pinhole::udp(iface.tunnel.remote_ip, NAT_T_PORT))
                {
                    routed.push(iface.tunnel.clone());
                }
            }
            routed
        };

        match &self.underlay {
            Some(underlay) => routed.iter().any(|tunnel| underlay.answers(tunnel, addr)),
            None => !routed.is_empty(),
        }
    }
}

#[async_trait]
impl Dataplane for MemoryDataplane {
    async fn create_ipsec_tunnel(&self, tunnel: &IpsecTunnel) -> Result<InterfaceIndex, DataplaneError> {
        self.enter(
            Operation::CreateTunnel,
            format!("{} -> {}", tunnel.local_ip, tunnel.remote_ip),
        )?;

        let mut tables = self.tables.lock();
        let if_index = tables.next_if_index;
        tables.next_if_index += 1;
        tables.interfaces.insert(
            if_index,
            Interface {
                tunnel: tunnel.clone(),
                admin_up: false,
                addresses: Vec::new(),
                routes: Vec::new(),
            },
        );
        Ok(if_index)
    }

    async fn delete_interface(&self, if_index: InterfaceIndex) -> Result<(), DataplaneError> {
        self.enter(Operation::DeleteInterface, if_index.to_string())?;
        self.tables
            .lock()
            .interfaces
            .remove(&if_index)
            .map(|_| ())
            .ok_or(DataplaneError::InterfaceNotFound(if_index))
    }

    async fn add_interface_address(&self, if_index: InterfaceIndex, addr: IpNet) -> Result<(), DataplaneError> {
        self.enter(Operation::AddAddress, format!("{if_index} {addr}"))?;
        let mut tables = self.tables.lock();
        let iface = tables
            .interfaces
            .get_mut(&if_index)
            .ok_or(DataplaneError::InterfaceNotFound(if_index))?;
        if !iface.addresses.contains(&addr) {
            iface.addresses.push(addr);
        }
        Ok(())
    }

    async fn set_interface_admin_up(&self, if_index: InterfaceIndex, up: bool) -> Result<(), DataplaneError> {
        self.enter(Operation::SetAdminState, format!("{if_index} up={up}"))?;
        let mut tables = self.tables.lock();
        let iface = tables
            .interfaces
            .get_mut(&if_index)
            .ok_or(DataplaneError::InterfaceNotFound(if_index))?;
        iface.admin_up = up;
        Ok(())
    }

    async fn add_route(&self, if_index: InterfaceIndex, prefix: IpNet) -> Result<(), DataplaneError> {
        self.enter(Operation::AddRoute, format!("{if_index} {prefix}"))?;
        let mut tables = self.tables.lock();
        let iface = tables
            .interfaces
            .get_mut(&if_index)
            .ok_or(DataplaneError::InterfaceNotFound(if_index))?;
        if !iface.routes.contains(&prefix) {
            iface.routes.push(prefix);
        }
        Ok(())
    }

    async fn del_route(&self, if_index: InterfaceIndex, prefix: IpNet) -> Result<(), DataplaneError> {
        self.enter(Operation::DelRoute, format!("{if_index} {prefix}"))?;
        let mut tables = self.tables.lock();
        let iface = tables
            .interfaces
            .get_mut(&if_index)
            .ok_or(DataplaneError::InterfaceNotFound(if_index))?;
        iface.routes.retain(|r| *r != prefix);
        Ok(())
    }

    async fn add_pinhole(&self, pinhole: Pinhole) -> Result<(), DataplaneError> {
        self.enter(Operation::AddPinhole, pinhole.to_string())?;
        self.tables.lock().pinholes.insert(pinhole);
        Ok(())
    }

    async fn del_pinhole(&self, pinhole: Pinhole) -> Result<(), DataplaneError> {
        self.enter(Operation::DelPinhole, pinhole.to_string())?;
        self.tables.lock().pinholes.remove(&pinhole);
        Ok(())
    }

    async fn echo(&self, addr: IpAddr) -> Result<Duration, DataplaneError> {
        self.enter(Operation::Echo, addr.to_string())?;

        if !self.reachable(addr) {
            return Err(DataplaneError::NoRoute(addr));
        }

        if self.blackhole.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let rtt = Duration::from_micros(self.rtt_us.load(Ordering::SeqCst));
        if !rtt.is_zero() {
            tokio::time::sleep(rtt).await;
        }
        Ok(rtt)
    }
}
