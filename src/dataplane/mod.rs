//! Dataplane collaborator
//!
//! - [`traits`]: the `Dataplane` control client interface
//! - [`memory`]: an in-memory implementation with call log and failure
//!   injection, optionally joined to peers through an [`Underlay`]

pub mod memory;
pub mod traits;

pub use memory::{DataplaneCall, Interface, MemoryDataplane, Operation, Underlay};
pub use traits::{
    Dataplane, InterfaceIndex, IpsecTunnel, Pinhole, PinholeProtocol, IKE_PORT, NAT_T_PORT,
};
