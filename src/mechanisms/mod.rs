//! Mechanism negotiation
//!
//! - [`selector`]: registration map and per-connection dispatch
//! - [`ipsec`]: IPsec tunnel elements for both sides

pub mod ipsec;
pub mod selector;

pub use ipsec::{client_preference, IpsecClient, IpsecServer};
pub use selector::{MechanismSelector, MechanismSelectorBuilder};
