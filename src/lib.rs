//! ipsec-chain: connection chain and verification harness for IPsec
//! point-to-point network services
//!
//! A client and an endpoint each run an ordered chain of processing
//! elements. The client's request crosses a transport boundary, the
//! endpoint chain authorizes it, selects the `IPSEC` mechanism, assigns
//! addresses and programs its dataplane; the client chain then programs
//! its own side from the returned descriptor. Verifiable wrappers probe
//! the negotiated addresses to prove the path works, and that it is gone
//! after close.
//!
//! # Architecture
//!
//! ```text
//! Initiator chain                          Endpoint chain
//! metadata → update_path → preferences     authorize → update_path → metadata
//!        → connect ──── Transport ────────→ → mechanisms(IPSEC) → ipam × 2
//!        ← ─────────── Connection ──────── ← → connection_context → up → pinhole
//! → ipsec → connection_context → up → pinhole
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use ipsec_chain::context::RequestContext;
//! use ipsec_chain::dataplane::{MemoryDataplane, Underlay};
//! use ipsec_chain::service::NetworkService;
//! use ipsec_chain::token::random_generator;
//! use ipsec_chain::transport::LocalTransport;
//! use ipsec_chain::verify::{IpsecVerifiableClient, IpsecVerifiableEndpoint, Verifiable};
//! use ipsec_chain::connection::{Connection, Request};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tokens = random_generator(Duration::from_secs(600));
//! let (server_ip, client_ip) = ("172.16.0.1".parse()?, "172.16.0.2".parse()?);
//! let underlay = Underlay::new();
//! let endpoint = Arc::new(IpsecVerifiableEndpoint::new(
//!     "10.0.0.0/24".parse()?,
//!     "fc00::/7".parse()?,
//!     tokens.clone(),
//!     Arc::new(MemoryDataplane::on_underlay("server", &underlay, server_ip)),
//!     server_ip,
//! ));
//! let client = IpsecVerifiableClient::new(
//!     Arc::new(LocalTransport::new(endpoint.clone())),
//!     tokens,
//!     Arc::new(MemoryDataplane::on_underlay("client", &underlay, client_ip)),
//!     client_ip,
//! )?;
//!
//! let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));
//! let conn = client.request(&ctx, Request::new(Connection::new("", "ipsec"))).await?;
//! endpoint.verify_connection(&ctx, &conn).await?;
//! client.verify_connection(&ctx, &conn).await?;
//! client.close(&ctx, conn).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`chain`]: element trait and the ordered composer
//! - [`connection`]: connection and request descriptors
//! - [`context`]: cancellation and deadline scope
//! - [`dataplane`]: dataplane control client interface and in-memory implementation
//! - [`elements`]: authorization, path, metadata and dataplane elements
//! - [`ipam`]: address allocation
//! - [`mechanisms`]: mechanism selection and IPsec
//! - [`service`]: endpoint and initiator
//! - [`transport`]: transport boundary
//! - [`verify`]: reachability probe and verifiable wrappers
//! - [`config`], [`logging`], [`error`], [`token`]

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod chain;
pub mod config;
pub mod connection;
pub mod context;
pub mod dataplane;
pub mod elements;
pub mod error;
pub mod ipam;
pub mod logging;
pub mod mechanisms;
pub mod service;
pub mod token;
pub mod transport;
pub mod verify;

// Re-export commonly used types at the crate root
pub use chain::{Chain, Element, NetworkServiceElement};
pub use config::{load_config, SuiteConfig};
pub use connection::{Connection, Mechanism, Request};
pub use context::RequestContext;
pub use dataplane::{Dataplane, MemoryDataplane};
pub use error::{AllocatorError, ChainError, ConfigError, DataplaneError, VerifyError};
pub use service::{Endpoint, Initiator, NetworkService};
pub use verify::{probe, IpsecVerifiableClient, IpsecVerifiableEndpoint, Verifiable};
