//! Transport boundary between the initiator and the endpoint
//!
//! Only the connection descriptor crosses the boundary: requests and
//! responses are carried as serialized `Request` / `Connection` values, so
//! process-local state such as the metadata map stays on its own side.
//!
//! # Architecture
//!
//! ```text
//! Initiator chain
//!       |
//!       v
//!   Connect (element)
//!       |
//!       v
//!   Transport::request() ---- JSON ----> NetworkService (endpoint)
//! ```

mod connect;
mod local;

pub use connect::Connect;
pub use local::LocalTransport;

use async_trait::async_trait;

use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// RPC-style boundary carrying a connection descriptor both ways
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the endpoint's descriptor
    ///
    /// # Errors
    ///
    /// Returns `ChainError::Transport` if the call could not be carried,
    /// or the endpoint's error unchanged.
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError>;

    /// Send a close
    ///
    /// # Errors
    ///
    /// Same as [`Transport::request`].
    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError>;
}
