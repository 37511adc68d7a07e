//! Request/close contract exposed across the protocol boundary
//!
//! - [`endpoint`]: server side, `[authorize, update_path, metadata, additional...]`
//! - [`initiator`]: client side, ending in the transport bridge
//!
//! Both wrap a composed [`Chain`](crate::chain::Chain) and implement
//! [`NetworkService`]. Calls for the same connection id are serialized.

pub mod endpoint;
pub mod initiator;
mod locks;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use initiator::{Initiator, InitiatorBuilder};

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Network service request/close contract
#[async_trait]
pub trait NetworkService: Send + Sync {
    /// Establish or refresh a connection
    ///
    /// # Errors
    ///
    /// Returns the first chain element failure.
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError>;

    /// Tear a connection down
    ///
    /// # Errors
    ///
    /// Returns `ChainError::CloseFailed` listing every element that failed.
    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError>;
}

#[async_trait]
impl<T: NetworkService + ?Sized> NetworkService for Arc<T> {
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
        (**self).request(ctx, request).await
    }

    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError> {
        (**self).close(ctx, conn).await
    }
}
