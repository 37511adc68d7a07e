//! Processing element trait
//!
//! Every element of a chain (authorization, address allocation, mechanism
//! dispatch, dataplane programming) implements `NetworkServiceElement`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Core trait for chain elements
///
/// # Contract
///
/// - `request` may inspect or mutate the request and program the
///   dataplane. Returning `Ok` forwards the request to the next element;
///   returning `Err` stops the traversal.
/// - `close` releases whatever `request` acquired for the connection id.
///   It must be a no-op when nothing is held, so closing twice, or closing
///   a connection whose request failed, is safe.
/// - Elements keep their own per-connection state and are responsible for
///   synchronizing it; the composer does not serialize calls for one id.
#[async_trait]
pub trait NetworkServiceElement: Send + Sync {
    /// Element name, used in logs and error context
    fn name(&self) -> &str;

    /// Process a request travelling forward through the chain
    ///
    /// # Errors
    ///
    /// Returns `ChainError` when the request must not be forwarded.
    async fn request(&self, ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError>;

    /// Release resources held for a connection
    ///
    /// # Errors
    ///
    /// Returns `ChainError` if a release failed. The composer keeps
    /// closing the remaining elements regardless.
    async fn close(&self, ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError>;
}

/// Shared handle to an element
pub type Element = Arc<dyn NetworkServiceElement>;

/// Element that forwards everything untouched
///
/// Useful as a placeholder in tests and as the handler of mechanisms that
/// need no dataplane programming.
#[derive(Debug, Clone)]
pub struct PassThrough {
    name: String,
}

impl PassThrough {
    /// Create a pass-through element
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NetworkServiceElement for PassThrough {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, _ctx: &RequestContext, _request: &mut Request) -> Result<(), ChainError> {
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}
