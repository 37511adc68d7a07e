//! Chain composer
//!
//! `Chain` turns an ordered list of elements into a single element.
//!
//! # Ordering
//!
//! Both `request` and `close` visit elements in the order given at
//! construction. The composer never reorders, skips or parallelizes.
//!
//! # Failure Handling
//!
//! - **Request**: the first failure stops the traversal and is returned
//!   unchanged. State already programmed by upstream elements is left in
//!   place; rolling it back is up to the caller (usually by closing).
//! - **Close**: best effort. Every element is closed even if an earlier
//!   one failed; failures are collected into `ChainError::CloseFailed`.
//! - **Cancellation**: once the context is done, no further element is
//!   invoked for that call, for request and close alike.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::element::{Element, NetworkServiceElement};
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::{ChainError, ElementFailure};

/// Where a request traversal stopped
#[derive(Debug)]
pub struct StoppedAt {
    /// Position of the element that failed, or that was not started
    /// because the context finished
    pub position: usize,
    /// Whether the element at `position` was invoked
    pub started: bool,
    /// The failure
    pub error: ChainError,
}

/// Ordered composite of chain elements
#[derive(Clone)]
pub struct Chain {
    name: String,
    elements: Vec<Element>,
}

impl Chain {
    /// Compose `elements` in the given order
    pub fn new(name: impl Into<String>, elements: Vec<Element>) -> Self {
        Self {
            name: name.into(),
            elements,
        }
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Check if the chain has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element names in traversal order
    pub fn element_names(&self) -> impl Iterator<Item = &str> {
        self.elements.iter().map(|e| e.name())
    }

    /// Traverse the chain with `request` and return the resulting connection
    ///
    /// # Errors
    ///
    /// Returns the first element failure, or `Cancelled` if the context
    /// finished before the traversal did.
    pub async fn process_request(
        &self,
        ctx: &RequestContext,
        mut request: Request,
    ) -> Result<Connection, ChainError> {
        self.request(ctx, &mut request).await?;
        Ok(request.connection)
    }

    /// Run `request` through the elements, reporting where it stopped
    ///
    /// Services use the position to tell failures before their admission
    /// point from failures after it.
    ///
    /// # Errors
    ///
    /// Returns the first failure together with the failing position.
    pub async fn traverse(&self, ctx: &RequestContext, request: &mut Request) -> Result<(), StoppedAt> {
        for (position, element) in self.elements.iter().enumerate() {
            if ctx.is_done() {
                return Err(StoppedAt {
                    position,
                    started: false,
                    error: ChainError::cancelled(element.name(), request.id()),
                });
            }

            debug!(
                chain = %self.name,
                element = element.name(),
                connection_id = %request.id(),
                "request"
            );

            let id = request.connection.id.clone();
            let error = match ctx.run(element.request(ctx, request)).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(_) => ChainError::cancelled(element.name(), id),
            };
            debug!(chain = %self.name, element = element.name(), position, error = %error, "request stopped");
            return Err(StoppedAt {
                position,
                started: true,
                error,
            });
        }
        Ok(())
    }

    /// Close `conn` through every element
    ///
    /// # Errors
    ///
    /// Returns `CloseFailed` listing every element that failed.
    pub async fn process_close(
        &self,
        ctx: &RequestContext,
        mut conn: Connection,
    ) -> Result<(), ChainError> {
        self.close(ctx, &mut conn).await
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("elements", &self.element_names().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl NetworkServiceElement for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    async fn request(&self, ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        self.traverse(ctx, request).await.map_err(|stopped| stopped.error)
    }

    async fn close(&self, ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        let mut failures = Vec::new();

        for element in &self.elements {
            if ctx.is_done() {
                failures.push(ElementFailure {
                    element: element.name().to_string(),
                    error: ChainError::cancelled(element.name(), conn.id.clone()),
                });
                break;
            }

            debug!(
                chain = %self.name,
                element = element.name(),
                connection_id = %conn.id,
                "close"
            );

            let id = conn.id.clone();
            let result = match ctx.run(element.close(ctx, conn)).await {
                Ok(result) => result,
                Err(_) => Err(ChainError::cancelled(element.name(), id)),
            };

            match result {
                Ok(()) => {}
                Err(ChainError::CloseFailed { failures: nested, .. }) => failures.extend(nested),
                Err(error) => {
                    warn!(
                        chain = %self.name,
                        element = element.name(),
                        connection_id = %conn.id,
                        error = %error,
                        "close failed, continuing"
                    );
                    failures.push(ElementFailure {
                        element: element.name().to_string(),
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChainError::CloseFailed {
                connection_id: conn.id.clone(),
                failures,
            })
        }
    }
}
