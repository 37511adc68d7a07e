//! Authorization gate
//!
//! First element of the endpoint chain. It accepts or rejects a request
//! before any dataplane resource is committed, so an `Unauthorized` error
//! always means "never admitted".

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Path, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Policy evaluated by the gate
pub trait AuthorizationPolicy: Send + Sync {
    /// Policy name, reported in rejections
    fn name(&self) -> &str;

    /// Check a path
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    fn check(&self, path: &Path, now: SystemTime) -> Result<(), String>;
}

/// Every segment up to the current one carries a non-empty, unexpired token
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidTokens;

impl AuthorizationPolicy for ValidTokens {
    fn name(&self) -> &str {
        "valid_tokens"
    }

    fn check(&self, path: &Path, now: SystemTime) -> Result<(), String> {
        if path.segments.is_empty() {
            return Err("path has no segments".into());
        }
        let last = path.index.min(path.segments.len() - 1);
        for segment in &path.segments[..=last] {
            if segment.token.is_empty() {
                return Err(format!("segment {} has no token", segment.name));
            }
            if segment.expires <= now {
                return Err(format!("token of segment {} expired", segment.name));
            }
        }
        Ok(())
    }
}

/// Authorization gate element
pub struct Authorize {
    policies: Vec<Arc<dyn AuthorizationPolicy>>,
}

impl Authorize {
    /// Gate with the default policy set
    #[must_use]
    pub fn new() -> Self {
        Self::with_policies(vec![Arc::new(ValidTokens)])
    }

    /// Gate with custom policies, all of which must pass
    #[must_use]
    pub fn with_policies(policies: Vec<Arc<dyn AuthorizationPolicy>>) -> Self {
        Self { policies }
    }
}

impl Default for Authorize {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkServiceElement for Authorize {
    fn name(&self) -> &str {
        "authorize"
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let now = SystemTime::now();
        for policy in &self.policies {
            if let Err(reason) = policy.check(&request.connection.path, now) {
                warn!(
                    connection_id = %request.connection.id,
                    policy = policy.name(),
                    %reason,
                    "request rejected"
                );
                return Err(ChainError::unauthorized(format!("{}: {reason}", policy.name())));
            }
        }
        debug!(connection_id = %request.connection.id, "request authorized");
        Ok(())
    }

    // Close is never gated: resources must be released even for stale tokens.
    async fn close(&self, _ctx: &RequestContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}
