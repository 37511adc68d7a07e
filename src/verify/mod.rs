//! Verifiable endpoint and client
//!
//! Test-facing decorators around [`Endpoint`](crate::service::Endpoint) and
//! [`Initiator`](crate::service::Initiator). They keep the request/close
//! contract unchanged and add [`Verifiable`] on a distinct type, so the
//! production services never carry verification code.
//!
//! # Direction
//!
//! | Wrapper | Probes | From |
//! |---------|--------|------|
//! | endpoint | source addresses | endpoint dataplane |
//! | client | destination addresses | client dataplane |

mod client;
mod endpoint;
mod probe;

pub use client::IpsecVerifiableClient;
pub use endpoint::IpsecVerifiableEndpoint;
pub use probe::{expect_unreachable, probe, probe_each};

use async_trait::async_trait;

use crate::connection::Connection;
use crate::context::RequestContext;
use crate::error::VerifyError;

/// Liveness assertions over an established connection
#[async_trait]
pub trait Verifiable: Send + Sync {
    /// Check that every address this side should reach answers
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing probe.
    async fn verify_connection(&self, ctx: &RequestContext, conn: &Connection) -> Result<(), VerifyError>;

    /// Check the state left after close
    ///
    /// The default accepts anything.
    ///
    /// # Errors
    ///
    /// Returns the first violated post-close condition.
    async fn verify_close(&self, _ctx: &RequestContext, _conn: &Connection) -> Result<(), VerifyError> {
        Ok(())
    }
}
