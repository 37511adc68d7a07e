//! In-process transport
//!
//! Hands requests to a `NetworkService` living in the same process after a
//! JSON round trip, mirroring what a real RPC hop would carry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};

use super::Transport;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::ChainError;
use crate::service::NetworkService;

/// Transport to an in-process network service
pub struct LocalTransport {
    remote: Arc<dyn NetworkService>,
    disconnected: AtomicBool,
    calls: AtomicU64,
}

impl LocalTransport {
    /// Create a transport towards `remote`
    pub fn new(remote: Arc<dyn NetworkService>) -> Self {
        Self {
            remote,
            disconnected: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Make every further call fail with a transport error
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Undo [`LocalTransport::disconnect`]
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Number of calls carried so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn check_connected(&self) -> Result<(), ChainError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(ChainError::Transport("transport disconnected".into()));
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn wire<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, ChainError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ChainError::Transport(format!("encode: {e}")))?;
    trace!(len = bytes.len(), "descriptor on the wire");
    serde_json::from_slice(&bytes).map_err(|e| ChainError::Transport(format!("decode: {e}")))
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
        self.check_connected()?;
        let sent = wire(&request)?;
        let conn = self.remote.request(ctx, sent).await?;
        match wire(&conn) {
            Ok(conn) => Ok(conn),
            Err(e) => {
                // The answer cannot reach the caller, so the connection is withdrawn
                if let Err(close_err) = self.remote.close(ctx, conn).await {
                    warn!(error = %close_err, "withdrawing undeliverable connection failed");
                }
                Err(e)
            }
        }
    }

    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError> {
        self.check_connected()?;
        let sent = wire(&conn)?;
        self.remote.close(ctx, sent).await
    }
}
