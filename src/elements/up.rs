//! Interface admin state

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::Side;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::dataplane::{Dataplane, InterfaceIndex};
use crate::error::ChainError;

/// Brings the tunnel interface up
///
/// Close does nothing: the interface goes away with the mechanism close.
pub struct Up {
    name: &'static str,
    side: Side,
    dataplane: Arc<dyn Dataplane>,
}

impl Up {
    /// Element for one side of the tunnel
    pub fn new(dataplane: Arc<dyn Dataplane>, side: Side) -> Self {
        let name = match side {
            Side::Client => "up-client",
            Side::Server => "up-server",
        };
        Self {
            name,
            side,
            dataplane,
        }
    }

    /// Endpoint-side element
    pub fn server(dataplane: Arc<dyn Dataplane>) -> Self {
        Self::new(dataplane, Side::Server)
    }

    /// Client-side element
    pub fn client(dataplane: Arc<dyn Dataplane>) -> Self {
        Self::new(dataplane, Side::Client)
    }
}

#[async_trait]
impl NetworkServiceElement for Up {
    fn name(&self) -> &str {
        self.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let conn = &request.connection;
        let Some(if_index) = conn.metadata.get::<InterfaceIndex>(self.side.if_index_key()) else {
            return Err(ChainError::InvalidRequest(format!(
                "{}: no tunnel interface for connection {}",
                self.name, conn.id
            )));
        };

        self.dataplane
            .set_interface_admin_up(if_index, true)
            .await
            .map_err(|e| ChainError::dataplane(self.name, conn.id.clone(), e))?;
        debug!(element = self.name, connection_id = %conn.id, if_index, "interface up");
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}
