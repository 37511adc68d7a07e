//! Interface addressing and routing
//!
//! Puts this side's addresses from the IP context on the tunnel interface
//! and routes the peer's addresses into it. Runs after the mechanism
//! element, which leaves the interface index in the connection metadata.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, info};

use super::Side;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::dataplane::{Dataplane, InterfaceIndex};
use crate::error::{ChainError, DataplaneError};

/// Connection context element
pub struct ConnectionContextElement {
    name: &'static str,
    side: Side,
    dataplane: Arc<dyn Dataplane>,
}

impl ConnectionContextElement {
    /// Element for one side of the tunnel
    pub fn new(dataplane: Arc<dyn Dataplane>, side: Side) -> Self {
        let name = match side {
            Side::Client => "connection_context-client",
            Side::Server => "connection_context-server",
        };
        Self {
            name,
            side,
            dataplane,
        }
    }
}

#[async_trait]
impl NetworkServiceElement for ConnectionContextElement {
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
        let dataplane_err = |e: DataplaneError| ChainError::dataplane(self.name, conn.id.clone(), e);

        let ip_context = conn.ip_context();
        for addr in self.side.local_addrs(ip_context) {
            self.dataplane
                .add_interface_address(if_index, *addr)
                .await
                .map_err(dataplane_err)?;
        }

        let mut routes = conn
            .metadata
            .get::<Vec<IpNet>>(self.side.routes_key())
            .unwrap_or_default();
        // Routes added before a failure are recorded too, so close removes them
        let mut added = Ok(());
        for prefix in self.side.remote_addrs(ip_context) {
            if let Err(e) = self.dataplane.add_route(if_index, *prefix).await {
                added = Err(dataplane_err(e));
                break;
            }
            if !routes.contains(prefix) {
                routes.push(*prefix);
            }
        }
        conn.metadata.insert(self.side.routes_key(), &routes)?;
        added?;

        info!(
            element = self.name,
            connection_id = %conn.id,
            if_index,
            routes = routes.len(),
            "connection context programmed"
        );
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        let Some(routes) = conn.metadata.get::<Vec<IpNet>>(self.side.routes_key()) else {
            return Ok(());
        };

        // Routes die with the interface
        if let Some(if_index) = conn.metadata.get::<InterfaceIndex>(self.side.if_index_key()) {
            for prefix in &routes {
                match self.dataplane.del_route(if_index, *prefix).await {
                    Ok(()) | Err(DataplaneError::InterfaceNotFound(_)) => {}
                    Err(e) => return Err(ChainError::dataplane(self.name, conn.id.clone(), e)),
                }
            }
        }

        conn.metadata.remove::<Vec<IpNet>>(self.side.routes_key());
        debug!(element = self.name, connection_id = %conn.id, routes = routes.len(), "routes released");
        Ok(())
    }
}
