//! Per-connection metadata store
//!
//! Keeps one [`MetadataMap`] per connection id for the elements on one
//! side of the boundary. The map survives refreshes and failed closes.
//!
//! The element never drops a map by itself: the owning service calls
//! [`Metadata::forget`] once a close released everything, and
//! [`Metadata::discard_if_empty`] after a request that failed before any
//! element stored state.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::Side;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, MetadataMap, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Metadata element
pub struct Metadata {
    name: &'static str,
    maps: DashMap<String, MetadataMap>,
}

impl Metadata {
    /// Store for one side
    #[must_use]
    pub fn new(side: Side) -> Self {
        let name = match side {
            Side::Client => "metadata-client",
            Side::Server => "metadata-server",
        };
        Self {
            name,
            maps: DashMap::new(),
        }
    }

    /// Endpoint-side store
    #[must_use]
    pub fn server() -> Self {
        Self::new(Side::Server)
    }

    /// Client-side store
    #[must_use]
    pub fn client() -> Self {
        Self::new(Side::Client)
    }

    /// Number of connections with stored metadata
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Check if nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Stored map for a connection
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<MetadataMap> {
        self.maps.get(connection_id).map(|m| m.clone())
    }

    /// Drop the map of a released connection
    pub fn forget(&self, connection_id: &str) -> bool {
        self.maps.remove(connection_id).is_some()
    }

    /// Drop the map of a connection if nothing was stored in it
    pub fn discard_if_empty(&self, connection_id: &str) -> bool {
        self.maps
            .remove_if(connection_id, |_, map| map.is_empty())
            .is_some()
    }
}

#[async_trait]
impl NetworkServiceElement for Metadata {
    fn name(&self) -> &str {
        self.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        if request.connection.id.is_empty() {
            return Err(ChainError::InvalidRequest("connection id is empty".into()));
        }
        let map = self
            .maps
            .entry(request.connection.id.clone())
            .or_insert_with(|| request.connection.metadata.clone())
            .clone();
        trace!(element = self.name, connection_id = %request.connection.id, keys = map.len(), "metadata attached");
        request.connection.metadata = map;
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        if let Some(map) = self.get(&conn.id) {
            conn.metadata = map;
        }
        Ok(())
    }
}
