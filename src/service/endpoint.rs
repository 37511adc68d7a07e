//! Connection endpoint
//!
//! Server-side network service. The chain always starts with the
//! authorization gate, this hop's path element and the server metadata
//! store, followed by whatever the caller adds through
//! [`EndpointBuilder::with_additional_functionality`].
//!
//! # Lifecycle
//!
//! A connection is recorded after its first successful request, updated in
//! place on refresh and dropped once a close traverses the whole chain
//! without error. A failed close keeps the record and the connection
//! metadata so the caller can retry.
//!
//! # Admission
//!
//! Failures up to and including the gate are returned as
//! `ChainError::NotAdmitted`. Anything later may have left state behind
//! and is returned unchanged. A failed first request that stored nothing
//! in the metadata leaves no trace on the endpoint.
//!
//! Requests and closes for the same connection id are serialized.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::locks::{ConnectionGuard, ConnectionLocks};
use super::NetworkService;
use crate::chain::{Chain, Element, StoppedAt};
use crate::connection::{Connection, Request, State};
use crate::context::RequestContext;
use crate::elements::{Authorize, Metadata, UpdatePath};
use crate::error::ChainError;
use crate::token::SharedTokenGenerator;

/// Chain position of the authorization gate
const GATE: usize = 0;

/// Server-side network service
pub struct Endpoint {
    name: String,
    chain: Chain,
    metadata: Arc<Metadata>,
    connections: DashMap<String, Connection>,
    locks: ConnectionLocks,
}

impl Endpoint {
    /// Start building an endpoint
    pub fn builder(name: impl Into<String>, token_generator: SharedTokenGenerator) -> EndpointBuilder {
        EndpointBuilder {
            name: name.into(),
            token_generator,
            authorize: None,
            additional: Vec::new(),
        }
    }

    /// Endpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composed chain
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Recorded connection
    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Number of recorded connections
    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections holding endpoint-side metadata
    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    async fn lock(&self, ctx: &RequestContext, id: &str) -> Result<ConnectionGuard<'_>, ChainError> {
        ctx.run(self.locks.lock(id))
            .await
            .map_err(|_| ChainError::cancelled(self.name.clone(), id))
    }

    fn request_failed(&self, id: &str, stopped: StoppedAt) -> ChainError {
        if stopped.position <= GATE {
            let err = ChainError::not_admitted(id, stopped.error);
            warn!(endpoint = %self.name, connection_id = %id, error = %err, "connection not admitted");
            return err;
        }

        if !self.connections.contains_key(id) && self.metadata.discard_if_empty(id) {
            debug!(endpoint = %self.name, connection_id = %id, "nothing stored, metadata discarded");
        }
        warn!(
            endpoint = %self.name,
            connection_id = %id,
            position = stopped.position,
            error = %stopped.error,
            "request failed after admission"
        );
        stopped.error
    }
}

#[async_trait]
impl NetworkService for Endpoint {
    async fn request(&self, ctx: &RequestContext, mut request: Request) -> Result<Connection, ChainError> {
        let id = request.connection.id.clone();
        if id.is_empty() {
            let err = ChainError::not_admitted(id, ChainError::InvalidRequest("connection id is empty".into()));
            warn!(endpoint = %self.name, error = %err, "connection not admitted");
            return Err(err);
        }

        let _guard = self
            .lock(ctx, &id)
            .await
            .map_err(|e| ChainError::not_admitted(id.clone(), e))?;

        let incoming_index = request.connection.path.index;
        if let Err(stopped) = self.chain.traverse(ctx, &mut request).await {
            return Err(self.request_failed(&id, stopped));
        }
        let mut conn = request.connection;

        // The path index goes back as received so the client finds its own hop
        conn.path.index = incoming_index;
        conn.state = State::Up;

        let refreshed = self.connections.insert(id.clone(), conn.clone()).is_some();
        if refreshed {
            debug!(endpoint = %self.name, connection_id = %id, "connection refreshed");
        } else {
            info!(
                endpoint = %self.name,
                connection_id = %id,
                mechanism = conn.mechanism_type().unwrap_or("-"),
                "connection established"
            );
        }
        Ok(conn)
    }

    async fn close(&self, ctx: &RequestContext, mut conn: Connection) -> Result<(), ChainError> {
        let id = conn.id.clone();
        let _guard = self.lock(ctx, &id).await?;

        conn.state = State::Down;
        match self.chain.process_close(ctx, conn).await {
            Ok(()) => {
                self.metadata.forget(&id);
                if self.connections.remove(&id).is_some() {
                    info!(endpoint = %self.name, connection_id = %id, "connection closed");
                }
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.name, connection_id = %id, error = %e, "close incomplete, record kept");
                Err(e)
            }
        }
    }
}

/// Builder for [`Endpoint`]
pub struct EndpointBuilder {
    name: String,
    token_generator: SharedTokenGenerator,
    authorize: Option<Element>,
    additional: Vec<Element>,
}

impl EndpointBuilder {
    /// Replace the default authorization gate
    #[must_use]
    pub fn with_authorize(mut self, authorize: Element) -> Self {
        self.authorize = Some(authorize);
        self
    }

    /// Append elements after the metadata store, in order
    #[must_use]
    pub fn with_additional_functionality(mut self, elements: impl IntoIterator<Item = Element>) -> Self {
        self.additional.extend(elements);
        self
    }

    /// Build the endpoint
    pub fn build(self) -> Endpoint {
        let authorize = self
            .authorize
            .unwrap_or_else(|| Arc::new(Authorize::new()) as Element);
        let metadata = Arc::new(Metadata::server());
        let mut elements: Vec<Element> = vec![
            authorize,
            Arc::new(UpdatePath::new(self.name.clone(), self.token_generator)),
            metadata.clone() as Element,
        ];
        elements.extend(self.additional);

        Endpoint {
            chain: Chain::new(self.name.clone(), elements),
            name: self.name,
            metadata,
            connections: DashMap::new(),
            locks: ConnectionLocks::default(),
        }
    }
}
