//! Connection initiator
//!
//! Client-side network service. The chain is
//! `[metadata, update_path, preferences, connect, additional...]`: the
//! elements added through [`InitiatorBuilder::with_additional_functionality`]
//! run after the endpoint answered, on the descriptor it returned.
//!
//! Failures before the transport bridge was invoked are returned as
//! `ChainError::NotAdmitted`: the endpoint never saw the request. Client
//! metadata follows the endpoint's rules, kept across failed closes and
//! dropped after a failed first request that stored nothing.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::locks::{ConnectionGuard, ConnectionLocks};
use super::NetworkService;
use crate::chain::{Chain, Element, NetworkServiceElement, StoppedAt};
use crate::connection::{Connection, Mechanism, Request, State};
use crate::context::RequestContext;
use crate::elements::{Metadata, UpdatePath};
use crate::error::{ChainError, ConfigError};
use crate::token::SharedTokenGenerator;
use crate::transport::{Connect, Transport};

/// Chain position of the transport bridge
const CONNECT: usize = 3;

/// Source of the mechanism preferences offered on first request
pub type PreferenceSource = Arc<dyn Fn() -> Vec<Mechanism> + Send + Sync>;

/// Offers mechanism preferences on requests that carry none
struct OfferPreferences {
    source: PreferenceSource,
}

#[async_trait]
impl NetworkServiceElement for OfferPreferences {
    fn name(&self) -> &str {
        "mechanism_preferences"
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        if request.connection.mechanism.is_none() && request.mechanism_preferences.is_empty() {
            request.mechanism_preferences = (self.source)();
        }
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}

/// Client-side network service
pub struct Initiator {
    name: String,
    chain: Chain,
    metadata: Arc<Metadata>,
    locks: ConnectionLocks,
}

impl Initiator {
    /// Start building an initiator
    pub fn builder(name: impl Into<String>, token_generator: SharedTokenGenerator) -> InitiatorBuilder {
        InitiatorBuilder {
            name: name.into(),
            token_generator,
            transport: None,
            preferences: Arc::new(Vec::<Mechanism>::new),
            additional: Vec::new(),
        }
    }

    /// Initiator name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Composed chain
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Number of connections holding client-side metadata
    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }

    async fn lock(&self, ctx: &RequestContext, id: &str) -> Result<ConnectionGuard<'_>, ChainError> {
        ctx.run(self.locks.lock(id))
            .await
            .map_err(|_| ChainError::cancelled(self.name.clone(), id))
    }

    fn request_failed(&self, id: &str, refresh: bool, stopped: StoppedAt) -> ChainError {
        let sent = stopped.position > CONNECT || (stopped.position == CONNECT && stopped.started);
        if !refresh && self.metadata.discard_if_empty(id) {
            debug!(client = %self.name, connection_id = %id, "nothing stored, metadata discarded");
        }
        if !sent {
            let err = ChainError::not_admitted(id, stopped.error);
            warn!(client = %self.name, connection_id = %id, error = %err, "request not sent");
            return err;
        }
        warn!(
            client = %self.name,
            connection_id = %id,
            position = stopped.position,
            error = %stopped.error,
            "request failed"
        );
        stopped.error
    }
}

#[async_trait]
impl NetworkService for Initiator {
    async fn request(&self, ctx: &RequestContext, mut request: Request) -> Result<Connection, ChainError> {
        if request.connection.id.is_empty() {
            request.connection.id = Uuid::new_v4().to_string();
        }
        let id = request.connection.id.clone();
        let refresh = request.connection.mechanism.is_some();

        let _guard = self
            .lock(ctx, &id)
            .await
            .map_err(|e| ChainError::not_admitted(id.clone(), e))?;

        if let Err(stopped) = self.chain.traverse(ctx, &mut request).await {
            return Err(self.request_failed(&id, refresh, stopped));
        }
        let mut conn = request.connection;
        conn.state = State::Up;

        if refresh {
            debug!(client = %self.name, connection_id = %id, "connection refreshed");
        } else {
            info!(client = %self.name, connection_id = %id, "connection established");
        }
        Ok(conn)
    }

    async fn close(&self, ctx: &RequestContext, mut conn: Connection) -> Result<(), ChainError> {
        let id = conn.id.clone();
        let _guard = self.lock(ctx, &id).await?;

        conn.state = State::Down;
        if let Err(e) = self.chain.process_close(ctx, conn).await {
            warn!(client = %self.name, connection_id = %id, error = %e, "close incomplete");
            return Err(e);
        }
        self.metadata.forget(&id);
        info!(client = %self.name, connection_id = %id, "connection closed");
        Ok(())
    }
}

/// Builder for [`Initiator`]
pub struct InitiatorBuilder {
    name: String,
    token_generator: SharedTokenGenerator,
    transport: Option<Arc<dyn Transport>>,
    preferences: PreferenceSource,
    additional: Vec<Element>,
}

impl InitiatorBuilder {
    /// Transport towards the endpoint (required)
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Fixed mechanism preferences, most preferred first
    #[must_use]
    pub fn with_mechanism_preferences(mut self, preferences: Vec<Mechanism>) -> Self {
        self.preferences = Arc::new(move || preferences.clone());
        self
    }

    /// Preferences generated per connection, e.g. with fresh key material
    #[must_use]
    pub fn with_mechanism_preference_source(mut self, source: PreferenceSource) -> Self {
        self.preferences = source;
        self
    }

    /// Append elements that run on the endpoint's response, in order
    #[must_use]
    pub fn with_additional_functionality(mut self, elements: impl IntoIterator<Item = Element>) -> Self {
        self.additional.extend(elements);
        self
    }

    /// Build the initiator
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if no transport was set.
    pub fn build(self) -> Result<Initiator, ConfigError> {
        let transport = self.transport.ok_or_else(|| {
            ConfigError::ValidationError(format!("client {} has no transport", self.name))
        })?;

        let metadata = Arc::new(Metadata::client());
        let mut elements: Vec<Element> = vec![
            metadata.clone() as Element,
            Arc::new(UpdatePath::new(self.name.clone(), self.token_generator)),
            Arc::new(OfferPreferences {
                source: self.preferences,
            }),
            Arc::new(Connect::new(transport)),
        ];
        elements.extend(self.additional);

        Ok(Initiator {
            chain: Chain::new(self.name.clone(), elements),
            name: self.name,
            metadata,
            locks: ConnectionLocks::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::chain::composer::testing::{Journal, Recording};
    use crate::token::random_generator;
    use crate::transport::LocalTransport;

    /// Endpoint stand-in that picks the first offered mechanism
    #[derive(Default)]
    struct Picking {
        requests: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl NetworkService for Picking {
        async fn request(&self, _ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
            self.requests.lock().push(request.clone());
            let mut conn = request.connection;
            if conn.mechanism.is_none() {
                conn.mechanism = request.mechanism_preferences.first().cloned();
            }
            Ok(conn)
        }

        async fn close(&self, _ctx: &RequestContext, _conn: Connection) -> Result<(), ChainError> {
            Ok(())
        }
    }

    fn initiator(remote: Arc<Picking>, journal: &Journal) -> Initiator {
        Initiator::builder("nsc", random_generator(Duration::from_secs(60)))
            .with_transport(Arc::new(LocalTransport::new(remote)))
            .with_mechanism_preferences(vec![Mechanism::new("IPSEC")])
            .with_additional_functionality([Arc::new(Recording::new("post", journal)) as Element])
            .build()
            .unwrap()
    }

    #[test]
    fn test_transport_required() {
        let result = Initiator::builder("nsc", random_generator(Duration::from_secs(60))).build();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_assigns_id_and_offers_preferences() {
        let remote = Arc::new(Picking::default());
        let journal = Journal::default();
        let client = initiator(remote.clone(), &journal);

        let conn = client
            .request(&RequestContext::background(), Request::new(Connection::new("", "ns")))
            .await
            .unwrap();

        assert!(Uuid::parse_str(&conn.id).is_ok());
        assert_eq!(conn.mechanism_type(), Some("IPSEC"));
        assert_eq!(conn.state, State::Up);
        assert_eq!(journal.entries(), vec!["request:post"]);

        let seen = remote.requests.lock();
        assert_eq!(seen[0].mechanism_preferences.len(), 1);
        assert_eq!(seen[0].connection.path.segments[0].name, "nsc");
    }

    #[tokio::test]
    async fn test_refresh_sends_no_preferences() {
        let remote = Arc::new(Picking::default());
        let journal = Journal::default();
        let client = initiator(remote.clone(), &journal);
        let ctx = RequestContext::background();

        let conn = client
            .request(&ctx, Request::new(Connection::new("conn-1", "ns")))
            .await
            .unwrap();
        client.request(&ctx, Request::new(conn)).await.unwrap();

        let seen = remote.requests.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].mechanism_preferences.is_empty());
        assert_eq!(seen[1].connection.path.segments.len(), 1);
    }

    #[tokio::test]
    async fn test_chain_layout() {
        let journal = Journal::default();
        let client = initiator(Arc::new(Picking::default()), &journal);
        let names: Vec<_> = client.chain().element_names().collect();
        assert_eq!(
            names,
            vec!["metadata-client", "update_path", "mechanism_preferences", "connect", "post"]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_not_admitted() {
        let remote = Arc::new(Picking::default());
        let transport = Arc::new(LocalTransport::new(remote.clone()));
        let client = Initiator::builder("nsc", random_generator(Duration::from_secs(60)))
            .with_transport(transport.clone())
            .with_mechanism_preferences(vec![Mechanism::new("IPSEC")])
            .build()
            .unwrap();
        transport.disconnect();

        let err = client
            .request(&RequestContext::background(), Request::new(Connection::new("conn-1", "ns")))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Transport(_)));
        assert!(!err.is_admitted());
        assert!(remote.requests.lock().is_empty());
        assert_eq!(client.metadata_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_connect_not_admitted() {
        let remote = Arc::new(Picking::default());
        let journal = Journal::default();
        let client = initiator(remote.clone(), &journal);
        let ctx = RequestContext::background();
        ctx.cancel();

        let err = client
            .request(&ctx, Request::new(Connection::new("conn-1", "ns")))
            .await
            .unwrap_err();
        assert!(!err.is_admitted());
        assert!(matches!(
            err,
            ChainError::NotAdmitted { ref source, .. } if matches!(**source, ChainError::Cancelled { .. })
        ));
        assert!(remote.requests.lock().is_empty());
        assert_eq!(client.metadata_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_after_connect_is_admitted() {
        let remote = Arc::new(Picking::default());
        let journal = Journal::default();
        let client = Initiator::builder("nsc", random_generator(Duration::from_secs(60)))
            .with_transport(Arc::new(LocalTransport::new(remote.clone())))
            .with_mechanism_preferences(vec![Mechanism::new("IPSEC")])
            .with_additional_functionality([
                Arc::new(Recording::new("stored", &journal)) as Element,
                Arc::new(Recording::new("post", &journal).failing_request()) as Element,
            ])
            .build()
            .unwrap();
        let ctx = RequestContext::background();

        let err = client
            .request(&ctx, Request::new(Connection::new("conn-1", "ns")))
            .await
            .unwrap_err();
        assert!(err.is_admitted());
        assert_eq!(remote.requests.lock().len(), 1);

        // "stored" left state behind, released by closing the id
        assert_eq!(client.metadata_count(), 1);
        client.close(&ctx, Connection::new("conn-1", "ns")).await.unwrap();
        assert_eq!(client.metadata_count(), 0);
    }
}
