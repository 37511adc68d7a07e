//! Verifiable IPsec client

use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::probe::{expect_unreachable, probe_each};
use super::Verifiable;
use crate::chain::Element;
use crate::config::SuiteConfig;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::dataplane::Dataplane;
use crate::elements::{ConnectionContextElement, PinholeElement, Side, Up};
use crate::error::{ChainError, ConfigError, VerifyError};
use crate::mechanisms::{ipsec, IpsecClient};
use crate::service::{Initiator, NetworkService};
use crate::token::{random_generator, SharedTokenGenerator};
use crate::transport::Transport;

const NAME: &str = "ipsec-verifiable-client";

/// Client requesting `IPSEC` connections and programming its own side
pub struct IpsecVerifiableClient {
    initiator: Initiator,
    dataplane: Arc<dyn Dataplane>,
    probe_timeout: Option<Duration>,
}

impl IpsecVerifiableClient {
    /// Build the client chain
    ///
    /// Every new connection offers a fresh `IPSEC` preference for
    /// `client_ip`. Elements run on the endpoint's response: IPsec, connection
    /// context, up, pinhole.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the initiator cannot be built.
    pub fn new(
        transport: Arc<dyn Transport>,
        token_generator: SharedTokenGenerator,
        dataplane: Arc<dyn Dataplane>,
        client_ip: IpAddr,
    ) -> Result<Self, ConfigError> {
        Self::named(NAME, transport, token_generator, dataplane, client_ip)
    }

    /// Build the client described by `config`, talking over `transport`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn from_config(
        config: &SuiteConfig,
        transport: Arc<dyn Transport>,
        dataplane: Arc<dyn Dataplane>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::named(
            &config.client.name,
            transport,
            random_generator(config.token.lifetime()),
            dataplane,
            config.client.underlay_ip,
        )?
        .with_probe_timeout(config.verify.probe_timeout()))
    }

    fn named(
        name: &str,
        transport: Arc<dyn Transport>,
        token_generator: SharedTokenGenerator,
        dataplane: Arc<dyn Dataplane>,
        client_ip: IpAddr,
    ) -> Result<Self, ConfigError> {
        let additional: Vec<Element> = vec![
            Arc::new(IpsecClient::new(dataplane.clone(), client_ip)),
            Arc::new(ConnectionContextElement::new(dataplane.clone(), Side::Client)),
            Arc::new(Up::client(dataplane.clone())),
            Arc::new(PinholeElement::new(dataplane.clone(), Side::Client)),
        ];

        let initiator = Initiator::builder(name, token_generator)
            .with_transport(transport)
            .with_mechanism_preference_source(Arc::new(move || vec![ipsec::client_preference(client_ip)]))
            .with_additional_functionality(additional)
            .build()?;

        Ok(Self {
            initiator,
            dataplane,
            probe_timeout: None,
        })
    }

    /// Bound every probe to `timeout` on top of the caller's context
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Dataplane handle the client programs and probes through
    pub fn dataplane(&self) -> &Arc<dyn Dataplane> {
        &self.dataplane
    }
}

impl Deref for IpsecVerifiableClient {
    type Target = Initiator;

    fn deref(&self) -> &Initiator {
        &self.initiator
    }
}

#[async_trait]
impl NetworkService for IpsecVerifiableClient {
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
        self.initiator.request(ctx, request).await
    }

    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError> {
        self.initiator.close(ctx, conn).await
    }
}

#[async_trait]
impl Verifiable for IpsecVerifiableClient {
    async fn verify_connection(&self, ctx: &RequestContext, conn: &Connection) -> Result<(), VerifyError> {
        let targets = Side::Client.probe_targets(conn.ip_context());
        debug!(connection_id = %conn.id, targets = targets.len(), "verifying from client");
        probe_each(ctx, self.dataplane.as_ref(), targets, self.probe_timeout).await
    }

    async fn verify_close(&self, ctx: &RequestContext, conn: &Connection) -> Result<(), VerifyError> {
        let targets = Side::Client.probe_targets(conn.ip_context());
        expect_unreachable(ctx, self.dataplane.as_ref(), targets, self.probe_timeout).await
    }
}
