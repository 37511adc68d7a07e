//! Verifiable IPsec endpoint

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
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
use crate::ipam::{IpPool, PointToPointIpam};
use crate::mechanisms::{ipsec, IpsecServer, MechanismSelector};
use crate::service::{Endpoint, NetworkService};
use crate::token::{random_generator, SharedTokenGenerator};

const NAME: &str = "ipsec-verifiable-endpoint";

/// Endpoint serving `IPSEC` connections with addresses from two prefixes
pub struct IpsecVerifiableEndpoint {
    endpoint: Endpoint,
    dataplane: Arc<dyn Dataplane>,
    pools: Vec<Arc<IpPool>>,
    probe_timeout: Option<Duration>,
}

impl IpsecVerifiableEndpoint {
    /// Build the endpoint chain
    ///
    /// Additional elements: mechanism selector (`IPSEC` only), one
    /// point-to-point IPAM per prefix, connection context, up, pinhole.
    pub fn new(
        prefix1: IpNet,
        prefix2: IpNet,
        token_generator: SharedTokenGenerator,
        dataplane: Arc<dyn Dataplane>,
        server_ip: IpAddr,
    ) -> Self {
        Self::named(NAME, prefix1, prefix2, token_generator, dataplane, server_ip)
    }

    /// Build the endpoint described by `config`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn from_config(config: &SuiteConfig, dataplane: Arc<dyn Dataplane>) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = &config.endpoint;
        let [prefix1, prefix2] = endpoint.prefixes.as_slice() else {
            return Err(ConfigError::ValidationError(
                "endpoint needs exactly two prefixes".into(),
            ));
        };
        Ok(Self::named(
            &endpoint.name,
            *prefix1,
            *prefix2,
            random_generator(config.token.lifetime()),
            dataplane,
            endpoint.underlay_ip,
        )
        .with_probe_timeout(config.verify.probe_timeout()))
    }

    fn named(
        name: &str,
        prefix1: IpNet,
        prefix2: IpNet,
        token_generator: SharedTokenGenerator,
        dataplane: Arc<dyn Dataplane>,
        server_ip: IpAddr,
    ) -> Self {
        let pools = vec![Arc::new(IpPool::new(prefix1)), Arc::new(IpPool::new(prefix2))];

        let mechanisms = MechanismSelector::new(HashMap::from([(
            ipsec::MECHANISM.to_string(),
            Arc::new(IpsecServer::new(dataplane.clone(), server_ip)) as Element,
        )]));

        let mut additional: Vec<Element> = vec![Arc::new(mechanisms)];
        additional.extend(
            pools
                .iter()
                .map(|pool| Arc::new(PointToPointIpam::new(pool.clone())) as Element),
        );
        additional.push(Arc::new(ConnectionContextElement::new(dataplane.clone(), Side::Server)));
        additional.push(Arc::new(Up::server(dataplane.clone())));
        additional.push(Arc::new(PinholeElement::new(dataplane.clone(), Side::Server)));

        let endpoint = Endpoint::builder(name, token_generator)
            .with_additional_functionality(additional)
            .build();

        Self {
            endpoint,
            dataplane,
            pools,
            probe_timeout: None,
        }
    }

    /// Bound every probe to `timeout` on top of the caller's context
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }

    /// Address pools, in prefix order
    pub fn pools(&self) -> &[Arc<IpPool>] {
        &self.pools
    }

    /// Dataplane handle the endpoint programs and probes through
    pub fn dataplane(&self) -> &Arc<dyn Dataplane> {
        &self.dataplane
    }
}

impl Deref for IpsecVerifiableEndpoint {
    type Target = Endpoint;

    fn deref(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[async_trait]
impl NetworkService for IpsecVerifiableEndpoint {
    async fn request(&self, ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
        self.endpoint.request(ctx, request).await
    }

    async fn close(&self, ctx: &RequestContext, conn: Connection) -> Result<(), ChainError> {
        self.endpoint.close(ctx, conn).await
    }
}

#[async_trait]
impl Verifiable for IpsecVerifiableEndpoint {
    async fn verify_connection(&self, ctx: &RequestContext, conn: &Connection) -> Result<(), VerifyError> {
        let targets = Side::Server.probe_targets(conn.ip_context());
        debug!(connection_id = %conn.id, targets = targets.len(), "verifying from endpoint");
        probe_each(ctx, self.dataplane.as_ref(), targets, self.probe_timeout).await
    }

    async fn verify_close(&self, ctx: &RequestContext, conn: &Connection) -> Result<(), VerifyError> {
        let targets = Side::Server.probe_targets(conn.ip_context());
        expect_unreachable(ctx, self.dataplane.as_ref(), targets, self.probe_timeout).await
    }
}
