//! IPsec mechanism elements
//!
//! The client offers an `IPSEC` preference carrying its underlay address,
//! its inbound SPI and shared key material. The endpoint completes the
//! mechanism with its own underlay address and inbound SPI and creates
//! its tunnel interface; the client creates the mirror interface once the
//! completed mechanism comes back.
//!
//! # Parameters
//!
//! | Key | Set by | Meaning |
//! |-----|--------|---------|
//! | `src_ip` | client | client underlay address |
//! | `src_spi` | client | SPI of traffic towards the client |
//! | `psk` | client | opaque shared key material |
//! | `dst_ip` | endpoint | endpoint underlay address |
//! | `dst_spi` | endpoint | SPI of traffic towards the endpoint |
//!
//! Both elements record the interface index and the pinholes the tunnel
//! needs in the connection metadata for the elements that follow.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::Rng;
use tracing::{debug, info};

use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Mechanism, Request};
use crate::context::RequestContext;
use crate::dataplane::{Dataplane, InterfaceIndex, IpsecTunnel, Pinhole, IKE_PORT, NAT_T_PORT};
use crate::elements::Side;
use crate::error::{ChainError, DataplaneError};

/// Mechanism type identifier
pub const MECHANISM: &str = "IPSEC";

/// Client underlay address parameter
pub const SRC_IP: &str = "src_ip";
/// Endpoint underlay address parameter
pub const DST_IP: &str = "dst_ip";
/// SPI towards the client
pub const SRC_SPI: &str = "src_spi";
/// SPI towards the endpoint
pub const DST_SPI: &str = "dst_spi";
/// Shared key material
pub const PSK: &str = "psk";

/// Lowest SPI handed out; values below 256 are reserved
const MIN_SPI: u32 = 0x100;

fn random_spi() -> u32 {
    rand::thread_rng().gen_range(MIN_SPI..u32::MAX)
}

fn random_psk() -> String {
    let key: [u8; 32] = rand::random();
    STANDARD.encode(key)
}

/// Build the client's `IPSEC` preference
#[must_use]
pub fn client_preference(client_ip: IpAddr) -> Mechanism {
    Mechanism::new(MECHANISM)
        .with_parameter(SRC_IP, client_ip.to_string())
        .with_parameter(SRC_SPI, random_spi().to_string())
        .with_parameter(PSK, random_psk())
}

fn required_ip(mechanism: &Mechanism, key: &str) -> Result<IpAddr, ChainError> {
    mechanism
        .ip_parameter(key)
        .ok_or_else(|| ChainError::InvalidRequest(format!("IPSEC mechanism lacks a valid {key}")))
}

fn required_spi(mechanism: &Mechanism, key: &str) -> Result<u32, ChainError> {
    mechanism
        .parameter(key)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ChainError::InvalidRequest(format!("IPSEC mechanism lacks a valid {key}")))
}

fn ipsec_mechanism(request: &Request) -> Result<&Mechanism, ChainError> {
    match &request.connection.mechanism {
        Some(m) if m.mechanism_type == MECHANISM => Ok(m),
        Some(m) => Err(ChainError::UnsupportedMechanism {
            requested: vec![m.mechanism_type.clone()],
        }),
        None => Err(ChainError::InvalidRequest("no mechanism selected".into())),
    }
}

/// Shared tunnel programming for both sides
struct TunnelProgrammer {
    name: &'static str,
    side: Side,
    dataplane: Arc<dyn Dataplane>,
}

impl TunnelProgrammer {
    async fn ensure(&self, request: &mut Request, tunnel: IpsecTunnel) -> Result<(), ChainError> {
        let metadata = &request.connection.metadata;
        if let Some(if_index) = metadata.get::<InterfaceIndex>(self.side.if_index_key()) {
            debug!(element = self.name, connection_id = %request.connection.id, if_index, "tunnel already programmed");
            return Ok(());
        }

        let remote = tunnel.remote_ip;
        let if_index = self
            .dataplane
            .create_ipsec_tunnel(&tunnel)
            .await
            .map_err(|e| ChainError::dataplane(self.name, request.connection.id.clone(), e))?;

        metadata.insert(self.side.if_index_key(), &if_index)?;
        let mut pinholes = metadata
            .get::<Vec<Pinhole>>(self.side.pinholes_key())
            .unwrap_or_default();
        for pinhole in [Pinhole::udp(remote, IKE_PORT), Pinhole::udp(remote, NAT_T_PORT)] {
            if !pinholes.contains(&pinhole) {
                pinholes.push(pinhole);
            }
        }
        metadata.insert(self.side.pinholes_key(), &pinholes)?;

        info!(
            element = self.name,
            connection_id = %request.connection.id,
            if_index,
            local = %tunnel.local_ip,
            remote = %remote,
            "IPsec tunnel created"
        );
        Ok(())
    }

    async fn release(&self, conn: &mut Connection) -> Result<(), ChainError> {
        let Some(if_index) = conn.metadata.get::<InterfaceIndex>(self.side.if_index_key()) else {
            return Ok(());
        };

        match self.dataplane.delete_interface(if_index).await {
            Ok(()) | Err(DataplaneError::InterfaceNotFound(_)) => {
                conn.metadata.remove::<InterfaceIndex>(self.side.if_index_key());
                debug!(element = self.name, connection_id = %conn.id, if_index, "IPsec tunnel deleted");
                Ok(())
            }
            Err(e) => Err(ChainError::dataplane(self.name, conn.id.clone(), e)),
        }
    }
}

/// Endpoint-side IPsec element
pub struct IpsecServer {
    programmer: TunnelProgrammer,
    local_ip: IpAddr,
}

impl IpsecServer {
    /// Create the element for an endpoint reachable at `local_ip` on the underlay
    pub fn new(dataplane: Arc<dyn Dataplane>, local_ip: IpAddr) -> Self {
        Self {
            programmer: TunnelProgrammer {
                name: "ipsec-server",
                side: Side::Server,
                dataplane,
            },
            local_ip,
        }
    }
}

#[async_trait]
impl NetworkServiceElement for IpsecServer {
    fn name(&self) -> &str {
        self.programmer.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let mechanism = ipsec_mechanism(request)?;
        let remote_ip = required_ip(mechanism, SRC_IP)?;
        let spi_out = required_spi(mechanism, SRC_SPI)?;
        let psk = mechanism.parameter(PSK).unwrap_or_default().to_string();
        let spi_in = match mechanism.parameter(DST_SPI).and_then(|v| v.parse().ok()) {
            Some(spi) => spi,
            None => random_spi(),
        };

        if let Some(mechanism) = request.connection.mechanism.as_mut() {
            mechanism
                .parameters
                .insert(DST_IP.to_string(), self.local_ip.to_string());
            mechanism
                .parameters
                .insert(DST_SPI.to_string(), spi_in.to_string());
        }

        let tunnel = IpsecTunnel {
            local_ip: self.local_ip,
            remote_ip,
            spi_in,
            spi_out,
            psk,
        };
        self.programmer.ensure(request, tunnel).await
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        self.programmer.release(conn).await
    }
}

/// Client-side IPsec element
///
/// Runs after the transport element, on the mechanism completed by the
/// endpoint.
pub struct IpsecClient {
    programmer: TunnelProgrammer,
    local_ip: IpAddr,
}

impl IpsecClient {
    /// Create the element for a client reachable at `local_ip` on the underlay
    pub fn new(dataplane: Arc<dyn Dataplane>, local_ip: IpAddr) -> Self {
        Self {
            programmer: TunnelProgrammer {
                name: "ipsec-client",
                side: Side::Client,
                dataplane,
            },
            local_ip,
        }
    }

    /// Preference to offer to the endpoint
    #[must_use]
    pub fn preference(&self) -> Mechanism {
        client_preference(self.local_ip)
    }
}

#[async_trait]
impl NetworkServiceElement for IpsecClient {
    fn name(&self) -> &str {
        self.programmer.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let mechanism = ipsec_mechanism(request)?;
        let tunnel = IpsecTunnel {
            local_ip: self.local_ip,
            remote_ip: required_ip(mechanism, DST_IP)?,
            spi_in: required_spi(mechanism, SRC_SPI)?,
            spi_out: required_spi(mechanism, DST_SPI)?,
            psk: mechanism.parameter(PSK).unwrap_or_default().to_string(),
        };
        self.programmer.ensure(request, tunnel).await
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        self.programmer.release(conn).await
    }
}
