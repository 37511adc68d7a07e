//! IPsec connection suite
//!
//! Drives a verifiable client against a verifiable endpoint over the
//! in-process transport, each side with its own in-memory dataplane. Both
//! dataplanes share one underlay, so a routed echo is only answered when
//! the far end programmed its half of the tunnel.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test integration_tests ipsec_suite
//! ```

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ipnet::IpNet;
use tokio::task::JoinSet;

use ipsec_chain::config::SuiteConfig;
use ipsec_chain::connection::{Connection, Mechanism, Request, State};
use ipsec_chain::context::RequestContext;
use ipsec_chain::dataplane::{MemoryDataplane, Operation, Underlay};
use ipsec_chain::error::{ChainError, ConfigError, DataplaneError, VerifyError};
use ipsec_chain::ipam::AddressAllocator;
use ipsec_chain::mechanisms::client_preference;
use ipsec_chain::service::{Initiator, NetworkService};
use ipsec_chain::token::{random_generator, SharedTokenGenerator, Token};
use ipsec_chain::transport::LocalTransport;
use ipsec_chain::verify::{probe, IpsecVerifiableClient, IpsecVerifiableEndpoint, Verifiable};

// ============================================================================
// Test Helpers
// ============================================================================

const SERVER_IP: &str = "172.16.0.1";
const CLIENT_IP: &str = "172.16.0.2";
const PREFIX1: &str = "10.0.0.0/24";
const PREFIX2: &str = "fc00::/7";
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

struct Suite {
    server_dp: Arc<MemoryDataplane>,
    client_dp: Arc<MemoryDataplane>,
    endpoint: Arc<IpsecVerifiableEndpoint>,
    transport: Arc<LocalTransport>,
    client: Arc<IpsecVerifiableClient>,
}

fn suite() -> Suite {
    suite_with_client_tokens(random_generator(Duration::from_secs(600)))
}

fn suite_with_client_tokens(client_tokens: SharedTokenGenerator) -> Suite {
    let underlay = Underlay::new();
    let server_dp = Arc::new(MemoryDataplane::on_underlay("server", &underlay, ip(SERVER_IP)));
    let client_dp = Arc::new(MemoryDataplane::on_underlay("client", &underlay, ip(CLIENT_IP)));

    let endpoint = Arc::new(
        IpsecVerifiableEndpoint::new(
            PREFIX1.parse().unwrap(),
            PREFIX2.parse().unwrap(),
            random_generator(Duration::from_secs(600)),
            server_dp.clone(),
            SERVER_IP.parse().unwrap(),
        )
        .with_probe_timeout(PROBE_TIMEOUT),
    );
    let transport = Arc::new(LocalTransport::new(endpoint.clone()));
    let client = Arc::new(
        IpsecVerifiableClient::new(
            transport.clone(),
            client_tokens,
            client_dp.clone(),
            CLIENT_IP.parse().unwrap(),
        )
        .unwrap()
        .with_probe_timeout(PROBE_TIMEOUT),
    );

    Suite {
        server_dp,
        client_dp,
        endpoint,
        transport,
        client,
    }
}

fn new_request() -> Request {
    Request::new(Connection::new("", "ipsec"))
}

fn ctx() -> RequestContext {
    RequestContext::background().with_timeout(Duration::from_secs(5))
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn allocated(suite: &Suite) -> usize {
    suite
        .endpoint
        .pools()
        .iter()
        .map(|pool| pool.allocated_count())
        .sum()
}

// ============================================================================
// Establishment and Verification
// ============================================================================

#[tokio::test]
async fn test_ipsec_verification_scenario() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();

    assert_eq!(conn.mechanism_type(), Some("IPSEC"));
    assert_eq!(conn.state, State::Up);
    assert_eq!(
        conn.ip_context().dst_ip_addrs(),
        &[net("10.0.0.1/32"), net("fc00::1/128")]
    );
    assert_eq!(
        conn.ip_context().src_ip_addrs(),
        &[net("10.0.0.2/32"), net("fc00::2/128")]
    );

    suite.endpoint.verify_connection(&ctx, &conn).await.unwrap();
    suite.client.verify_connection(&ctx, &conn).await.unwrap();

    // The endpoint's own address is local to its dataplane
    probe(&ctx, suite.server_dp.as_ref(), ip("10.0.0.1"))
        .await
        .unwrap();

    assert_eq!(suite.server_dp.interface_count(), 1);
    assert_eq!(suite.client_dp.interface_count(), 1);
    assert_eq!(suite.endpoint.active_count(), 1);
}

#[tokio::test]
async fn test_addresses_come_from_pools() {
    let suite = suite();
    let conn = suite.client.request(&ctx(), new_request()).await.unwrap();

    for (pool, family_v4) in suite.endpoint.pools().iter().zip([true, false]) {
        let ours: Vec<IpAddr> = conn
            .ip_context()
            .src_addrs()
            .chain(conn.ip_context().dst_addrs())
            .filter(|a| a.is_ipv4() == family_v4)
            .collect();
        assert_eq!(ours.len(), 2);
        for addr in ours {
            assert!(pool.contains(addr));
            assert!(pool.is_allocated(addr));
        }
    }
}

#[tokio::test]
async fn test_refresh_updates_in_place() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    let refreshed = suite
        .client
        .request(&ctx, Request::new(conn.clone()))
        .await
        .unwrap();

    assert_eq!(refreshed.id, conn.id);
    assert_eq!(refreshed.ip_context(), conn.ip_context());
    assert_eq!(refreshed.path.segments.len(), 2);
    assert_eq!(suite.endpoint.active_count(), 1);
    assert_eq!(allocated(&suite), 4);
    assert_eq!(suite.server_dp.call_count(Operation::CreateTunnel), 1);
    assert_eq!(suite.client_dp.call_count(Operation::CreateTunnel), 1);

    suite.client.verify_connection(&ctx, &refreshed).await.unwrap();
}

#[tokio::test]
async fn test_pair_from_config() {
    let config = SuiteConfig::default_config();
    let underlay = Underlay::new();
    let server_dp = Arc::new(MemoryDataplane::on_underlay(
        "server",
        &underlay,
        config.endpoint.underlay_ip,
    ));
    let endpoint = Arc::new(IpsecVerifiableEndpoint::from_config(&config, server_dp.clone()).unwrap());
    let client = IpsecVerifiableClient::from_config(
        &config,
        Arc::new(LocalTransport::new(endpoint.clone())),
        Arc::new(MemoryDataplane::on_underlay(
            "client",
            &underlay,
            config.client.underlay_ip,
        )),
    )
    .unwrap();

    assert_eq!(endpoint.name(), config.endpoint.name);
    assert_eq!(client.name(), config.client.name);

    let ctx = ctx();
    let conn = client
        .request(&ctx, Request::new(Connection::new("", config.network_service.as_str())))
        .await
        .unwrap();
    assert_eq!(conn.path.segments.len(), 2);
    assert_eq!(conn.path.segments[1].name, config.endpoint.name);
    endpoint.verify_connection(&ctx, &conn).await.unwrap();
    client.verify_connection(&ctx, &conn).await.unwrap();
    client.close(&ctx, conn).await.unwrap();
    assert_eq!(server_dp.interface_count(), 0);
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = SuiteConfig::default_config();
    config.endpoint.prefixes.truncate(1);

    let result = IpsecVerifiableEndpoint::from_config(&config, Arc::new(MemoryDataplane::new("server")));
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_close_after_verify() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    suite.endpoint.verify_connection(&ctx, &conn).await.unwrap();
    suite.client.verify_connection(&ctx, &conn).await.unwrap();

    suite.client.close(&ctx, conn.clone()).await.unwrap();

    for addr in conn.ip_context().src_addrs() {
        let err = probe(&ctx, suite.server_dp.as_ref(), addr)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::Transport { source: DataplaneError::NoRoute(_), .. }
        ));
    }
    suite.endpoint.verify_close(&ctx, &conn).await.unwrap();
    suite.client.verify_close(&ctx, &conn).await.unwrap();

    assert_eq!(allocated(&suite), 0);
    assert_eq!(suite.endpoint.active_count(), 0);
    assert_eq!(suite.server_dp.interface_count(), 0);
    assert_eq!(suite.server_dp.pinhole_count(), 0);
    assert_eq!(suite.client_dp.interface_count(), 0);
    assert_eq!(suite.client_dp.pinhole_count(), 0);
}

#[tokio::test]
async fn test_verify_close_detects_leftover_path() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    let err = suite.endpoint.verify_close(&ctx, &conn).await.unwrap_err();
    assert!(matches!(err, VerifyError::StillReachable(_)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    suite.client.close(&ctx, conn.clone()).await.unwrap();
    suite.client.close(&ctx, conn).await.unwrap();

    assert_eq!(allocated(&suite), 0);
    assert_eq!(suite.server_dp.call_count(Operation::DeleteInterface), 1);
    assert_eq!(suite.client_dp.call_count(Operation::DeleteInterface), 1);
}

#[tokio::test]
async fn test_failed_close_can_be_retried() {
    let suite = suite();
    let ctx = ctx();
    let conn = suite.client.request(&ctx, new_request()).await.unwrap();

    suite.server_dp.fail(Operation::DeleteInterface, "device busy");
    suite.server_dp.fail(Operation::DelPinhole, "acl locked");
    let err = suite.client.close(&ctx, conn.clone()).await.unwrap_err();
    assert!(matches!(err, ChainError::CloseFailed { .. }));
    assert_eq!(suite.server_dp.interface_count(), 1);
    assert_eq!(suite.server_dp.pinhole_count(), 2);
    assert_eq!(suite.endpoint.active_count(), 1);
    assert_eq!(suite.endpoint.metadata_count(), 1);

    suite.server_dp.heal(Operation::DeleteInterface);
    suite.server_dp.heal(Operation::DelPinhole);
    suite.client.close(&ctx, conn.clone()).await.unwrap();

    assert_eq!(suite.server_dp.interface_count(), 0);
    assert_eq!(suite.server_dp.pinhole_count(), 0);
    assert_eq!(suite.client_dp.interface_count(), 0);
    assert_eq!(suite.client_dp.pinhole_count(), 0);
    assert_eq!(suite.endpoint.active_count(), 0);
    assert_eq!(suite.endpoint.metadata_count(), 0);
    assert_eq!(suite.client.metadata_count(), 0);
    assert_eq!(allocated(&suite), 0);
    suite.endpoint.verify_close(&ctx, &conn).await.unwrap();
}

#[tokio::test]
async fn test_close_with_transport_down() {
    let suite = suite();
    let ctx = ctx();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    suite.transport.disconnect();

    let err = suite.client.close(&ctx, conn.clone()).await.unwrap_err();
    match &err {
        ChainError::CloseFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].element, "connect");
            assert!(matches!(failures[0].error, ChainError::Transport(_)));
        }
        other => panic!("expected CloseFailed, got {other:?}"),
    }

    // Client side is released regardless, the endpoint still holds its side
    assert_eq!(suite.client_dp.interface_count(), 0);
    assert_eq!(suite.endpoint.active_count(), 1);
    assert_eq!(suite.server_dp.interface_count(), 1);

    suite.transport.reconnect();
    suite.client.close(&ctx, conn).await.unwrap();
    assert_eq!(suite.endpoint.active_count(), 0);
    assert_eq!(suite.server_dp.interface_count(), 0);
    assert_eq!(allocated(&suite), 0);
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_unknown_mechanism_fails_before_allocation() {
    let suite = suite();
    let client = Initiator::builder("unknown-client", random_generator(Duration::from_secs(600)))
        .with_transport(suite.transport.clone())
        .with_mechanism_preferences(vec![Mechanism::new("UNKNOWN")])
        .build()
        .unwrap();

    let err = client.request(&ctx(), new_request()).await.unwrap_err();

    assert!(matches!(err, ChainError::UnsupportedMechanism { ref requested } if requested == &["UNKNOWN"]));
    assert!(err.is_admitted());
    assert_eq!(allocated(&suite), 0);
    assert!(suite.server_dp.mutations().is_empty());
    assert_eq!(suite.endpoint.active_count(), 0);
}

#[tokio::test]
async fn test_expired_token_not_admitted() {
    let expired: SharedTokenGenerator = Arc::new(|| {
        Ok(Token {
            value: "stale".into(),
            expires: SystemTime::now() - Duration::from_secs(1),
        })
    });
    let suite = suite_with_client_tokens(expired);

    let err = suite.client.request(&ctx(), new_request()).await.unwrap_err();

    assert!(matches!(err, ChainError::Unauthorized { .. }));
    assert!(!err.is_admitted());
    assert!(!err.is_recoverable());
    assert!(suite.server_dp.calls().is_empty());
    assert!(suite.client_dp.calls().is_empty());
    assert_eq!(allocated(&suite), 0);
}

#[tokio::test]
async fn test_partial_state_left_for_caller() {
    let suite = suite();
    let ctx = ctx();
    suite.server_dp.fail(Operation::AddPinhole, "acl full");

    let err = suite
        .client
        .request(&ctx, Request::new(Connection::new("conn-partial", "ipsec")))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::DataplaneProgrammingFailed { ref element, .. } if element == "pinhole-server"));
    assert!(err.is_admitted());

    // No rollback: upstream elements kept their state
    assert_eq!(suite.server_dp.interface_count(), 1);
    assert_eq!(allocated(&suite), 4);
    assert_eq!(suite.endpoint.active_count(), 0);
    assert_eq!(suite.endpoint.metadata_count(), 1);
    assert_eq!(suite.client.metadata_count(), 0);

    // Closing the id releases it
    suite
        .endpoint
        .close(&ctx, Connection::new("conn-partial", "ipsec"))
        .await
        .unwrap();
    assert_eq!(suite.server_dp.interface_count(), 0);
    assert_eq!(allocated(&suite), 0);
    assert_eq!(suite.endpoint.metadata_count(), 0);
}

#[tokio::test]
async fn test_cancelled_request_does_nothing() {
    let suite = suite();
    let ctx = ctx();
    ctx.cancel();

    let err = suite.client.request(&ctx, new_request()).await.unwrap_err();
    assert!(!err.is_admitted());
    assert!(matches!(
        err,
        ChainError::NotAdmitted { ref source, .. } if matches!(**source, ChainError::Cancelled { .. })
    ));
    assert!(suite.client_dp.calls().is_empty());
    assert_eq!(suite.transport.call_count(), 0);
    assert_eq!(suite.client.metadata_count(), 0);
}

#[tokio::test]
async fn test_transport_down_not_admitted() {
    let suite = suite();
    suite.transport.disconnect();

    let err = suite.client.request(&ctx(), new_request()).await.unwrap_err();
    assert!(matches!(err, ChainError::Transport(_)));
    assert!(!err.is_admitted());
    assert!(suite.server_dp.calls().is_empty());
    assert!(suite.client_dp.calls().is_empty());
    assert_eq!(suite.endpoint.metadata_count(), 0);
    assert_eq!(suite.client.metadata_count(), 0);
}

#[tokio::test]
async fn test_rejected_requests_leave_no_metadata() {
    let suite = suite();
    let client = Initiator::builder("unknown-client", random_generator(Duration::from_secs(600)))
        .with_transport(suite.transport.clone())
        .with_mechanism_preferences(vec![Mechanism::new("UNKNOWN")])
        .build()
        .unwrap();
    let ctx = ctx();

    for _ in 0..3 {
        let err = client.request(&ctx, new_request()).await.unwrap_err();
        assert!(matches!(err, ChainError::UnsupportedMechanism { .. }));
    }
    assert_eq!(suite.endpoint.metadata_count(), 0);
    assert_eq!(client.metadata_count(), 0);
    assert_eq!(suite.endpoint.active_count(), 0);
}

#[tokio::test]
async fn test_out_of_range_path_index_rejected() {
    let suite = suite();
    let ctx = ctx();
    let conn = suite.client.request(&ctx, new_request()).await.unwrap();

    let mut bad = conn.clone();
    bad.path.index = 5;
    let err = suite
        .endpoint
        .request(&ctx, Request::new(bad))
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::InvalidRequest(_)));

    // The recorded connection is untouched
    assert_eq!(suite.endpoint.active_count(), 1);
    assert_eq!(suite.server_dp.interface_count(), 1);
    suite.endpoint.verify_connection(&ctx, &conn).await.unwrap();
}

#[tokio::test]
async fn test_unprogrammed_client_fails_verification() {
    let suite = suite();
    let client_ip = ip(CLIENT_IP);
    let bare = Initiator::builder("bare-client", random_generator(Duration::from_secs(600)))
        .with_transport(suite.transport.clone())
        .with_mechanism_preference_source(Arc::new(move || vec![client_preference(client_ip)]))
        .build()
        .unwrap();
    let ctx = ctx();

    let conn = bare.request(&ctx, new_request()).await.unwrap();

    // The endpoint programmed its half, the client dataplane is untouched
    assert_eq!(suite.server_dp.interface_count(), 1);
    assert_eq!(suite.server_dp.pinhole_count(), 2);
    assert!(suite.client_dp.calls().is_empty());

    let err = suite.endpoint.verify_connection(&ctx, &conn).await.unwrap_err();
    assert!(matches!(
        err,
        VerifyError::Transport { source: DataplaneError::NoRoute(_), .. }
    ));

    bare.close(&ctx, conn).await.unwrap();
    assert_eq!(suite.server_dp.interface_count(), 0);
}

// ============================================================================
// Concurrency and Timeouts
// ============================================================================

#[tokio::test]
async fn test_concurrent_connections_get_distinct_addresses() {
    const CONNECTIONS: usize = 8;
    let suite = suite();

    let mut tasks = JoinSet::new();
    for _ in 0..CONNECTIONS {
        let client = suite.client.clone();
        tasks.spawn(async move { client.request(&ctx(), new_request()).await });
    }

    let mut conns = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        conns.push(joined.unwrap().unwrap());
    }

    let addrs: HashSet<IpAddr> = conns
        .iter()
        .flat_map(|c| c.ip_context().src_addrs().chain(c.ip_context().dst_addrs()))
        .collect();
    assert_eq!(addrs.len(), CONNECTIONS * 4);
    assert_eq!(allocated(&suite), CONNECTIONS * 4);
    assert_eq!(suite.endpoint.active_count(), CONNECTIONS);

    // Shared pinholes survive closing one of the connections
    let ctx = ctx();
    let first = conns.remove(0);
    suite.client.close(&ctx, first).await.unwrap();
    for conn in &conns {
        suite.endpoint.verify_connection(&ctx, conn).await.unwrap();
        suite.client.verify_connection(&ctx, conn).await.unwrap();
    }

    for conn in conns {
        suite.client.close(&ctx, conn).await.unwrap();
    }
    assert_eq!(allocated(&suite), 0);
    assert_eq!(suite.server_dp.pinhole_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_refresh_racing_close_leaves_consistent_state() {
    const ROUNDS: usize = 16;
    let suite = suite();
    let ctx = ctx();

    for _ in 0..ROUNDS {
        let conn = suite.client.request(&ctx, new_request()).await.unwrap();
        let id = conn.id.clone();

        let refresh = {
            let (client, ctx, conn) = (suite.client.clone(), ctx.clone(), conn.clone());
            tokio::spawn(async move { client.request(&ctx, Request::new(conn)).await })
        };
        let close = {
            let (client, ctx) = (suite.client.clone(), ctx.clone());
            tokio::spawn(async move { client.close(&ctx, conn).await })
        };
        let refreshed = refresh.await.unwrap().unwrap();
        close.await.unwrap().unwrap();

        if suite.endpoint.connection(&id).is_some() {
            // Close went first, the refresh brought the connection back
            assert_eq!(suite.server_dp.interface_count(), 1);
            assert_eq!(suite.client_dp.interface_count(), 1);
            assert_eq!(suite.server_dp.pinhole_count(), 2);
            assert_eq!(suite.client_dp.pinhole_count(), 2);
            assert_eq!(allocated(&suite), 4);
            suite.endpoint.verify_connection(&ctx, &refreshed).await.unwrap();
            suite.client.verify_connection(&ctx, &refreshed).await.unwrap();
            suite.client.close(&ctx, refreshed).await.unwrap();
        }

        assert_eq!(suite.endpoint.active_count(), 0);
        assert_eq!(suite.server_dp.interface_count(), 0);
        assert_eq!(suite.client_dp.interface_count(), 0);
        assert_eq!(suite.server_dp.pinhole_count(), 0);
        assert_eq!(suite.client_dp.pinhole_count(), 0);
        assert_eq!(allocated(&suite), 0);
        assert_eq!(suite.endpoint.metadata_count(), 0);
        assert_eq!(suite.client.metadata_count(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_blackholed_dataplane_times_out() {
    let suite = suite();
    let ctx = RequestContext::background();

    let conn = suite.client.request(&ctx, new_request()).await.unwrap();
    suite.server_dp.set_blackhole(true);

    let err = suite.endpoint.verify_connection(&ctx, &conn).await.unwrap_err();
    match err {
        VerifyError::Timeout { addr, elapsed } => {
            assert_eq!(addr, ip("10.0.0.2"));
            assert!(elapsed >= PROBE_TIMEOUT);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    // One probe, no retry
    assert_eq!(suite.server_dp.call_count(Operation::Echo), 1);

    // A blackholed path still counts as cleared
    suite.client.close(&ctx, conn.clone()).await.unwrap();
    suite.endpoint.verify_close(&ctx, &conn).await.unwrap();
}
