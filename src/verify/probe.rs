//! Reachability probe
//!
//! One echo per call. There is no retry: callers wanting several attempts
//! loop themselves, each with its own bounded context.

use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::dataplane::Dataplane;
use crate::error::VerifyError;

/// Send a single echo to `addr` and wait for the reply
///
/// Returns the round-trip time.
///
/// # Errors
///
/// - `VerifyError::Timeout` if the context is cancelled or its deadline
///   passes before a reply.
/// - `VerifyError::Transport` if the dataplane could not send the echo.
pub async fn probe(ctx: &RequestContext, dataplane: &dyn Dataplane, addr: IpAddr) -> Result<Duration, VerifyError> {
    let started = Instant::now();
    match ctx.run(dataplane.echo(addr)).await {
        Ok(Ok(rtt)) => {
            debug!(%addr, ?rtt, "probe answered");
            Ok(rtt)
        }
        Ok(Err(source)) => {
            debug!(%addr, error = %source, "probe not sent");
            Err(VerifyError::Transport { addr, source })
        }
        Err(reason) => {
            let elapsed = started.elapsed();
            warn!(%addr, ?elapsed, %reason, "probe timed out");
            Err(VerifyError::Timeout { addr, elapsed })
        }
    }
}

fn bounded(ctx: &RequestContext, timeout: Option<Duration>) -> RequestContext {
    match timeout {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx.clone(),
    }
}

/// Probe every address in order, stopping at the first failure
///
/// Each probe gets its own `timeout` on top of `ctx` when one is given.
///
/// # Errors
///
/// Returns the first failing probe's error.
pub async fn probe_each<I>(
    ctx: &RequestContext,
    dataplane: &dyn Dataplane,
    addrs: I,
    timeout: Option<Duration>,
) -> Result<(), VerifyError>
where
    I: IntoIterator<Item = IpAddr> + Send,
    I::IntoIter: Send,
{
    for addr in addrs {
        probe(&bounded(ctx, timeout), dataplane, addr).await?;
    }
    Ok(())
}

/// Probe every address and require that none answers
///
/// Timeouts and send failures both count as unreachable.
///
/// # Errors
///
/// Returns `VerifyError::StillReachable` for the first address that answered.
pub async fn expect_unreachable<I>(
    ctx: &RequestContext,
    dataplane: &dyn Dataplane,
    addrs: I,
    timeout: Option<Duration>,
) -> Result<(), VerifyError>
where
    I: IntoIterator<Item = IpAddr> + Send,
    I::IntoIter: Send,
{
    for addr in addrs {
        if probe(&bounded(ctx, timeout), dataplane, addr).await.is_ok() {
            warn!(%addr, "address still answers");
            return Err(VerifyError::StillReachable(addr));
        }
    }
    Ok(())
}
