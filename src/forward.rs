//! Bidirectional byte pump with half-close awareness
//!
//! Each direction is an independent copy loop bounded by a per-read idle
//! timeout and a per-write deadline, both refreshed on every operation.
//! When one direction reaches end-of-stream, the half-close is propagated
//! to the peer (shutdown of its write side) instead of tearing down the
//! whole connection, unless the backend policy says otherwise. Once one
//! direction is closed, the survivor is bounded by the half-close idle
//! timeout. Reads are metered against the backend's bandwidth group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bwlimit::BwGroup;

/// Idle limit for a read with the connection fully open.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Deadline for each write, refreshed per operation.
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Per-backend close policy applied by the pump.
#[derive(Debug, Clone)]
pub struct ForwardPolicy {
    /// Upstream EOF tears down the whole connection.
    pub server_close_ends_connection: bool,
    /// Client EOF tears down the whole connection.
    pub client_close_ends_connection: bool,
    /// How long the surviving direction may stay idle after a half-close.
    pub half_close_timeout: Duration,
}

impl Default for ForwardPolicy {
    fn default() -> Self {
        ForwardPolicy {
            server_close_ends_connection: true,
            client_close_ends_connection: false,
            half_close_timeout: Duration::from_secs(60),
        }
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub client_to_server: u64,
    pub server_to_client: u64,
}

enum Metered {
    Ingress(Arc<BwGroup>),
    Egress(Arc<BwGroup>),
    None,
}

impl Metered {
    async fn consume(&self, n: usize) {
        match self {
            Metered::Ingress(g) => g.consume_ingress(n).await,
            Metered::Egress(g) => g.consume_egress(n).await,
            Metered::None => {}
        }
    }
}

/// Pump bytes between the client and the upstream until both directions are
/// done, the policy ends the connection, a timeout fires, or `cancel` is
/// triggered. Both endpoints are shut down before returning.
pub async fn forward_bidirectional<C, S>(
    client: C,
    server: S,
    policy: &ForwardPolicy,
    bw_group: Option<Arc<BwGroup>>,
    cancel: CancellationToken,
) -> ForwardStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (server_rd, server_wr) = tokio::io::split(server);

    let half_closed = AtomicBool::new(false);
    let conn_cancel = cancel.child_token();

    let ingress = bw_group
        .as_ref()
        .map_or(Metered::None, |g| Metered::Ingress(g.clone()));
    let egress = bw_group.map_or(Metered::None, Metered::Egress);

    let c2s = pump(
        client_rd,
        server_wr,
        "client->backend",
        policy.client_close_ends_connection,
        policy.half_close_timeout,
        ingress,
        &half_closed,
        &conn_cancel,
    );
    let s2c = pump(
        server_rd,
        client_wr,
        "backend->client",
        policy.server_close_ends_connection,
        policy.half_close_timeout,
        egress,
        &half_closed,
        &conn_cancel,
    );

    let (client_to_server, server_to_client) = tokio::join!(c2s, s2c);
    ForwardStats {
        client_to_server,
        server_to_client,
    }
}

/// Copy one direction. Returns the bytes moved.
#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    mut rd: R,
    mut wr: W,
    direction: &str,
    eof_ends_connection: bool,
    half_close_timeout: Duration,
    meter: Metered,
    half_closed: &AtomicBool,
    cancel: &CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let idle = if half_closed.load(Ordering::Acquire) {
            half_close_timeout
        } else {
            READ_IDLE_TIMEOUT
        };
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            read = tokio::time::timeout(idle, rd.read(&mut buf)) => match read {
                Err(_) => {
                    debug!(direction, "idle timeout");
                    cancel.cancel();
                    break;
                }
                Ok(Err(e)) => {
                    debug!(direction, error = %e, "read failed");
                    cancel.cancel();
                    break;
                }
                Ok(Ok(0)) => {
                    // Peer half-closed its sending side.
                    if eof_ends_connection {
                        cancel.cancel();
                    } else {
                        half_closed.store(true, Ordering::Release);
                    }
                    break;
                }
                Ok(Ok(n)) => n,
            },
        };
        meter.consume(n).await;
        let write = tokio::select! {
            () = cancel.cancelled() => break,
            w = tokio::time::timeout(WRITE_TIMEOUT, wr.write_all(&buf[..n])) => w,
        };
        match write {
            Err(_) => {
                debug!(direction, "write deadline exceeded");
                cancel.cancel();
                break;
            }
            Ok(Err(e)) => {
                debug!(direction, error = %e, "write failed");
                cancel.cancel();
                break;
            }
            Ok(Ok(())) => total += n as u64,
        }
    }
    // Propagate the close to the peer's write side. On TLS streams this
    // also flushes the close_notify.
    let _ = tokio::time::timeout(WRITE_TIMEOUT, wr.shutdown()).await;
    total
}
