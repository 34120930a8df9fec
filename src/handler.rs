//! Per-connection state machine
//!
//! accepted -> handshake -> resolved -> dial -> forward -> teardown.
//!
//! The ClientHello is peeked before anything is written, so backend
//! resolution and the IP policy run with the socket untouched: a denial and
//! an unknown name produce the same `unrecognized_name` alert, and the
//! passthrough path can hand the pristine byte stream to the upstream. The
//! whole pre-forward phase runs under a single handshake deadline. Every
//! connection logs a completion record with handshake, dial, and total
//! durations.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::CertificateSource;
use crate::dial::dial_upstream;
use crate::forward::forward_bidirectional;
use crate::routing::{Mode, Route, Snapshot};
use crate::sni::peek_client_hello;
use crate::tls::{client_identities, server_config_for, write_unrecognized_name_alert};

/// Deadline for everything before forwarding starts.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a connection task needs. The snapshot reference is pinned at
/// accept time; reloads published later do not affect this connection.
pub struct ConnContext {
    pub snapshot: Arc<Snapshot>,
    pub certs: Arc<dyn CertificateSource>,
    pub cancel: CancellationToken,
    pub local_addr: SocketAddr,
}

/// Drive one accepted TCP connection to completion. Errors never propagate
/// past this function; they are logged with the remote address.
pub async fn handle_connection(ctx: ConnContext, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = run(ctx, stream, peer).await {
        warn!(%peer, error = format!("{e:#}"), "connection failed");
    }
}

async fn run(ctx: ConnContext, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    let start = Instant::now();
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;

    let hello = match tokio::time::timeout_at(deadline, peek_client_hello(&stream)).await {
        Err(_) => {
            debug!(%peer, "handshake deadline before ClientHello");
            return Ok(());
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "invalid ClientHello");
            return Ok(());
        }
        Ok(Ok(hello)) => hello,
    };

    let sni = hello
        .server_name
        .clone()
        .unwrap_or_default()
        .to_lowercase();
    let Some(route) = ctx.snapshot.resolve_offered(&sni, &hello.alpn) else {
        info!(%peer, sni, "unexpected server name");
        write_unrecognized_name_alert(&mut stream).await;
        return Ok(());
    };

    // IP policy, deny then allow. Checked before the handshake is driven,
    // so the peer sees exactly what an unknown name would produce.
    if !route.ip_allowed(peer.ip()) {
        info!(%peer, sni, "connection denied by IP policy");
        write_unrecognized_name_alert(&mut stream).await;
        return Ok(());
    }

    if route.mode == Mode::TlsPassthrough {
        return passthrough(ctx, stream, peer, &sni, &route, start).await;
    }

    // Name used to key the certificate; resolution already substituted the
    // default server name for SNI-less clients.
    let cert_name = if sni.is_empty() {
        ctx.snapshot
            .default_server_name()
            .unwrap_or_default()
            .to_string()
    } else {
        sni.clone()
    };
    let tls_config = server_config_for(&route, ctx.certs.as_ref(), &cert_name, false)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let tls_stream = match tokio::time::timeout_at(deadline, acceptor.accept(stream)).await {
        Err(_) => {
            info!(%peer, sni, "handshake deadline exceeded");
            return Ok(());
        }
        Ok(Err(e)) => {
            info!(%peer, sni, error = %e, "TLS handshake failed");
            return Ok(());
        }
        Ok(Ok(s)) => s,
    };
    let handshake_time = start.elapsed();

    let (alpn, peer_cert, peer_subject) = {
        let (_, conn) = tls_stream.get_ref();
        let alpn = conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).to_string());
        let peer_cert = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned();
        let peer_subject = peer_cert
            .as_ref()
            .map(|c| client_identities(c))
            .and_then(|ids| ids.first().cloned())
            .unwrap_or_else(|| "-".to_string());
        (alpn, peer_cert, peer_subject)
    };

    // Client certificate ACL, evaluated on the typed identity strings. The
    // peer learns nothing beyond the close.
    if route.client_auth.as_ref().is_some_and(|ca| ca.acl.is_some()) {
        let identities = peer_cert
            .as_ref()
            .map(|c| client_identities(c))
            .unwrap_or_default();
        if !route.acl_allows(&identities) {
            info!(%peer, sni, identity = peer_subject, "client certificate rejected by ACL");
            let mut tls_stream = tls_stream;
            let _ = tls_stream.shutdown().await;
            return Ok(());
        }
    }

    // Token-bucket admission for forwarded starts; the handler waits out
    // the refill rather than failing.
    route.conn_limit.until_ready().await;

    if route.mode.is_http_family() {
        return crate::http::serve_conn(ctx, tls_stream, peer, &sni, &route, alpn).await;
    }

    #[cfg(feature = "quic")]
    if route.mode == Mode::Quic {
        return crate::quic::bridge_stream_to_quic(ctx, tls_stream, peer, &sni, &route, start)
            .await;
    }

    // TCP and TLS modes: raw byte bridge.
    let dial_started = Instant::now();
    let upstream_alpn: Vec<Vec<u8>> = if route.mode.upstream_tls() {
        alpn.iter().map(|p| p.as_bytes().to_vec()).collect()
    } else {
        Vec::new()
    };
    let upstream = match dial_upstream(
        &route.forward,
        route.mode.upstream_tls(),
        upstream_alpn,
        peer,
        ctx.local_addr,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, sni, error = format!("{e:#}"), "no upstream available");
            let mut tls_stream = tls_stream;
            let _ = tls_stream.shutdown().await;
            return Ok(());
        }
    };
    let dial_time = dial_started.elapsed();

    info!(%peer, sni, identity = peer_subject, alpn = alpn.as_deref().unwrap_or("-"), "begin");
    let stats = forward_bidirectional(
        tls_stream,
        upstream,
        &route.forward_policy(),
        route.bw_group.clone(),
        ctx.cancel.clone(),
    )
    .await;
    info!(
        %peer,
        sni,
        rx_bytes = stats.client_to_server,
        tx_bytes = stats.server_to_client,
        handshake_ms = handshake_time.as_millis() as u64,
        dial_ms = dial_time.as_millis() as u64,
        total_ms = start.elapsed().as_millis() as u64,
        "end"
    );
    Ok(())
}

/// TLS passthrough: no local handshake. The ClientHello stays buffered in
/// the socket and flows to the upstream as the first forwarded bytes.
async fn passthrough(
    ctx: ConnContext,
    stream: TcpStream,
    peer: SocketAddr,
    sni: &str,
    route: &Arc<Route>,
    start: Instant,
) -> anyhow::Result<()> {
    route.conn_limit.until_ready().await;

    let dial_started = Instant::now();
    let upstream = dial_upstream(&route.forward, false, Vec::new(), peer, ctx.local_addr)
        .await
        .with_context(|| format!("passthrough upstream for {sni:?}"))?;
    let dial_time = dial_started.elapsed();

    info!(%peer, sni, mode = "passthrough", "begin");
    let stats = forward_bidirectional(
        stream,
        upstream,
        &route.forward_policy(),
        route.bw_group.clone(),
        ctx.cancel.clone(),
    )
    .await;
    info!(
        %peer,
        sni,
        mode = "passthrough",
        rx_bytes = stats.client_to_server,
        tx_bytes = stats.server_to_client,
        dial_ms = dial_time.as_millis() as u64,
        total_ms = start.elapsed().as_millis() as u64,
        "end"
    );
    Ok(())
}
