//! QUIC listener and QUIC upstreams
//!
//! The optional QUIC endpoint shares the TLS address. Routing works like
//! the TCP plane: the handshake's SNI and negotiated ALPN resolve a route
//! from the snapshot current at accept time. Per backend mode:
//!
//! - TCP/TLS: every incoming bidirectional stream is treated like an
//!   incoming connection and bridged to its own upstream.
//! - QUIC: one upstream QUIC connection per client connection; streams map
//!   one to one.
//! - HTTP family with h3: requests are terminated and forwarded through
//!   the HTTP request plane.
//!
//! Client certificates are not requested on the QUIC endpoint.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::{anyhow, Context as _};
use bytes::{Buf, Bytes};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::CertificateSource;
use crate::forward::forward_bidirectional;
use crate::handler::ConnContext;
use crate::http::{full_body, ProxyBody};
use crate::listener::OpenGuard;
use crate::reload::ReloadController;
use crate::routing::{ForwardParams, Mode, Route, Snapshot};
use crate::tls::upstream_client_config_with_versions;

/// A bidirectional QUIC stream presented as one duplex byte stream.
pub struct QuicBidi {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicBidi {
    pub fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        QuicBidi { send, recv }
    }
}

impl tokio::io::AsyncRead for QuicBidi {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for QuicBidi {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        tokio::io::AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// Certificate resolver that follows the published snapshot, so QUIC
/// handshakes pick up new names after a reload.
struct SnapshotCertResolver {
    controller: Arc<ReloadController>,
    certs: Arc<dyn CertificateSource>,
}

impl std::fmt::Debug for SnapshotCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SnapshotCertResolver")
    }
}

impl rustls::server::ResolvesServerCert for SnapshotCertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        let snapshot = self.controller.current();
        let name = match client_hello.server_name() {
            Some(sn) => sn.to_lowercase(),
            None => snapshot.default_server_name()?.to_string(),
        };
        snapshot.resolve(&name, None)?;
        self.certs.certified_key(&name).ok()
    }
}

/// Run the QUIC endpoint until cancelled.
pub async fn run_listener(
    addr: SocketAddr,
    controller: Arc<ReloadController>,
    certs: Arc<dyn CertificateSource>,
    num_open: Arc<AtomicUsize>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let snapshot = controller.current();

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let resolver = Arc::new(SnapshotCertResolver {
        controller: controller.clone(),
        certs: certs.clone(),
    });
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| anyhow!("failed to set protocol versions: {e}"))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    // Offer the union of every backend's protocols; per-route enforcement
    // happens at resolution. The set is fixed until restart.
    let mut alpn: Vec<Vec<u8>> = Vec::new();
    for route in snapshot.routes() {
        for proto in &route.alpn_protos {
            let p = proto.as_bytes().to_vec();
            if !alpn.contains(&p) {
                alpn.push(p);
            }
        }
    }
    tls.alpn_protocols = alpn;

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| anyhow!("failed to create QUIC server config: {e}"))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint = quinn::Endpoint::server(server_config, addr)
        .with_context(|| format!("failed to bind QUIC endpoint on {addr}"))?;
    info!(%addr, "accepting QUIC connections");

    loop {
        let incoming = tokio::select! {
            () = cancel.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else { break };
        let controller = controller.clone();
        let num_open = num_open.clone();
        let cancel = cancel.clone();
        let local_addr = addr;
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "QUIC handshake failed");
                    return;
                }
            };
            let snapshot = controller.current();
            let guard = OpenGuard::acquire(&num_open);
            if guard.count() > snapshot.max_open() {
                warn!(
                    peer = %connection.remote_address(),
                    num_open = guard.count(),
                    "too many open connections"
                );
                connection.close(1u32.into(), b"too many connections");
                return;
            }
            handle_quic_connection(connection, snapshot, cancel, local_addr).await;
        });
    }
    endpoint.close(0u32.into(), b"shutting down");
    info!("QUIC listener stopped");
    Ok(())
}

async fn handle_quic_connection(
    connection: quinn::Connection,
    snapshot: Arc<Snapshot>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
) {
    let peer = connection.remote_address();
    let (sni, alpn) = match handshake_fields(&connection) {
        Some(fields) => fields,
        None => {
            connection.close(2u32.into(), b"no handshake data");
            return;
        }
    };
    let offered: Vec<String> = alpn.clone().into_iter().collect();
    let Some(route) = snapshot.resolve_offered(&sni, &offered) else {
        info!(%peer, sni, "unexpected server name");
        connection.close(2u32.into(), b"unrecognized name");
        return;
    };
    if !route.ip_allowed(peer.ip()) {
        info!(%peer, sni, "connection denied by IP policy");
        connection.close(2u32.into(), b"unrecognized name");
        return;
    }

    match route.mode {
        Mode::Quic => bridge_quic_to_quic(connection, peer, &sni, &route, cancel).await,
        Mode::Tcp | Mode::Tls => {
            bridge_quic_streams(connection, peer, &sni, &route, cancel, local_addr).await;
        }
        _ if alpn.as_deref() == Some("h3") => {
            serve_h3(connection, snapshot.clone(), peer, &route, local_addr).await;
        }
        mode => {
            debug!(%peer, sni, ?mode, "no QUIC handler for backend mode");
            connection.close(2u32.into(), b"unsupported");
        }
    }
}

fn handshake_fields(connection: &quinn::Connection) -> Option<(String, Option<String>)> {
    let data = connection
        .handshake_data()?
        .downcast::<quinn::crypto::rustls::HandshakeData>()
        .ok()?;
    let sni = data.server_name.clone().unwrap_or_default().to_lowercase();
    let alpn = data
        .protocol
        .as_ref()
        .map(|p| String::from_utf8_lossy(p).to_string());
    Some((sni, alpn))
}

/// TCP/TLS backend on a QUIC transport: each incoming stream is an
/// independent logical connection.
async fn bridge_quic_streams(
    connection: quinn::Connection,
    peer: SocketAddr,
    sni: &str,
    route: &Arc<Route>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
) {
    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            s = connection.accept_bi() => s,
        };
        let (send, recv) = match stream {
            Ok(s) => s,
            Err(e) => {
                debug!(%peer, sni, error = %e, "QUIC connection ended");
                break;
            }
        };
        let route = route.clone();
        let cancel = cancel.clone();
        let sni = sni.to_string();
        tokio::spawn(async move {
            route.conn_limit.until_ready().await;
            let upstream = match crate::dial::dial_upstream(
                &route.forward,
                route.mode.upstream_tls(),
                Vec::new(),
                peer,
                local_addr,
            )
            .await
            {
                Ok(u) => u,
                Err(e) => {
                    warn!(%peer, sni, error = format!("{e:#}"), "no upstream available");
                    return;
                }
            };
            let stats = forward_bidirectional(
                QuicBidi::new(send, recv),
                upstream,
                &route.forward_policy(),
                route.bw_group.clone(),
                cancel,
            )
            .await;
            debug!(%peer, sni, rx = stats.client_to_server, tx = stats.server_to_client, "stream done");
        });
    }
}

/// QUIC backend on a QUIC transport: all streams forwarded over one
/// upstream connection.
async fn bridge_quic_to_quic(
    connection: quinn::Connection,
    peer: SocketAddr,
    sni: &str,
    route: &Arc<Route>,
    cancel: CancellationToken,
) {
    route.conn_limit.until_ready().await;
    let alpn: Vec<Vec<u8>> = route
        .alpn_protos
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    let upstream = match dial_quic(&route.forward, alpn).await {
        Ok(u) => u,
        Err(e) => {
            warn!(%peer, sni, error = format!("{e:#}"), "no QUIC upstream available");
            connection.close(3u32.into(), b"upstream unavailable");
            return;
        }
    };
    info!(%peer, sni, mode = "quic", "begin");
    loop {
        let stream = tokio::select! {
            () = cancel.cancelled() => break,
            s = connection.accept_bi() => s,
        };
        let (send, recv) = match stream {
            Ok(s) => s,
            Err(e) => {
                debug!(%peer, sni, error = %e, "QUIC connection ended");
                break;
            }
        };
        let (up_send, up_recv) = match upstream.open_bi().await {
            Ok(s) => s,
            Err(e) => {
                warn!(%peer, sni, error = %e, "upstream stream failed");
                break;
            }
        };
        let route = route.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            forward_bidirectional(
                QuicBidi::new(send, recv),
                QuicBidi::new(up_send, up_recv),
                &route.forward_policy(),
                route.bw_group.clone(),
                cancel,
            )
            .await;
        });
    }
    upstream.close(0u32.into(), b"done");
    info!(%peer, sni, mode = "quic", "end");
}

/// TLS client bridged onto a single upstream QUIC stream.
pub async fn bridge_stream_to_quic<S>(
    ctx: ConnContext,
    stream: S,
    peer: SocketAddr,
    sni: &str,
    route: &Arc<Route>,
    start: std::time::Instant,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let dial_started = std::time::Instant::now();
    let alpn: Vec<Vec<u8>> = route
        .alpn_protos
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();
    let upstream = dial_quic(&route.forward, alpn)
        .await
        .with_context(|| format!("QUIC upstream for {sni:?}"))?;
    let (send, recv) = upstream
        .open_bi()
        .await
        .context("failed to open upstream stream")?;
    let dial_time = dial_started.elapsed();

    info!(%peer, sni, mode = "quic", "begin");
    let stats = forward_bidirectional(
        stream,
        QuicBidi::new(send, recv),
        &route.forward_policy(),
        route.bw_group.clone(),
        ctx.cancel.clone(),
    )
    .await;
    info!(
        %peer,
        sni,
        mode = "quic",
        rx_bytes = stats.client_to_server,
        tx_bytes = stats.server_to_client,
        dial_ms = dial_time.as_millis() as u64,
        total_ms = start.elapsed().as_millis() as u64,
        "end"
    );
    Ok(())
}

/// Dial a QUIC upstream, one rotation over the address list.
async fn dial_quic(
    forward: &ForwardParams,
    alpn: Vec<Vec<u8>>,
) -> anyhow::Result<quinn::Connection> {
    let tls = upstream_client_config_with_versions(
        forward,
        alpn,
        &[&rustls::version::TLS13],
    )?;
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(
        Arc::try_unwrap(tls).unwrap_or_else(|arc| (*arc).clone()),
    )
    .map_err(|e| anyhow!("failed to create QUIC client config: {e}"))?;
    let client_config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap())
        .context("failed to create QUIC client endpoint")?;
    endpoint.set_default_client_config(client_config);

    let attempts = forward.addresses.len();
    let mut last_err = anyhow!("backend has no addresses");
    for _ in 0..attempts {
        let addr = forward
            .next_address()
            .ok_or_else(|| anyhow!("backend has no addresses"))?;
        match dial_quic_one(&endpoint, forward, &addr).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                debug!(address = %addr, error = %e, "QUIC dial failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn dial_quic_one(
    endpoint: &quinn::Endpoint,
    forward: &ForwardParams,
    addr: &str,
) -> anyhow::Result<quinn::Connection> {
    let socket_addr: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("resolve {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("resolve {addr}: no address"))?;
    let host = forward
        .forward_server_name
        .clone()
        .unwrap_or_else(|| addr.rsplit_once(':').map_or(addr, |(h, _)| h).to_string());
    let connecting = endpoint
        .connect(socket_addr, &host)
        .with_context(|| format!("connect {addr}"))?;
    tokio::time::timeout(forward.forward_timeout, connecting)
        .await
        .map_err(|_| anyhow!("connect {addr}: timeout"))?
        .with_context(|| format!("connect {addr}"))
}

/// Terminate h3 requests and feed them through the HTTP request plane.
async fn serve_h3(
    connection: quinn::Connection,
    snapshot: Arc<Snapshot>,
    peer: SocketAddr,
    route: &Arc<Route>,
    local_addr: SocketAddr,
) {
    let sni = route.server_names.first().cloned().unwrap_or_default();
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        match h3::server::Connection::new(h3_quinn::Connection::new(connection)).await {
            Ok(c) => c,
            Err(e) => {
                debug!(%peer, error = %e, "h3 connection setup failed");
                return;
            }
        };
    info!(%peer, sni, mode = "h3", "begin");
    loop {
        match h3_conn.accept().await {
            Ok(Some((req, mut stream))) => {
                let route = route.clone();
                let snapshot = snapshot.clone();
                tokio::spawn(async move {
                    route.conn_limit.until_ready().await;
                    let mut body = Vec::new();
                    while let Ok(Some(mut chunk)) = stream.recv_data().await {
                        while chunk.has_remaining() {
                            let bytes = chunk.chunk();
                            body.extend_from_slice(bytes);
                            let n = bytes.len();
                            chunk.advance(n);
                        }
                    }
                    let req = req.map(|()| Full::new(Bytes::from(body)));
                    let resp = crate::http::handle_h3_request(
                        route,
                        snapshot,
                        peer,
                        local_addr,
                        Some("h3".to_string()),
                        req,
                    )
                    .await;
                    let (parts, body) = resp.into_parts();
                    if stream
                        .send_response(Response::from_parts(parts, ()))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if let Ok(collected) = body.collect().await {
                        let bytes = collected.to_bytes();
                        if !bytes.is_empty() {
                            let _ = stream.send_data(bytes).await;
                        }
                    }
                    let _ = stream.finish().await;
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, error = %e, "h3 connection ended");
                break;
            }
        }
    }
    info!(%peer, sni, mode = "h3", "end");
}

/// Forward one HTTP request to an h3 upstream.
pub(crate) async fn proxy_h3_request<B>(
    forward: &ForwardParams,
    req: Request<B>,
) -> anyhow::Result<Response<ProxyBody>>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let e: Box<dyn std::error::Error + Send + Sync> = e.into();
            return Err(anyhow!("failed to read request body: {e}"));
        }
    };

    let connection = dial_quic(forward, vec![b"h3".to_vec()]).await?;
    let (mut driver, mut send_request) =
        h3::client::new(h3_quinn::Connection::new(connection))
            .await
            .map_err(|e| anyhow!("failed to create h3 client: {e}"))?;
    tokio::spawn(async move {
        let _ = futures_util::future::poll_fn(|cx| driver.poll_close(cx)).await;
    });

    let req = Request::from_parts(parts, ());
    let mut stream = send_request
        .send_request(req)
        .await
        .map_err(|e| anyhow!("h3 request failed: {e}"))?;
    if !body.is_empty() {
        stream
            .send_data(body)
            .await
            .map_err(|e| anyhow!("h3 body send failed: {e}"))?;
    }
    stream
        .finish()
        .await
        .map_err(|e| anyhow!("h3 finish failed: {e}"))?;

    let resp = stream
        .recv_response()
        .await
        .map_err(|e| anyhow!("h3 response failed: {e}"))?;
    let (parts, ()) = resp.into_parts();
    let mut response_body = Vec::new();
    while let Some(mut chunk) = stream
        .recv_data()
        .await
        .map_err(|e| anyhow!("h3 body receive failed: {e}"))?
    {
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            response_body.extend_from_slice(bytes);
            let n = bytes.len();
            chunk.advance(n);
        }
    }
    Ok(Response::from_parts(parts, full_body(response_body)))
}
