//! Upstream dialing with round-robin failover
//!
//! The backend's address list is walked with a shared cursor: every dial
//! attempt advances it, concurrent dials included, so successive
//! connections spread over the pool. A failed attempt moves on to the next
//! address; after one full rotation the dial fails. The PROXY protocol
//! header, when configured, is written on the raw TCP connection before
//! anything else, including the upstream TLS handshake.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::proxy_protocol;
use crate::routing::ForwardParams;
use crate::tls::upstream_client_config;

/// Any bidirectional byte stream the proxy can forward to.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

/// Keepalive used on upstream TCP connections.
const UPSTREAM_KEEPALIVE: Duration = Duration::from_secs(30);

/// Dial the backend, trying each address at most once.
///
/// `use_tls` wraps the connection in TLS using the backend's forward
/// parameters; `alpn` is offered upstream in that case. `client_addr` and
/// `local_addr` feed the PROXY header when the backend enables it.
pub async fn dial_upstream(
    forward: &ForwardParams,
    use_tls: bool,
    alpn: Vec<Vec<u8>>,
    client_addr: SocketAddr,
    local_addr: SocketAddr,
) -> anyhow::Result<BoxedStream> {
    let attempts = forward.addresses.len();
    let mut last_err = anyhow!("backend has no addresses");
    for _ in 0..attempts {
        let addr = forward
            .next_address()
            .ok_or_else(|| anyhow!("backend has no addresses"))?;
        match dial_one(forward, &addr, use_tls, &alpn, client_addr, local_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(address = %addr, error = %e, "upstream dial failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

async fn dial_one(
    forward: &ForwardParams,
    addr: &str,
    use_tls: bool,
    alpn: &[Vec<u8>],
    client_addr: SocketAddr,
    local_addr: SocketAddr,
) -> anyhow::Result<BoxedStream> {
    let tcp = tokio::time::timeout(forward.forward_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow!("dial {addr}: timeout"))?
        .with_context(|| format!("dial {addr}"))?;
    set_keepalive(&tcp, UPSTREAM_KEEPALIVE);

    let mut tcp = tcp;
    let header = proxy_protocol::encode(
        forward.proxy_protocol_version,
        client_addr,
        local_addr,
    );
    if !header.is_empty() {
        tcp.write_all(&header)
            .await
            .with_context(|| format!("proxy protocol header to {addr}"))?;
    }

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let sni = forward
        .forward_server_name
        .clone()
        .unwrap_or_else(|| host_of(addr).to_string());
    let server_name =
        ServerName::try_from(sni.clone()).map_err(|e| anyhow!("invalid server name {sni:?}: {e}"))?;
    let config = upstream_client_config(forward, alpn.to_vec())?;
    let connector = TlsConnector::from(config);
    let tls = tokio::time::timeout(forward.forward_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| anyhow!("tls handshake with {addr}: timeout"))?
        .with_context(|| format!("tls handshake with {addr}"))?;
    Ok(Box::new(tls))
}

/// Host portion of a `host:port` address.
fn host_of(addr: &str) -> &str {
    if let Some(stripped) = addr.strip_prefix('[') {
        // [v6]:port
        return stripped.split(']').next().unwrap_or(addr);
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| host)
}

/// Configure TCP keepalive on a connection.
pub fn set_keepalive(stream: &TcpStream, interval: Duration) {
    let sock = socket2::SockRef::from(stream);
    let ka = socket2::TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    if let Err(e) = sock.set_tcp_keepalive(&ka) {
        debug!(error = %e, "failed to set TCP keepalive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn params(addresses: &[&str]) -> ForwardParams {
        ForwardParams {
            addresses: addresses.iter().map(|s| (*s).to_string()).collect(),
            insecure_skip_verify: false,
            forward_server_name: None,
            forward_root_cas: Vec::new(),
            forward_timeout: Duration::from_millis(500),
            proxy_protocol_version: 0,
            next: Mutex::new(0),
        }
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:443".parse().unwrap(),
        )
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(host_of("backend.example.com:8443"), "backend.example.com");
        assert_eq!(host_of("[2001:db8::1]:443"), "2001:db8::1");
    }

    #[tokio::test]
    async fn test_failover_reaches_live_address() {
        // Two unreachable addresses, then a live one. The first dial
        // walks the list in order.
        let live = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap().to_string();
        let fwd = params(&["127.0.0.1:1", "127.0.0.1:1", &live_addr]);
        let (client_addr, local_addr) = addrs();

        let accept = tokio::spawn(async move { live.accept().await.unwrap() });
        dial_upstream(&fwd, false, Vec::new(), client_addr, local_addr)
            .await
            .unwrap();
        accept.await.unwrap();
        // Cursor wrapped: the next dial starts at the first address again.
        assert_eq!(*fwd.next.lock(), 0);
    }

    #[tokio::test]
    async fn test_one_full_rotation_then_error() {
        // With every address unreachable, the dial stops after trying
        // each address exactly once.
        let fwd = params(&["127.0.0.1:1", "127.0.0.1:1", "127.0.0.1:1"]);
        let (client_addr, local_addr) = addrs();
        let err = dial_upstream(&fwd, false, Vec::new(), client_addr, local_addr)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dial"), "{err}");
        assert_eq!(*fwd.next.lock(), 0, "exactly one rotation");
    }

    #[tokio::test]
    async fn test_proxy_protocol_header_precedes_data() {
        use tokio::io::AsyncReadExt;

        // The upstream sees the v2 header carrying the client endpoint
        // as the very first bytes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut fwd = params(&[&addr]);
        fwd.proxy_protocol_version = 2;
        let client_addr: SocketAddr = "192.0.2.7:55555".parse().unwrap();
        let local_addr: SocketAddr = "192.0.2.1:443".parse().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut hdr = [0u8; 28];
            conn.read_exact(&mut hdr).await.unwrap();
            let mut payload = [0u8; 5];
            conn.read_exact(&mut payload).await.unwrap();
            (hdr, payload)
        });

        let mut stream = dial_upstream(&fwd, false, Vec::new(), client_addr, local_addr)
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();

        let (hdr, payload) = server.await.unwrap();
        assert_eq!(&hdr[..12], &proxy_protocol::encode_v2(client_addr, local_addr)[..12]);
        assert_eq!(&hdr[16..20], &[192, 0, 2, 7]);
        assert_eq!(u16::from_be_bytes([hdr[24], hdr[25]]), 55555);
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn test_round_robin_advances_across_dials() {
        let l1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let l2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a1 = l1.local_addr().unwrap();
        let a2 = l2.local_addr().unwrap();
        let fwd = params(&[&a1.to_string(), &a2.to_string()]);
        let (client_addr, local_addr) = addrs();

        let counts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c1 = counts.clone();
        tokio::spawn(async move {
            loop {
                if l1.accept().await.is_ok() {
                    c1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });
        let c2 = counts.clone();
        let second = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let s2 = second.clone();
        tokio::spawn(async move {
            loop {
                if l2.accept().await.is_ok() {
                    c2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    s2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });

        for _ in 0..4 {
            dial_upstream(&fwd, false, Vec::new(), client_addr, local_addr)
                .await
                .unwrap();
        }
        // Give the accept loops a moment to record.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counts.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(second.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
