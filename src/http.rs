//! HTTP request plane
//!
//! HTTP and HTTPS backends parse the decrypted stream as HTTP/1.1 or h2 and
//! forward each request upstream over a fresh round-robin connection, so
//! path overrides, PROXY protocol and per-request failover behave exactly
//! like the byte plane. LOCAL and CONSOLE backends are handled by the proxy
//! itself. The plain-HTTP listener answers ACME http-01 challenges and
//! redirects everything else to HTTPS.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cert::CertificateSource;
use crate::dial::dial_upstream;
use crate::handler::ConnContext;
use crate::routing::{ForwardParams, Mode, Route};
use crate::tls::client_identities;

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Per-request context captured at connection setup.
#[derive(Clone)]
struct RequestContext {
    route: Arc<Route>,
    snapshot: Arc<crate::routing::Snapshot>,
    peer: SocketAddr,
    local_addr: SocketAddr,
    client_alpn: Option<String>,
    peer_cert: Option<CertificateDer<'static>>,
}

/// Serve a handshaken TLS stream as HTTP for an HTTP-family backend.
pub async fn serve_conn(
    ctx: ConnContext,
    tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
    peer: SocketAddr,
    sni: &str,
    route: &Arc<Route>,
    client_alpn: Option<String>,
) -> anyhow::Result<()> {
    let peer_cert = {
        let (_, conn) = tls_stream.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
    };
    let rctx = RequestContext {
        route: route.clone(),
        snapshot: ctx.snapshot.clone(),
        peer,
        local_addr: ctx.local_addr,
        client_alpn,
        peer_cert,
    };

    info!(%peer, sni, mode = ?route.mode, "begin http");
    let service = service_fn(move |req: Request<Incoming>| {
        let rctx = rctx.clone();
        async move { Ok::<_, hyper::Error>(handle_request(rctx, req).await) }
    });
    let io = TokioIo::new(tls_stream);
    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::select! {
        () = ctx.cancel.cancelled() => {}
        res = conn => {
            if let Err(e) = res {
                debug!(%peer, sni, error = %e, "http connection ended");
            }
        }
    }
    info!(%peer, sni, "end http");
    Ok(())
}

/// Entry point for requests terminated on the QUIC listener.
#[cfg(feature = "quic")]
#[allow(clippy::too_many_arguments)]
pub(crate) async fn handle_h3_request(
    route: Arc<Route>,
    snapshot: Arc<crate::routing::Snapshot>,
    peer: SocketAddr,
    local_addr: SocketAddr,
    client_alpn: Option<String>,
    req: Request<Full<Bytes>>,
) -> Response<ProxyBody> {
    let rctx = RequestContext {
        route,
        snapshot,
        peer,
        local_addr,
        client_alpn,
        peer_cert: None,
    };
    handle_request(rctx, req).await
}

async fn handle_request<B>(rctx: RequestContext, req: Request<B>) -> Response<ProxyBody>
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match rctx.route.mode {
        Mode::Local => local_response(&req),
        Mode::Console => console_response(&rctx, &req),
        Mode::Http | Mode::Https => {
            let path = req.uri().path().to_string();
            let (forward, mode, backend_proto) = match rctx.route.path_override_for(&path) {
                Some(po) => (&po.forward, po.mode, po.backend_proto.as_ref()),
                None => (
                    &rctx.route.forward,
                    rctx.route.mode,
                    rctx.route.backend_proto.as_ref(),
                ),
            };
            match proxy_request(&rctx, forward, mode, backend_proto, req).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(peer = %rctx.peer, error = format!("{e:#}"), "upstream request failed");
                    text_response(StatusCode::BAD_GATEWAY, "bad gateway\n")
                }
            }
        }
        _ => text_response(StatusCode::INTERNAL_SERVER_ERROR, "misrouted connection\n"),
    }
}

/// LOCAL backends exist for handlers mounted by collaborators (OIDC
/// callbacks, JWKS export, PKI endpoints). With none mounted, everything is
/// a clean 404.
fn local_response<B>(req: &Request<B>) -> Response<ProxyBody> {
    debug!(path = req.uri().path(), "no local handler");
    text_response(StatusCode::NOT_FOUND, "not found\n")
}

/// The CONSOLE backend reports the routing state of the proxy itself.
fn console_response<B>(rctx: &RequestContext, req: &Request<B>) -> Response<ProxyBody> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
    }
    let mut page = String::new();
    page.push_str("tlsgate status\n\n");
    page.push_str(&format!("config: {}\n", rctx.snapshot.hash()));
    page.push_str(&format!("maxOpen: {}\n\nbackends:\n", rctx.snapshot.max_open()));
    for route in rctx.snapshot.routes() {
        page.push_str(&format!(
            "  {} mode={:?} alpn={:?} addresses={:?}\n",
            route.server_names.join(","),
            route.mode,
            route.alpn_protos,
            route.forward.addresses,
        ));
    }
    text_response(StatusCode::OK, &page)
}

/// Forward one request upstream and relay the response.
async fn proxy_request<B>(
    rctx: &RequestContext,
    forward: &ForwardParams,
    mode: Mode,
    backend_proto: Option<&String>,
    req: Request<B>,
) -> anyhow::Result<Response<ProxyBody>>
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Empty string means "whatever the client negotiated".
    let proto = match backend_proto {
        None => "http/1.1".to_string(),
        Some(p) if p.is_empty() => rctx
            .client_alpn
            .clone()
            .unwrap_or_else(|| "http/1.1".to_string()),
        Some(p) => p.clone(),
    };

    let scheme = if mode == Mode::Https { "https" } else { "http" };
    let req = prepare_upstream_request(rctx, req, scheme)?;

    if proto == "h3" {
        #[cfg(feature = "quic")]
        {
            return crate::quic::proxy_h3_request(forward, req).await;
        }
        #[cfg(not(feature = "quic"))]
        anyhow::bail!("h3 backend protocol requires QUIC support");
    }

    let use_tls = mode == Mode::Https;
    let alpn = if use_tls {
        vec![proto.as_bytes().to_vec()]
    } else {
        Vec::new()
    };
    let stream = dial_upstream(forward, use_tls, alpn, rctx.peer, rctx.local_addr)
        .await
        .context("upstream dial")?;
    let io = TokioIo::new(stream);

    if proto == "h2" {
        let (mut sender, conn) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                .await
                .context("h2 handshake")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream h2 connection ended");
            }
        });
        let resp = sender.send_request(req).await.context("h2 request")?;
        Ok(resp.map(|b| b.boxed()))
    } else {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("http/1.1 handshake")?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "upstream http/1.1 connection ended");
            }
        });
        let resp = sender.send_request(req).await.context("http/1.1 request")?;
        Ok(resp.map(|b| b.boxed()))
    }
}

const HOP_BY_HOP: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Rewrite the incoming request for the upstream: strip hop-by-hop headers,
/// record the caller, and attach the client certificate header when the
/// backend asks for it.
fn prepare_upstream_request<B>(
    rctx: &RequestContext,
    req: Request<B>,
    scheme: &str,
) -> anyhow::Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "localhost".to_string());
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |p| p.as_str())
        .to_string();
    parts.uri = Uri::builder()
        .scheme(scheme)
        .authority(authority.clone())
        .path_and_query(path_and_query)
        .build()
        .context("rebuild upstream uri")?;
    if !parts.headers.contains_key(header::HOST) {
        if let Ok(v) = HeaderValue::from_str(&authority) {
            parts.headers.insert(header::HOST, v);
        }
    }

    for h in HOP_BY_HOP {
        parts.headers.remove(h);
    }

    if let Ok(v) = HeaderValue::from_str(&rctx.peer.ip().to_string()) {
        parts.headers.append("x-forwarded-for", v);
    }
    parts
        .headers
        .insert("x-forwarded-proto", HeaderValue::from_static("https"));

    if let Some(ca) = &rctx.route.client_auth {
        if !ca.add_client_cert_header.is_empty() {
            if let Some(cert) = &rctx.peer_cert {
                let value = xfcc_header(&ca.add_client_cert_header, cert);
                if let Ok(v) = HeaderValue::from_str(&value) {
                    parts.headers.insert("x-forwarded-client-cert", v);
                }
            }
        }
    }

    Ok(Request::from_parts(parts, body))
}

/// Build the X-Forwarded-Client-Cert value from the configured fields.
fn xfcc_header(fields: &[String], cert: &CertificateDer<'_>) -> String {
    let identities = client_identities(cert);
    let mut parts = Vec::new();
    for field in fields {
        match field.as_str() {
            "hash" => {
                let digest = Sha256::digest(cert.as_ref());
                let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
                parts.push(format!("Hash={hex}"));
            }
            "cert" | "chain" => {
                parts.push(format!("Cert=\"{}\"", percent_encode(&pem_encode(cert))));
            }
            "subject" => {
                if let Some(subject) = identities
                    .iter()
                    .find_map(|id| id.strip_prefix("SUBJECT:"))
                {
                    parts.push(format!("Subject=\"{subject}\""));
                }
            }
            "uri" => {
                for uri in identities.iter().filter_map(|id| id.strip_prefix("URI:")) {
                    parts.push(format!("URI={uri}"));
                }
            }
            "dns" => {
                for dns in identities.iter().filter_map(|id| id.strip_prefix("DNS:")) {
                    parts.push(format!("DNS={dns}"));
                }
            }
            _ => {}
        }
    }
    parts.join(";")
}

fn pem_encode(cert: &CertificateDer<'_>) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(cert.as_ref());
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

/// Percent-encode everything a header value cannot carry verbatim.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// The ACME challenge path prefix served on the plain-HTTP listener.
const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Serve the optional plain-HTTP listener: http-01 challenge tokens from
/// the certificate source, HTTPS redirects for everything else.
pub async fn run_challenge_listener(
    listener: TcpListener,
    certs: Arc<dyn CertificateSource>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "http accept failed");
                continue;
            }
        };
        let certs = certs.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let certs = certs.clone();
                async move { Ok::<_, hyper::Error>(challenge_response(certs.as_ref(), &req)) }
            });
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            tokio::select! {
                () = cancel.cancelled() => {}
                res = conn => {
                    if let Err(e) = res {
                        debug!(%peer, error = %e, "http connection ended");
                    }
                }
            }
        });
    }
}

fn challenge_response(
    certs: &dyn CertificateSource,
    req: &Request<Incoming>,
) -> Response<ProxyBody> {
    let path = req.uri().path();
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        if let Some(body) = certs.http01_response(token) {
            return text_response(StatusCode::OK, &body);
        }
        return text_response(StatusCode::NOT_FOUND, "unknown token\n");
    }
    // Everything else is sent to the TLS side.
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    let location = format!("https://{host}{path}");
    let mut resp = Response::new(full_body(Bytes::new()));
    *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(v) = HeaderValue::from_str(&location) {
        resp.headers_mut().insert(header::LOCATION, v);
    }
    resp
}
