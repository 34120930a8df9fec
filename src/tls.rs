//! Per-connection TLS parameter selection
//!
//! Invoked mid-handshake with the parsed ClientHello: the handler resolves
//! the route, then this module builds the `rustls::ServerConfig` for exactly
//! that connection — the leaf from the certificate source, the backend's
//! ALPN list (h3 only on QUIC transports), and the client-certificate
//! verifier when the backend requires one. The client ACL is evaluated after
//! the handshake against the typed identity strings extracted here.
//!
//! A peer must not be able to tell an ACL-blocked name from a nonexistent
//! one: both paths end in the same `unrecognized_name` alert.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::cert::CertificateSource;
use crate::routing::{ForwardParams, Route};

/// TLS 1.2 and 1.3, the library defaults.
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] = rustls::DEFAULT_VERSIONS;

/// Build the server-side TLS configuration for one accepted connection.
pub fn server_config_for(
    route: &Route,
    certs: &dyn CertificateSource,
    server_name: &str,
    transport_is_quic: bool,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let certified = certs
        .certified_key(server_name)
        .with_context(|| format!("no certificate for {server_name:?}"))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| anyhow!("failed to set protocol versions: {e}"))?;

    let builder = match &route.client_auth {
        Some(ca) => {
            let roots = client_root_store(&ca.root_cas)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow!("failed to create client verifier: {e}"))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_cert_resolver(Arc::new(FixedCertResolver(certified)));
    config.alpn_protocols = route
        .alpn_protos
        .iter()
        .filter(|p| transport_is_quic || !crate::config::QUIC_ONLY_PROTOCOLS.contains(&p.as_str()))
        .map(|p| p.as_bytes().to_vec())
        .collect();
    Ok(Arc::new(config))
}

/// Client-side TLS configuration for dialing an upstream, honoring the
/// backend's forward trust roots and skip-verify flag.
pub fn upstream_client_config(
    forward: &ForwardParams,
    alpn: Vec<Vec<u8>>,
) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    upstream_client_config_with_versions(forward, alpn, PROTOCOL_VERSIONS)
}

/// Same as [`upstream_client_config`] with an explicit protocol set; the
/// QUIC dialer restricts itself to TLS 1.3.
pub fn upstream_client_config_with_versions(
    forward: &ForwardParams,
    alpn: Vec<Vec<u8>>,
    versions: &[&'static rustls::SupportedProtocolVersion],
) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| anyhow!("failed to set protocol versions: {e}"))?;

    let mut config = if forward.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        if forward.forward_root_cas.is_empty() {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                let _ = roots.add(cert);
            }
        } else {
            for cert in &forward.forward_root_cas {
                roots
                    .add(cert.clone())
                    .map_err(|e| anyhow!("failed to add forward root CA: {e}"))?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = alpn;
    Ok(Arc::new(config))
}

/// Trust anchors for client certificates: the backend's configured roots,
/// or the system roots when none are given.
fn client_root_store(cas: &[CertificateDer<'static>]) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    if cas.is_empty() {
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
    } else {
        for cert in cas {
            roots
                .add(cert.clone())
                .map_err(|e| anyhow!("failed to add client root CA: {e}"))?;
        }
    }
    Ok(roots)
}

/// Resolver that always serves the certificate selected for this connection.
#[derive(Debug)]
struct FixedCertResolver(Arc<rustls::sign::CertifiedKey>);

impl rustls::server::ResolvesServerCert for FixedCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Accept-anything verifier used with `insecureSkipVerify`.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerifier {
    fn new(provider: Arc<rustls::crypto::CryptoProvider>) -> Self {
        NoVerifier { provider }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Identity strings of a client certificate: the canonical Subject plus
/// every Subject Alternative Name, each prefixed with its type. These are
/// the values compared against the backend ACL.
pub fn client_identities(end_entity: &CertificateDer<'_>) -> Vec<String> {
    let mut identities = Vec::new();
    let Ok((_, cert)) = x509_parser::parse_x509_certificate(end_entity.as_ref()) else {
        return identities;
    };
    identities.push(format!("SUBJECT:{}", cert.subject()));
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for gn in &san.value.general_names {
            use x509_parser::extensions::GeneralName;
            match gn {
                GeneralName::RFC822Name(email) => identities.push(format!("EMAIL:{email}")),
                GeneralName::DNSName(dns) => identities.push(format!("DNS:{dns}")),
                GeneralName::URI(uri) => identities.push(format!("URI:{uri}")),
                _ => {}
            }
        }
    }
    identities
}

/// TLS alert record: fatal, unrecognized_name (112). Written raw before the
/// handshake has produced any response, so the peer cannot distinguish a
/// policy denial from an unknown name.
const UNRECOGNIZED_NAME_ALERT: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x70];

/// Best-effort delivery of the `unrecognized_name` alert.
pub async fn write_unrecognized_name_alert<W>(w: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let _ = w.write_all(&UNRECOGNIZED_NAME_ALERT).await;
    let _ = w.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertManager;
    use crate::config::Config;
    use crate::routing::Snapshot;

    fn test_route(yaml: &str) -> Arc<Route> {
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
        cfg.cache_dir = Some(std::env::temp_dir().join("tlsgate-test-cache"));
        cfg.check().expect("check");
        let snap = Snapshot::build(&cfg, |_| None).expect("build");
        snap.routes()[0].clone()
    }

    #[test]
    fn test_alpn_filtered_on_tcp_transport() {
        let route = test_route(
            r"
backends:
  - serverNames: [h3.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    alpnProtos: [h3, h2, http/1.1]
",
        );
        let dir = tempfile::tempdir().unwrap();
        let certs = CertManager::new(dir.path());
        let cfg = server_config_for(&route, &certs, "h3.example.com", false).unwrap();
        assert_eq!(cfg.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let cfg = server_config_for(&route, &certs, "h3.example.com", true).unwrap();
        assert_eq!(
            cfg.alpn_protocols,
            vec![b"h3".to_vec(), b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_alpn_agnostic_backend_offers_nothing() {
        let route = test_route(
            r"
backends:
  - serverNames: [any.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    alpnProtos: []
",
        );
        let dir = tempfile::tempdir().unwrap();
        let certs = CertManager::new(dir.path());
        let cfg = server_config_for(&route, &certs, "any.example.com", false).unwrap();
        assert!(cfg.alpn_protocols.is_empty());
    }

    #[test]
    fn test_client_identities_from_certificate() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["client.example.com".to_string()])
            .unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "alice");
        params
            .subject_alt_names
            .push(rcgen::SanType::Rfc822Name("alice@example.com".try_into().unwrap()));
        let cert = params.self_signed(&key).unwrap();

        let ids = client_identities(cert.der());
        assert!(ids.iter().any(|s| s.starts_with("SUBJECT:") && s.contains("CN=alice")), "{ids:?}");
        assert!(ids.contains(&"DNS:client.example.com".to_string()), "{ids:?}");
        assert!(ids.contains(&"EMAIL:alice@example.com".to_string()), "{ids:?}");
    }

    #[tokio::test]
    async fn test_unrecognized_name_alert_bytes() {
        let mut buf = Vec::new();
        write_unrecognized_name_alert(&mut buf).await;
        assert_eq!(buf, UNRECOGNIZED_NAME_ALERT);
        // alert(21), fatal(2), unrecognized_name(112)
        assert_eq!(buf[0], 21);
        assert_eq!(buf[5], 2);
        assert_eq!(buf[6], 112);
    }
}
