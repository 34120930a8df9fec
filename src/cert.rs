//! Certificate source for the TLS listener
//!
//! The connection plane asks a [`CertificateSource`] for the leaf keyed by
//! the (IDNA-normalized) server name; everything else about certificate
//! lifecycle lives behind that trait. The built-in [`CertManager`] issues
//! self-signed certificates with `rcgen`, persists them under `cacheDir`
//! (created 0700, key files 0600) and reissues when a cached certificate is
//! no longer valid. An ACME client satisfies the same trait; the optional
//! plain-HTTP listener routes `/.well-known/acme-challenge/` tokens to
//! [`CertificateSource::http01_response`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, info};

/// What the connection plane needs from a certificate provider.
pub trait CertificateSource: Send + Sync {
    /// The leaf certificate and signing key for a server name.
    fn certified_key(&self, server_name: &str) -> anyhow::Result<Arc<CertifiedKey>>;

    /// Response body for an ACME http-01 challenge token, when this source
    /// is an ACME client with a pending authorization.
    fn http01_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Disk-cached self-signed certificate issuer.
pub struct CertManager {
    cache_dir: PathBuf,
    /// Validity of newly issued certificates, in days.
    validity_days: i64,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl CertManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        CertManager {
            cache_dir: cache_dir.into(),
            validity_days: 90,
            cache: DashMap::new(),
        }
    }

    fn cert_paths(&self, server_name: &str) -> (PathBuf, PathBuf) {
        let dir = self.cache_dir.join(server_name);
        (dir.join("cert.pem"), dir.join("key.pem"))
    }

    fn load_cached(&self, server_name: &str) -> anyhow::Result<Option<Arc<CertifiedKey>>> {
        let (cert_path, key_path) = self.cert_paths(server_name);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let cert_pem = std::fs::read(&cert_path)
            .with_context(|| format!("failed to read {}", cert_path.display()))?;
        let key_pem = std::fs::read(&key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
        let Some(leaf) = certs.first() else {
            return Ok(None);
        };
        if !cert_is_valid(leaf) {
            debug!(server_name, "cached certificate expired, reissuing");
            return Ok(None);
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
            .ok_or_else(|| anyhow!("no private key in {}", key_path.display()))?;
        Ok(Some(build_certified_key(certs, key)?))
    }

    fn issue(&self, server_name: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        info!(server_name, "issuing self-signed certificate");
        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(vec![server_name.to_string()])?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, server_name);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::days(self.validity_days);
        let cert = params.self_signed(&key_pair)?;

        let (cert_path, key_path) = self.cert_paths(server_name);
        let dir = cert_path.parent().unwrap_or(Path::new("."));
        create_private_dir(dir)?;
        write_private_file(&cert_path, cert.pem().as_bytes())?;
        write_private_file(&key_path, key_pair.serialize_pem().as_bytes())?;

        let der = cert.der().clone();
        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| anyhow!("bad generated key: {e}"))?;
        build_certified_key(vec![der], key)
    }
}

impl CertificateSource for CertManager {
    fn certified_key(&self, server_name: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if let Some(ck) = self.cache.get(server_name) {
            return Ok(ck.clone());
        }
        let ck = match self.load_cached(server_name)? {
            Some(ck) => ck,
            None => self.issue(server_name)?,
        };
        self.cache.insert(server_name.to_string(), ck.clone());
        Ok(ck)
    }
}

fn build_certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow!("unsupported private key: {e}"))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn cert_is_valid(der: &CertificateDer<'_>) -> bool {
    match x509_parser::parse_x509_certificate(der.as_ref()) {
        Ok((_, cert)) => cert.validity().is_valid(),
        Err(_) => false,
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("failed to create {}", dir.display()))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn write_private_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    f.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        let ck1 = mgr.certified_key("a.example.com").unwrap();
        let ck2 = mgr.certified_key("a.example.com").unwrap();
        assert!(Arc::ptr_eq(&ck1, &ck2));
        assert!(!ck1.cert.is_empty());

        let cert_path = dir.path().join("a.example.com").join("cert.pem");
        let key_path = dir.path().join("a.example.com").join("key.pem");
        assert!(cert_path.exists());
        assert!(key_path.exists());
    }

    #[test]
    fn test_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let issued = CertManager::new(dir.path())
            .certified_key("b.example.com")
            .unwrap();
        // A fresh manager picks the persisted pair back up instead of
        // issuing a new one.
        let reloaded = CertManager::new(dir.path())
            .certified_key("b.example.com")
            .unwrap();
        assert_eq!(issued.cert[0].as_ref(), reloaded.cert[0].as_ref());
    }

    #[test]
    fn test_certificate_covers_name() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        let ck = mgr.certified_key("c.example.com").unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(ck.cert[0].as_ref()).unwrap();
        let sans: Vec<String> = parsed
            .subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|gn| match gn {
                        x509_parser::extensions::GeneralName::DNSName(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        assert!(sans.contains(&"c.example.com".to_string()));
        assert!(parsed.validity().is_valid());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mgr = CertManager::new(dir.path());
        mgr.certified_key("d.example.com").unwrap();
        let meta = std::fs::metadata(dir.path().join("d.example.com").join("key.pem")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
