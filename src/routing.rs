//! Immutable routing snapshot
//!
//! A checked [`Config`](crate::config::Config) compiles into a [`Snapshot`]:
//! a read-only index from `(serverName, alpnProto)` to a shared
//! [`Route`], plus a by-name fallback for ALPN-agnostic backends. Snapshots
//! are content-addressed by a SHA-256 over the canonical YAML serialization
//! of the checked config; publishing an identical hash is a no-op.
//!
//! Handlers hold their `Arc<Route>` for the whole connection, so a snapshot
//! published later never disturbs in-flight traffic.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

use crate::bwlimit::BwGroup;
use crate::config::{self, Backend, BackendSso, ClientAuth, Config};

/// How the proxy communicates with a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Tcp,
    Tls,
    TlsPassthrough,
    Quic,
    Http,
    Https,
    Local,
    Console,
}

impl Mode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            config::MODE_TCP => Ok(Mode::Tcp),
            config::MODE_TLS => Ok(Mode::Tls),
            config::MODE_TLS_PASSTHROUGH => Ok(Mode::TlsPassthrough),
            config::MODE_QUIC => Ok(Mode::Quic),
            config::MODE_HTTP => Ok(Mode::Http),
            config::MODE_HTTPS => Ok(Mode::Https),
            config::MODE_LOCAL => Ok(Mode::Local),
            config::MODE_CONSOLE => Ok(Mode::Console),
            _ => bail!("unknown mode {s:?}"),
        }
    }

    /// Modes whose payload is parsed as HTTP by the proxy itself.
    pub fn is_http_family(self) -> bool {
        matches!(self, Mode::Http | Mode::Https | Mode::Local | Mode::Console)
    }

    /// Whether the upstream connection is TLS.
    pub fn upstream_tls(self) -> bool {
        matches!(self, Mode::Tls | Mode::Https)
    }
}

/// Client certificate policy compiled from the config.
pub struct RouteClientAuth {
    /// Allowed identities; `None` means any verified certificate.
    pub acl: Option<Vec<String>>,
    /// Trust anchors for the client certificate chain.
    pub root_cas: Vec<CertificateDer<'static>>,
    /// X-Forwarded-Client-Cert fields to inject in HTTP modes.
    pub add_client_cert_header: Vec<String>,
}

/// Upstream dialing parameters shared by backends and path overrides.
pub struct ForwardParams {
    pub addresses: Vec<String>,
    pub insecure_skip_verify: bool,
    pub forward_server_name: Option<String>,
    pub forward_root_cas: Vec<CertificateDer<'static>>,
    pub forward_timeout: Duration,
    pub proxy_protocol_version: u8,
    /// Round-robin cursor over `addresses`.
    pub next: Mutex<usize>,
}

impl ForwardParams {
    /// Advance the round-robin cursor and return the address to try.
    /// The cursor is shared by all concurrent dials against this target.
    pub fn next_address(&self) -> Option<String> {
        if self.addresses.is_empty() {
            return None;
        }
        let mut next = self.next.lock();
        let addr = self.addresses[*next].clone();
        *next = (*next + 1) % self.addresses.len();
        Some(addr)
    }
}

/// A path-prefix override on an HTTP/HTTPS backend, with its own upstream
/// pool and cursor.
pub struct RoutePathOverride {
    pub paths: Vec<String>,
    pub mode: Mode,
    pub backend_proto: Option<String>,
    pub forward: ForwardParams,
}

/// One backend compiled for the connection plane. Immutable once published;
/// the only interior mutability is the round-robin cursor and the rate
/// limiter state.
pub struct Route {
    pub server_names: Vec<String>,
    pub mode: Mode,
    /// ALPN protocols offered to clients. Empty means ALPN-agnostic.
    pub alpn_protos: Vec<String>,
    pub backend_proto: Option<String>,
    pub client_auth: Option<RouteClientAuth>,
    pub allow_ips: Option<Vec<ipnet::IpNet>>,
    pub deny_ips: Option<Vec<ipnet::IpNet>>,
    pub sso: Option<BackendSso>,
    /// Shared bandwidth group, when the backend names one.
    pub bw_group: Option<Arc<BwGroup>>,
    /// Admission limiter for forwarded connection starts.
    pub conn_limit: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    pub forward: ForwardParams,
    pub path_overrides: Vec<RoutePathOverride>,
    pub server_close_ends_connection: bool,
    pub client_close_ends_connection: bool,
    pub half_close_timeout: Duration,
}

impl Route {
    /// Evaluate the IP policy: deny list first, then allow list.
    pub fn ip_allowed(&self, addr: IpAddr) -> bool {
        if let Some(deny) = &self.deny_ips {
            if deny.iter().any(|n| n.contains(&addr)) {
                return false;
            }
        }
        if let Some(allow) = &self.allow_ips {
            return allow.iter().any(|n| n.contains(&addr));
        }
        true
    }

    /// Check a set of client identity strings against the ACL. With no ACL
    /// configured, any verified certificate passes. At least one identity
    /// must match exactly.
    pub fn acl_allows(&self, identities: &[String]) -> bool {
        match self.client_auth.as_ref().and_then(|ca| ca.acl.as_ref()) {
            None => true,
            Some(acl) => identities.iter().any(|id| acl.iter().any(|a| a == id)),
        }
    }

    fn compile(be: &Backend) -> anyhow::Result<Self> {
        let mode = Mode::parse(&be.mode)?;
        let client_auth = match &be.client_auth {
            None => None,
            Some(ca) => Some(compile_client_auth(ca)?),
        };
        let allow_ips = be
            .allow_ips
            .as_ref()
            .map(|cidrs| cidrs.iter().map(|c| config::parse_cidr(c)).collect())
            .transpose()?;
        let deny_ips = be
            .deny_ips
            .as_ref()
            .map(|cidrs| cidrs.iter().map(|c| config::parse_cidr(c)).collect())
            .transpose()?;
        let rate = be.forward_rate_limit.unwrap_or(5).max(1);
        let quota = Quota::per_second(
            NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN),
        );
        let path_overrides = be
            .path_overrides
            .iter()
            .map(|po| {
                Ok(RoutePathOverride {
                    paths: po.paths.clone(),
                    mode: Mode::parse(&po.mode)?,
                    backend_proto: po.backend_proto.clone(),
                    forward: ForwardParams {
                        addresses: po.addresses.clone(),
                        insecure_skip_verify: po.insecure_skip_verify,
                        forward_server_name: po.forward_server_name.clone(),
                        forward_root_cas: load_ca_list(&po.forward_root_cas)?,
                        forward_timeout: po
                            .forward_timeout
                            .unwrap_or(Duration::from_secs(30)),
                        proxy_protocol_version: config::parse_proxy_proto_version(
                            po.proxy_protocol_version.as_deref(),
                        )?,
                        next: Mutex::new(0),
                    },
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Route {
            server_names: be.server_names.clone(),
            mode,
            alpn_protos: be.alpn_protos.clone().unwrap_or_default(),
            backend_proto: be.backend_proto.clone(),
            client_auth,
            allow_ips,
            deny_ips,
            sso: be.sso.clone(),
            bw_group: None,
            conn_limit: RateLimiter::direct(quota),
            forward: ForwardParams {
                addresses: be.addresses.clone(),
                insecure_skip_verify: be.insecure_skip_verify,
                forward_server_name: be.forward_server_name.clone(),
                forward_root_cas: load_ca_list(&be.forward_root_cas)?,
                forward_timeout: be.forward_timeout.unwrap_or(Duration::from_secs(30)),
                proxy_protocol_version: config::parse_proxy_proto_version(
                    be.proxy_protocol_version.as_deref(),
                )?,
                next: Mutex::new(0),
            },
            path_overrides,
            server_close_ends_connection: be.server_close_ends_connection.unwrap_or(true),
            client_close_ends_connection: be.client_close_ends_connection.unwrap_or(false),
            half_close_timeout: be.half_close_timeout.unwrap_or(Duration::from_secs(60)),
        })
    }

    /// Select the path override matching a request path, first prefix wins.
    pub fn path_override_for(&self, path: &str) -> Option<&RoutePathOverride> {
        self.path_overrides
            .iter()
            .find(|po| po.paths.iter().any(|p| path.starts_with(p.as_str())))
    }

    /// The half-close policy the forwarder applies for this backend.
    pub fn forward_policy(&self) -> crate::forward::ForwardPolicy {
        crate::forward::ForwardPolicy {
            server_close_ends_connection: self.server_close_ends_connection,
            client_close_ends_connection: self.client_close_ends_connection,
            half_close_timeout: self.half_close_timeout,
        }
    }
}

fn compile_client_auth(ca: &ClientAuth) -> anyhow::Result<RouteClientAuth> {
    let mut root_cas = Vec::new();
    for n in &ca.root_cas {
        root_cas.extend(config::load_cert_pool(n)?);
    }
    Ok(RouteClientAuth {
        acl: ca.acl.clone(),
        root_cas,
        add_client_cert_header: ca
            .add_client_cert_header
            .iter()
            .map(|f| f.to_lowercase())
            .collect(),
    })
}

fn load_ca_list(sources: &[String]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut out = Vec::new();
    for n in sources {
        out.extend(config::load_cert_pool(n)?);
    }
    Ok(out)
}

/// The immutable routing table consulted by the connection plane.
pub struct Snapshot {
    /// SHA-256 of the canonical serialized config, hex-encoded.
    hash: String,
    by_key: HashMap<(String, String), Arc<Route>>,
    by_name: HashMap<String, Arc<Route>>,
    default_server_name: Option<String>,
    max_open: usize,
    tls_addr: String,
    http_addr: Option<String>,
    enable_quic: bool,
    cache_dir: std::path::PathBuf,
    routes: Vec<Arc<Route>>,
}

impl Snapshot {
    /// Compile a checked config into a snapshot. `bw_group_for` maps a group
    /// name to its shared token buckets; groups outlive individual snapshots
    /// so that reloads do not reset in-flight metering.
    pub fn build(
        cfg: &Config,
        bw_group_for: impl Fn(&str) -> Option<Arc<BwGroup>>,
    ) -> anyhow::Result<Arc<Self>> {
        let hash = content_hash(cfg)?;
        let mut by_key = HashMap::new();
        let mut by_name: HashMap<String, Arc<Route>> = HashMap::new();
        let mut routes = Vec::with_capacity(cfg.backends.len());
        for be in &cfg.backends {
            let mut route = Route::compile(be)?;
            if let Some(group) = &be.bw_limit {
                route.bw_group = Some(
                    bw_group_for(group)
                        .ok_or_else(|| anyhow!("bwLimit: undefined name {group:?}"))?,
                );
            }
            let route = Arc::new(route);
            routes.push(route.clone());
            for sn in &route.server_names {
                by_name.entry(sn.clone()).or_insert_with(|| route.clone());
                for proto in &route.alpn_protos {
                    by_key.insert((sn.clone(), proto.clone()), route.clone());
                }
            }
        }
        Ok(Arc::new(Snapshot {
            hash,
            by_key,
            by_name,
            default_server_name: cfg.default_server_name.clone(),
            max_open: cfg.max_open.unwrap_or(0),
            tls_addr: cfg.tls_addr.clone().unwrap_or_else(|| ":10443".to_string()),
            http_addr: cfg.http_addr.clone().filter(|a| !a.is_empty()),
            enable_quic: cfg.enable_quic.unwrap_or(false),
            cache_dir: cfg.cache_dir.clone().unwrap_or_default(),
            routes,
        }))
    }

    /// Resolve a connection to a backend.
    ///
    /// The exact `(serverName, alpnProto)` pair wins. Failing that, a
    /// backend bound to the name with ALPN disabled matches any protocol.
    /// A client that offers no ALPN matches the name's first-registered
    /// backend. Matching is exact ASCII, case-insensitive; names were
    /// IDNA-normalized at admission, never here.
    pub fn resolve(&self, server_name: &str, alpn: Option<&str>) -> Option<Arc<Route>> {
        match alpn {
            Some(proto) => self.resolve_offered(server_name, std::slice::from_ref(&proto)),
            None => self.resolve_offered::<&str>(server_name, &[]),
        }
    }

    /// Resolve against the full ALPN list a client offered, in the
    /// client's preference order.
    pub fn resolve_offered<P: AsRef<str>>(
        &self,
        server_name: &str,
        offered: &[P],
    ) -> Option<Arc<Route>> {
        let sn = if server_name.is_empty() {
            self.default_server_name.as_deref()?
        } else {
            server_name
        };
        let sn = sn.to_lowercase();
        if offered.is_empty() {
            return self.by_name.get(&sn).cloned();
        }
        for proto in offered {
            if let Some(route) = self
                .by_key
                .get(&(sn.clone(), proto.as_ref().to_string()))
            {
                return Some(route.clone());
            }
        }
        self.by_name
            .get(&sn)
            .filter(|r| r.alpn_protos.is_empty())
            .cloned()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn default_server_name(&self) -> Option<&str> {
        self.default_server_name.as_deref()
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    pub fn tls_addr(&self) -> &str {
        &self.tls_addr
    }

    pub fn http_addr(&self) -> Option<&str> {
        self.http_addr.as_deref()
    }

    pub fn enable_quic(&self) -> bool {
        self.enable_quic
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    /// All compiled routes, in declaration order.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Stable content hash of a checked config.
pub fn content_hash(cfg: &Config) -> anyhow::Result<String> {
    let serialized = serde_yaml::to_string(cfg)?;
    let digest = Sha256::digest(serialized.as_bytes());
    Ok(hex_string(&digest))
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(yaml: &str) -> Arc<Snapshot> {
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
        cfg.cache_dir = Some(std::env::temp_dir().join("tlsgate-test-cache"));
        cfg.check().expect("check");
        Snapshot::build(&cfg, |_| None).expect("build")
    }

    const TWO_BACKENDS: &str = r"
backends:
  - serverNames: [a.example.com, b.example.com]
    mode: tls
    addresses: ['10.0.0.1:443']
    alpnProtos: [h2, http/1.1]
  - serverNames: [raw.example.com]
    mode: tcp
    addresses: ['10.0.0.2:25']
    alpnProtos: []
";

    #[test]
    fn test_resolve_exact_key() {
        let snap = snapshot(TWO_BACKENDS);
        let route = snap.resolve("a.example.com", Some("h2")).unwrap();
        assert_eq!(route.mode, Mode::Tls);
        assert!(snap.resolve("a.example.com", Some("imap")).is_none());
        assert!(snap.resolve("nosuch.example.com", Some("h2")).is_none());
    }

    #[test]
    fn test_resolve_alpn_agnostic_backend() {
        let snap = snapshot(TWO_BACKENDS);
        let route = snap.resolve("raw.example.com", Some("smtp")).unwrap();
        assert_eq!(route.mode, Mode::Tcp);
        let route = snap.resolve("raw.example.com", None).unwrap();
        assert_eq!(route.mode, Mode::Tcp);
    }

    #[test]
    fn test_resolve_no_alpn_uses_name() {
        let snap = snapshot(TWO_BACKENDS);
        let route = snap.resolve("b.example.com", None).unwrap();
        assert_eq!(route.mode, Mode::Tls);
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let snap = snapshot(TWO_BACKENDS);
        assert!(snap.resolve("A.Example.COM", Some("h2")).is_some());
    }

    #[test]
    fn test_resolve_idna_ascii_lookup() {
        let snap = snapshot(
            r"
backends:
  - serverNames: ['bücher.example.com']
    mode: tcp
    addresses: ['10.0.0.1:443']
",
        );
        // Only the ASCII form is in the table.
        assert!(snap
            .resolve("xn--bcher-kva.example.com", Some("h2"))
            .is_some());
    }

    #[test]
    fn test_default_server_name() {
        let snap = snapshot(
            r"
defaultServerName: a.example.com
backends:
  - serverNames: [a.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
",
        );
        assert!(snap.resolve("", Some("h2")).is_some());
    }

    #[test]
    fn test_no_sni_without_default_fails() {
        let snap = snapshot(TWO_BACKENDS);
        assert!(snap.resolve("", Some("h2")).is_none());
    }

    #[test]
    fn test_hash_stable_and_sensitive() {
        let snap1 = snapshot(TWO_BACKENDS);
        let snap2 = snapshot(TWO_BACKENDS);
        assert_eq!(snap1.hash(), snap2.hash());
        let snap3 = snapshot(
            r"
backends:
  - serverNames: [other.example.com]
    mode: tcp
    addresses: ['10.0.0.9:443']
",
        );
        assert_ne!(snap1.hash(), snap3.hash());
    }

    #[test]
    fn test_ip_policy_deny_wins() {
        // An address matching both lists is denied.
        let snap = snapshot(
            r"
backends:
  - serverNames: [acl.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    allowIPs: ['192.168.0.0/16']
    denyIPs: ['192.168.1.0/24']
",
        );
        let route = snap.resolve("acl.example.com", None).unwrap();
        assert!(!route.ip_allowed("192.168.1.7".parse().unwrap()));
        assert!(route.ip_allowed("192.168.2.7".parse().unwrap()));
        assert!(!route.ip_allowed("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_allow_only_policy() {
        let snap = snapshot(
            r"
backends:
  - serverNames: [allow.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    allowIPs: ['127.0.0.0/8', '::1/128']
",
        );
        let route = snap.resolve("allow.example.com", None).unwrap();
        assert!(route.ip_allowed("127.0.0.1".parse().unwrap()));
        assert!(route.ip_allowed("::1".parse().unwrap()));
        assert!(!route.ip_allowed("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_acl_matching() {
        let snap = snapshot(
            r"
backends:
  - serverNames: [mtls.example.com]
    mode: tls
    addresses: ['10.0.0.1:443']
    clientAuth:
      acl: ['EMAIL:alice@example.com', 'SUBJECT:CN=bob']
",
        );
        let route = snap.resolve("mtls.example.com", None).unwrap();
        assert!(route.acl_allows(&["EMAIL:alice@example.com".to_string()]));
        assert!(route.acl_allows(&[
            "DNS:alice.example.com".to_string(),
            "SUBJECT:CN=bob".to_string()
        ]));
        assert!(!route.acl_allows(&["EMAIL:mallory@example.com".to_string()]));
        assert!(!route.acl_allows(&[]));
    }

    #[test]
    fn test_round_robin_cursor() {
        let snap = snapshot(
            r"
backends:
  - serverNames: [rr.example.com]
    mode: tcp
    addresses: ['10.0.0.1:1', '10.0.0.2:1', '10.0.0.3:1']
",
        );
        let route = snap.resolve("rr.example.com", None).unwrap();
        let seq: Vec<String> = (0..4).filter_map(|_| route.forward.next_address()).collect();
        assert_eq!(seq, ["10.0.0.1:1", "10.0.0.2:1", "10.0.0.3:1", "10.0.0.1:1"]);
    }

    #[test]
    fn test_path_override_first_prefix_wins() {
        let snap = snapshot(
            r"
backends:
  - serverNames: [po.example.com]
    mode: https
    addresses: ['10.0.0.1:443']
    pathOverrides:
      - paths: [/api/v2]
        addresses: ['10.0.1.1:443']
      - paths: [/api]
        addresses: ['10.0.1.2:443']
",
        );
        let route = snap.resolve("po.example.com", Some("h2")).unwrap();
        let po = route.path_override_for("/api/v2/users").unwrap();
        assert_eq!(po.forward.addresses, ["10.0.1.1:443"]);
        let po = route.path_override_for("/api/other").unwrap();
        assert_eq!(po.forward.addresses, ["10.0.1.2:443"]);
        assert!(route.path_override_for("/static").is_none());
    }
}
