//! Declarative YAML configuration with validation and canonicalization
//!
//! The configuration document is parsed with serde, then `Config::check()`
//! normalizes it (mode names, IDNA2008-ASCII server names), applies defaults,
//! and rejects invalid combinations. Only a checked config can be compiled
//! into a routing snapshot. Validation errors carry the index path of the
//! offending field, e.g. `backend[3].pathOverrides[1].mode`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

/// Backend modes. The YAML value is case-insensitive; `PLAINTEXT` and the
/// empty string are aliases for `TCP`.
pub const MODE_TCP: &str = "TCP";
pub const MODE_TLS: &str = "TLS";
pub const MODE_TLS_PASSTHROUGH: &str = "TLSPASSTHROUGH";
pub const MODE_QUIC: &str = "QUIC";
pub const MODE_HTTP: &str = "HTTP";
pub const MODE_HTTPS: &str = "HTTPS";
pub const MODE_LOCAL: &str = "LOCAL";
pub const MODE_CONSOLE: &str = "CONSOLE";

const VALID_MODES: &[&str] = &[
    MODE_TCP,
    MODE_TLS,
    MODE_TLS_PASSTHROUGH,
    MODE_QUIC,
    MODE_HTTP,
    MODE_HTTPS,
    MODE_LOCAL,
    MODE_CONSOLE,
];

/// Valid fields for the X-Forwarded-Client-Cert header.
const VALID_XFCC_FIELDS: &[&str] = &["cert", "chain", "hash", "subject", "uri", "dns"];

/// ALPN identifiers that only make sense on a QUIC transport.
pub const QUIC_ONLY_PROTOCOLS: &[&str] = &["h3"];

fn default_alpn_protos() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

fn default_alpn_protos_plus_h3() -> Vec<String> {
    vec!["h3".to_string(), "h2".to_string(), "http/1.1".to_string()]
}

/// Whether this build carries the QUIC listener.
pub const QUIC_IS_ENABLED: bool = cfg!(feature = "quic");

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
    /// YAML anchor holder. Parsed and discarded; carries no semantics.
    #[serde(skip_serializing)]
    pub definitions: Option<serde_yaml::Value>,
    /// Optional plain-HTTP listener, used for the ACME http-01 challenge and
    /// HTTPS redirects.
    pub http_addr: Option<String>,
    /// Address of the primary TLS listener.
    pub tls_addr: Option<String>,
    /// Whether the QUIC listener should be enabled. Defaults to true when the
    /// binary is built with QUIC support.
    #[serde(rename = "enableQUIC")]
    pub enable_quic: Option<bool>,
    /// Directory where the certificate manager stores its state. Created
    /// with mode 0700 when missing.
    pub cache_dir: Option<PathBuf>,
    /// Server name assumed when the TLS client does not send SNI.
    pub default_server_name: Option<String>,
    /// Maximum number of open incoming connections.
    pub max_open: Option<usize>,
    /// Email address passed to the ACME account.
    pub email: Option<String>,
    /// Acceptance of the CA's terms of service, passed to ACME.
    #[serde(rename = "acceptTOS")]
    pub accept_tos: bool,
    /// Service backends.
    pub backends: Vec<Backend>,
    /// OIDC identity providers.
    pub oidc: Vec<OidcProvider>,
    /// SAML identity providers.
    pub saml: Vec<SamlProvider>,
    /// Passkey providers, bootstrapped from another identity provider.
    pub passkey: Vec<PasskeyProvider>,
    /// Locally managed certificate authorities.
    pub pki: Vec<Pki>,
    /// Named bandwidth limit groups shared between backends.
    pub bw_limits: Vec<BwLimit>,
}

/// A named bandwidth limit group. The limits are shared by every backend
/// that references the group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BwLimit {
    pub name: String,
    /// Ingress limit, bytes per second.
    #[serde(default)]
    pub ingress: f64,
    /// Egress limit, bytes per second.
    #[serde(default)]
    pub egress: f64,
}

/// One service backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Backend {
    /// All the server names for this service, e.g. example.com,
    /// www.example.com. Internationalized names are converted to ASCII with
    /// the IDNA2008 lookup standard.
    pub server_names: Vec<String>,
    /// How the proxy communicates with the backend. See the mode constants.
    pub mode: String,
    /// Server addresses requests are forwarded to, round robin.
    pub addresses: Vec<String>,
    /// ALPN protocols offered to the client. `None` selects the defaults;
    /// an explicitly empty list disables ALPN and makes the backend
    /// ALPN-agnostic.
    pub alpn_protos: Option<Vec<String>>,
    /// Protocol used when forwarding HTTPS requests to the backend. Only
    /// valid in HTTP and HTTPS modes. An explicitly empty string means
    /// "same protocol the client negotiated".
    pub backend_proto: Option<String>,
    /// TLS client identity requirements.
    pub client_auth: Option<ClientAuth>,
    /// CIDR allow list. Evaluated after `deny_ips`.
    #[serde(rename = "allowIPs")]
    pub allow_ips: Option<Vec<String>>,
    /// CIDR deny list. Evaluated before `allow_ips`.
    #[serde(rename = "denyIPs")]
    pub deny_ips: Option<Vec<String>>,
    /// User authentication policy. The providers themselves are external
    /// collaborators; the proxy stores the validated descriptor.
    pub sso: Option<BackendSso>,
    /// Name of the bandwidth limit group for this backend.
    pub bw_limit: Option<String>,
    /// Disables verification of the backend server's certificate.
    pub insecure_skip_verify: bool,
    /// How many connections per second may be forwarded to this backend.
    pub forward_rate_limit: Option<u32>,
    /// ServerName sent in the TLS handshake with the backend, also used to
    /// verify the server identity.
    pub forward_server_name: Option<String>,
    /// Trust roots for the backend connection: PKI names, file names, or
    /// inline PEM.
    #[serde(rename = "forwardRootCAs")]
    pub forward_root_cas: Vec<String>,
    /// Connection timeout to backend servers; with multiple addresses, how
    /// long to wait before trying the next one.
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Option<Duration>,
    /// Per-path-prefix parameter overrides. HTTP/HTTPS modes only.
    pub path_overrides: Vec<PathOverride>,
    /// PROXY protocol version to emit: "", "v1", or "v2".
    pub proxy_protocol_version: Option<String>,
    /// Close the whole connection when the server closes its end.
    /// Default true, except in QUIC mode.
    pub server_close_ends_connection: Option<bool>,
    /// Close the whole connection when the client closes its end.
    /// Default false.
    pub client_close_ends_connection: Option<bool>,
    /// How long to keep a half-closed connection open with no traffic.
    #[serde(with = "humantime_serde")]
    pub half_close_timeout: Option<Duration>,
}

/// TLS client authentication and authorization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ClientAuth {
    /// Allowed client identities: Subject or typed Subject Alternative Name
    /// strings, e.g. `SUBJECT:CN=alice` or `EMAIL:alice@example.com`.
    /// `None` allows any verified certificate; an empty list allows nobody.
    pub acl: Option<Vec<String>>,
    /// Trust roots for client certificates: PKI names, file names, or
    /// inline PEM.
    #[serde(rename = "rootCAs")]
    pub root_cas: Vec<String>,
    /// X-Forwarded-Client-Cert fields added to forwarded requests in HTTP
    /// and HTTPS modes. Valid values: cert, chain, hash, subject, uri, dns.
    pub add_client_cert_header: Vec<String>,
}

/// SSO policy for a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BackendSso {
    /// Name of an identity provider defined at the top level.
    pub provider: String,
    /// Duration after which the user must authenticate again.
    #[serde(with = "humantime_serde")]
    pub force_re_auth: Option<Duration>,
    /// Email addresses and/or `@domain` suffixes allowed to connect.
    pub acl: Option<Vec<String>>,
    /// Path prefixes the policy applies to. Empty means all paths.
    pub paths: Vec<String>,
    /// Set the x-tlsgate-user-id header with the authenticated email.
    pub set_user_id_header: bool,
    /// Local OpenID provider configuration for this backend.
    #[serde(rename = "localOIDCServer")]
    pub local_oidc_server: Option<LocalOidcServer>,
}

/// A local OpenID provider attached to a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LocalOidcServer {
    pub path_prefix: Option<String>,
    pub clients: Vec<LocalOidcClient>,
    pub rewrite_rules: Vec<LocalOidcRewriteRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LocalOidcClient {
    pub id: String,
    pub secret: String,
    #[serde(rename = "redirectUri")]
    pub redirect_uris: Vec<String>,
}

/// Rewrites existing claims or creates new claims from existing ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct LocalOidcRewriteRule {
    pub input_claim: String,
    pub output_claim: String,
    pub regex: String,
    pub value: String,
}

/// Per-path-prefix backend parameter overrides. Paths are matched by prefix
/// in the order they are listed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PathOverride {
    pub paths: Vec<String>,
    pub addresses: Vec<String>,
    /// HTTP or HTTPS. Empty inherits the backend's mode.
    pub mode: String,
    pub backend_proto: Option<String>,
    pub insecure_skip_verify: bool,
    pub forward_server_name: Option<String>,
    #[serde(rename = "forwardRootCAs")]
    pub forward_root_cas: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Option<Duration>,
    pub proxy_protocol_version: Option<String>,
}

/// OIDC identity provider parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OidcProvider {
    pub name: String,
    pub discovery_url: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Domain where the issued identities are valid. Must be a suffix of the
    /// redirect URL's host.
    pub domain: Option<String>,
}

/// SAML identity provider parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SamlProvider {
    pub name: String,
    pub sso_url: String,
    pub entity_id: String,
    pub certs: String,
    #[serde(rename = "acsUrl")]
    pub acs_url: String,
    pub domain: Option<String>,
}

/// Passkey provider parameters. Users authenticate once with another
/// identity provider, then rely on passkeys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PasskeyProvider {
    pub name: String,
    pub identity_provider: String,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,
    pub endpoint: String,
    pub domain: Option<String>,
}

/// A locally hosted certificate authority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Pki {
    pub name: String,
    pub key_type: Option<String>,
    pub issuing_certificate_urls: Vec<String>,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_servers: Vec<String>,
    /// URL where users manage their certificates. The host must resolve to
    /// a backend in LOCAL or CONSOLE mode.
    pub endpoint: Option<String>,
    pub admins: Vec<String>,
}

impl Config {
    /// Read and validate a YAML configuration file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Validate the configuration, apply defaults, and canonicalize it in
    /// place. Must be called before compiling a routing snapshot.
    pub fn check(&mut self) -> anyhow::Result<()> {
        self.definitions = None;
        if self.cache_dir.is_none() {
            let base = dirs::cache_dir().ok_or_else(|| anyhow!("cacheDir must be set"))?;
            self.cache_dir = Some(base.join("tlsgate"));
        }
        if self.tls_addr.as_deref().unwrap_or("").is_empty() {
            self.tls_addr = Some(":10443".to_string());
        }
        if self.max_open.unwrap_or(0) == 0 {
            let n = open_file_limit().ok_or_else(|| anyhow!("maxOpen: value must be set"))?;
            self.max_open = Some((n / 2).saturating_sub(100).max(1));
        }
        if self.enable_quic.is_none() {
            self.enable_quic = Some(QUIC_IS_ENABLED);
        }
        if self.enable_quic == Some(true) && !QUIC_IS_ENABLED {
            bail!("enableQUIC: QUIC is not supported in this binary");
        }
        if let Some(dsn) = &self.default_server_name {
            self.default_server_name = Some(idna_to_ascii(dsn)?);
        }

        self.check_identity_providers()?;

        let quic = self.enable_quic == Some(true);
        for (i, be) in self.backends.iter_mut().enumerate() {
            be.mode = be.mode.to_uppercase();
            if be.mode.is_empty() || be.mode == "PLAINTEXT" {
                be.mode = MODE_TCP.to_string();
            }
            if !VALID_MODES.contains(&be.mode.as_str()) {
                bail!(
                    "backend[{i}].mode: value {:?} must be one of {:?}",
                    be.mode,
                    VALID_MODES
                );
            }
            if be.mode == MODE_TLS_PASSTHROUGH && be.client_auth.is_some() {
                bail!("backend[{i}].clientAuth: client auth is not compatible with TLS passthrough");
            }
            if be.alpn_protos.is_none() {
                if quic
                    && matches!(
                        be.mode.as_str(),
                        MODE_HTTP | MODE_HTTPS | MODE_QUIC | MODE_LOCAL | MODE_CONSOLE
                    )
                {
                    be.alpn_protos = Some(default_alpn_protos_plus_h3());
                } else {
                    be.alpn_protos = Some(default_alpn_protos());
                }
            }
            if be.backend_proto.is_some() && be.mode != MODE_HTTP && be.mode != MODE_HTTPS {
                bail!(
                    "backend[{i}].backendProto: field is not valid in mode {}",
                    be.mode
                );
            }
            if be.mode == MODE_QUIC {
                if !QUIC_IS_ENABLED {
                    bail!("backend[{i}].mode: QUIC is not supported in this binary");
                }
                be.server_close_ends_connection.get_or_insert(false);
                be.client_close_ends_connection.get_or_insert(false);
            }
            be.server_close_ends_connection.get_or_insert(true);
            be.client_close_ends_connection.get_or_insert(false);
            be.half_close_timeout.get_or_insert(Duration::from_secs(60));
        }

        self.check_server_names()?;
        let pkis = self.check_pkis()?;
        let bw_limits = self.check_bw_limits()?;

        let identity_providers: Vec<String> = self
            .oidc
            .iter()
            .map(|p| p.name.clone())
            .chain(self.saml.iter().map(|p| p.name.clone()))
            .chain(self.passkey.iter().map(|p| p.name.clone()))
            .collect();

        for (i, be) in self.backends.iter_mut().enumerate() {
            if be.server_names.is_empty() {
                bail!("backend[{i}].serverNames: backend must have at least one server name");
            }
            let needs_addresses = !matches!(
                be.mode.as_str(),
                MODE_CONSOLE | MODE_LOCAL | MODE_HTTP | MODE_HTTPS
            );
            if be.addresses.is_empty() && needs_addresses {
                bail!("backend[{i}].addresses: backend must have at least one address");
            }
            if !be.addresses.is_empty() && matches!(be.mode.as_str(), MODE_CONSOLE | MODE_LOCAL) {
                bail!(
                    "backend[{i}].addresses: addresses must be empty when mode is CONSOLE or LOCAL"
                );
            }
            if let Some(n) = &be.bw_limit {
                if !bw_limits.contains(n) {
                    bail!("backend[{i}].bwLimit: undefined name {n:?}");
                }
            }
            if let Some(ca) = &be.client_auth {
                for (j, n) in ca.root_cas.iter().enumerate() {
                    if pkis.contains(n) {
                        continue;
                    }
                    load_cert_pool(n)
                        .with_context(|| format!("backend[{i}].clientAuth.rootCAs[{j}]"))?;
                }
                for f in &ca.add_client_cert_header {
                    if !VALID_XFCC_FIELDS.contains(&f.to_lowercase().as_str()) {
                        bail!(
                            "backend[{i}].clientAuth.addClientCertHeader: invalid field {f:?}, valid values are {VALID_XFCC_FIELDS:?}"
                        );
                    }
                }
            }
            if let Some(sso) = &be.sso {
                if !identity_providers.contains(&sso.provider) {
                    bail!(
                        "backend[{i}].sso.provider: unknown provider {:?}",
                        sso.provider
                    );
                }
                if let Some(srv) = &sso.local_oidc_server {
                    for (j, client) in srv.clients.iter().enumerate() {
                        if client.id.is_empty() {
                            bail!("backend[{i}].sso.localOIDCServer.clients[{j}].id must be set");
                        }
                        if client.secret.is_empty() {
                            bail!(
                                "backend[{i}].sso.localOIDCServer.clients[{j}].secret must be set"
                            );
                        }
                        if client.redirect_uris.is_empty() {
                            bail!(
                                "backend[{i}].sso.localOIDCServer.clients[{j}].redirectUri must be set"
                            );
                        }
                    }
                    for (j, rr) in srv.rewrite_rules.iter().enumerate() {
                        if rr.input_claim.is_empty() {
                            bail!(
                                "backend[{i}].sso.localOIDCServer.rewriteRules[{j}].inputClaim must be set"
                            );
                        }
                        if rr.output_claim.is_empty() {
                            bail!(
                                "backend[{i}].sso.localOIDCServer.rewriteRules[{j}].outputClaim must be set"
                            );
                        }
                        regex::Regex::new(&rr.regex).map_err(|e| {
                            anyhow!("backend[{i}].sso.localOIDCServer.rewriteRules[{j}].regex: {e}")
                        })?;
                    }
                }
            }
            for (j, n) in be.forward_root_cas.iter().enumerate() {
                if pkis.contains(n) {
                    continue;
                }
                load_cert_pool(n).with_context(|| format!("backend[{i}].forwardRootCAs[{j}]"))?;
            }
            be.forward_timeout.get_or_insert(Duration::from_secs(30));
            if let Some(cidrs) = &be.allow_ips {
                for (j, c) in cidrs.iter().enumerate() {
                    parse_cidr(c).with_context(|| format!("backend[{i}].allowIPs[{j}]"))?;
                }
            }
            if let Some(cidrs) = &be.deny_ips {
                for (j, c) in cidrs.iter().enumerate() {
                    parse_cidr(c).with_context(|| format!("backend[{i}].denyIPs[{j}]"))?;
                }
            }
            if let Some(sn) = &be.forward_server_name {
                be.forward_server_name = Some(idna_to_ascii(sn)?);
            }
            if be.forward_rate_limit.unwrap_or(0) == 0 {
                be.forward_rate_limit = Some(5);
            }
            parse_proxy_proto_version(be.proxy_protocol_version.as_deref())
                .with_context(|| format!("backend[{i}].proxyProtocolVersion"))?;

            if !be.path_overrides.is_empty() && be.mode != MODE_HTTP && be.mode != MODE_HTTPS {
                bail!(
                    "backend[{i}].pathOverrides is only valid in {MODE_HTTP} or {MODE_HTTPS} mode"
                );
            }
            let be_mode = be.mode.clone();
            for (j, po) in be.path_overrides.iter_mut().enumerate() {
                if po.paths.is_empty() {
                    bail!("backend[{i}].pathOverrides[{j}].paths: cannot be empty");
                }
                for (k, p) in po.paths.iter().enumerate() {
                    if !p.starts_with('/') {
                        bail!("backend[{i}].pathOverrides[{j}].paths[{k}]: must start with /");
                    }
                }
                if po.mode.is_empty() {
                    po.mode = be_mode.clone();
                }
                po.mode = po.mode.to_uppercase();
                if po.mode != MODE_HTTP && po.mode != MODE_HTTPS {
                    bail!(
                        "backend[{i}].pathOverrides[{j}].mode: must be either {MODE_HTTP} or {MODE_HTTPS}"
                    );
                }
                for (k, n) in po.forward_root_cas.iter().enumerate() {
                    if pkis.contains(n) {
                        continue;
                    }
                    load_cert_pool(n).with_context(|| {
                        format!("backend[{i}].pathOverrides[{j}].forwardRootCAs[{k}]")
                    })?;
                }
                if let Some(sn) = &po.forward_server_name {
                    po.forward_server_name = Some(idna_to_ascii(sn)?);
                }
                po.forward_timeout.get_or_insert(Duration::from_secs(30));
                parse_proxy_proto_version(po.proxy_protocol_version.as_deref()).with_context(
                    || format!("backend[{i}].pathOverrides[{j}].proxyProtocolVersion"),
                )?;
            }
        }

        let cache_dir = self.cache_dir.clone().unwrap();
        create_cache_dir(&cache_dir)
            .with_context(|| format!("cacheDir {}", cache_dir.display()))?;
        Ok(())
    }

    /// Identity provider names must be unique across OIDC, SAML and passkey,
    /// endpoints must parse, and a provider's domain must contain its
    /// redirect/endpoint host.
    fn check_identity_providers(&mut self) -> anyhow::Result<()> {
        let mut names: Vec<String> = Vec::new();
        for (i, oi) in self.oidc.iter_mut().enumerate() {
            if names.contains(&oi.name) {
                bail!("oidc[{i}].name: duplicate provider name {:?}", oi.name);
            }
            names.push(oi.name.clone());
            if (oi.authorization_endpoint.is_none() || oi.token_endpoint.is_none())
                && oi.discovery_url.is_none()
            {
                bail!("oidc[{i}]: authorizationEndpoint and tokenEndpoint must be set unless discoveryUrl is set");
            }
            for (key, v) in [
                ("discoveryUrl", &oi.discovery_url),
                ("authorizationEndpoint", &oi.authorization_endpoint),
                ("tokenEndpoint", &oi.token_endpoint),
                ("userinfoEndpoint", &oi.userinfo_endpoint),
            ] {
                if let Some(u) = v {
                    parse_url(u).with_context(|| format!("oidc[{i}].{key}"))?;
                }
            }
            if oi.redirect_url.is_empty() {
                bail!("oidc[{i}].redirectUrl must be set");
            }
            parse_url(&oi.redirect_url).with_context(|| format!("oidc[{i}].redirectUrl"))?;
            if oi.client_id.is_empty() {
                bail!("oidc[{i}].clientId must be set");
            }
            if oi.client_secret.is_empty() {
                bail!("oidc[{i}].clientSecret must be set");
            }
            if let Some(domain) = &oi.domain {
                let domain = idna_to_ascii(domain)?;
                let host = url_host(&oi.redirect_url)
                    .with_context(|| format!("oidc[{i}].redirectUrl {:?}", oi.redirect_url))?;
                if !host.ends_with(&domain) {
                    bail!("oidc[{i}].domain {domain:?} must be part of redirectUrl ({host})");
                }
                oi.domain = Some(domain);
            }
        }
        for (i, s) in self.saml.iter_mut().enumerate() {
            if names.contains(&s.name) {
                bail!("saml[{i}].name: duplicate provider name {:?}", s.name);
            }
            names.push(s.name.clone());
            if s.sso_url.is_empty() {
                bail!("saml[{i}].ssoUrl must be set");
            }
            if s.entity_id.is_empty() {
                bail!("saml[{i}].entityId must be set");
            }
            if s.certs.is_empty() {
                bail!("saml[{i}].certs must be set");
            }
            if s.acs_url.is_empty() {
                bail!("saml[{i}].acsUrl must be set");
            }
            if let Some(domain) = &s.domain {
                let domain = idna_to_ascii(domain)?;
                let host = url_host(&s.acs_url)
                    .with_context(|| format!("saml[{i}].acsUrl {:?}", s.acs_url))?;
                if !host.ends_with(&domain) {
                    bail!("saml[{i}].domain {domain:?} must be part of acsUrl ({host})");
                }
                s.domain = Some(domain);
            }
        }
        for (i, pp) in self.passkey.iter_mut().enumerate() {
            if names.contains(&pp.name) {
                bail!("passkey[{i}].name: duplicate provider name {:?}", pp.name);
            }
            if pp.endpoint.is_empty() {
                bail!("passkey[{i}].endpoint must be set");
            }
            if pp.identity_provider.is_empty() {
                bail!("passkey[{i}].identityProvider must be set");
            }
            if !names.contains(&pp.identity_provider) {
                bail!(
                    "passkey[{i}].identityProvider has unexpected value {:?}",
                    pp.identity_provider
                );
            }
            names.push(pp.name.clone());
            if let Some(domain) = &pp.domain {
                let domain = idna_to_ascii(domain)?;
                let host = url_host(&pp.endpoint)
                    .with_context(|| format!("passkey[{i}].endpoint {:?}", pp.endpoint))?;
                if !host.ends_with(&domain) {
                    bail!("passkey[{i}].domain {domain:?} must be part of endpoint ({host})");
                }
                pp.domain = Some(domain);
            }
        }
        Ok(())
    }

    /// Normalize all server names to IDNA2008 ASCII and reject duplicate
    /// `(serverName, alpnProto)` combinations. A backend that disables ALPN
    /// claims its server names exclusively.
    fn check_server_names(&mut self) -> anyhow::Result<()> {
        let mut owners: std::collections::HashMap<String, (usize, bool)> =
            std::collections::HashMap::new();
        let mut keys: std::collections::HashSet<(String, String)> =
            std::collections::HashSet::new();
        for (i, be) in self.backends.iter_mut().enumerate() {
            let alpn_empty = be.alpn_protos.as_ref().is_some_and(|p| p.is_empty());
            for sn in be.server_names.iter_mut() {
                let ascii = idna_to_ascii(sn)?;
                *sn = ascii.clone();
                match owners.get(&ascii) {
                    None => {
                        owners.insert(ascii.clone(), (i, alpn_empty));
                    }
                    Some(&(owner, owner_alpn_empty)) if owner != i => {
                        if alpn_empty || owner_alpn_empty {
                            bail!("backend[{i}].serverNames: duplicate server name {ascii:?}");
                        }
                    }
                    _ => {}
                }
                for proto in be.alpn_protos.as_deref().unwrap_or_default() {
                    if !keys.insert((ascii.clone(), proto.clone())) {
                        bail!(
                            "backend[{i}].serverNames: duplicate server name {ascii:?} alpnProto {proto:?} combination"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// PKI names must be unique and each endpoint host must resolve to a
    /// backend in LOCAL or CONSOLE mode.
    fn check_pkis(&mut self) -> anyhow::Result<Vec<String>> {
        let server_name_mode: std::collections::HashMap<String, String> = self
            .backends
            .iter()
            .flat_map(|be| {
                be.server_names
                    .iter()
                    .map(move |sn| (sn.clone(), be.mode.clone()))
            })
            .collect();
        let mut names = Vec::new();
        for (i, p) in self.pki.iter().enumerate() {
            if names.contains(&p.name) {
                bail!("pki[{i}].name: duplicate name {:?}", p.name);
            }
            names.push(p.name.clone());
            if let Some(ep) = &p.endpoint {
                let host = url_host(ep).with_context(|| format!("pki[{i}].endpoint {ep:?}"))?;
                match server_name_mode.get(&host) {
                    None => bail!("pki[{i}].endpoint {ep:?}: backend not found"),
                    Some(mode) if mode != MODE_LOCAL && mode != MODE_CONSOLE => bail!(
                        "pki[{i}].endpoint {ep:?}: backend must have mode {MODE_LOCAL} or {MODE_CONSOLE}, found {mode}"
                    ),
                    _ => {}
                }
            }
        }
        Ok(names)
    }

    fn check_bw_limits(&mut self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for (i, l) in self.bw_limits.iter().enumerate() {
            if names.contains(&l.name) {
                bail!("bwLimits[{i}].name: duplicate name {:?}", l.name);
            }
            names.push(l.name.clone());
        }
        Ok(names)
    }
}

/// Convert an internationalized domain name to its IDNA2008 ASCII form.
/// Applied at admission; lookups always see ASCII.
pub fn idna_to_ascii(name: &str) -> anyhow::Result<String> {
    if name.is_empty() {
        return Ok(String::new());
    }
    let lower = name.trim().to_lowercase();
    idna::domain_to_ascii(&lower).map_err(|e| anyhow!("invalid server name {name:?}: {e}"))
}

/// Parse a CIDR string. Bare addresses are accepted as /32 (or /128) hosts.
pub fn parse_cidr(s: &str) -> anyhow::Result<ipnet::IpNet> {
    if let Ok(net) = s.parse::<ipnet::IpNet>() {
        return Ok(net);
    }
    let addr: IpAddr = s.parse().map_err(|_| anyhow!("invalid CIDR {s:?}"))?;
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    ipnet::IpNet::new(addr, prefix).map_err(|e| anyhow!("invalid CIDR {s:?}: {e}"))
}

/// Parse a PROXY protocol version string: "", "v1" or "v2".
pub fn parse_proxy_proto_version(s: Option<&str>) -> anyhow::Result<u8> {
    let s = s.unwrap_or("");
    if s.is_empty() {
        return Ok(0);
    }
    match s {
        "v1" => Ok(1),
        "v2" => Ok(2),
        _ => bail!("invalid value {s:?}, expected v1 or v2"),
    }
}

/// Load a certificate pool from a PKI-style source: an absolute file name or
/// inline PEM. Returns the parsed DER certificates.
pub fn load_cert_pool(
    source: &str,
) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let pem: Vec<u8> = if source.starts_with('/') {
        std::fs::read(source).with_context(|| format!("failed to read {source}"))?
    } else {
        source.as_bytes().to_vec()
    };
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .context("invalid certs")?;
    if certs.is_empty() {
        bail!("invalid certs");
    }
    Ok(certs)
}

fn parse_url(s: &str) -> anyhow::Result<http::Uri> {
    let uri: http::Uri = s.parse().map_err(|e| anyhow!("{e}"))?;
    Ok(uri)
}

/// Host portion of a URL, IDNA-normalized.
pub fn url_host(s: &str) -> anyhow::Result<String> {
    let uri = parse_url(s)?;
    let host = uri.host().ok_or_else(|| anyhow!("{s:?}: no host"))?;
    idna_to_ascii(host)
}

/// Soft limit on open file descriptors for this process.
#[cfg(unix)]
fn open_file_limit() -> Option<usize> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we own and nothing else.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if rc != 0 {
        return None;
    }
    usize::try_from(lim.rlim_cur).ok()
}

#[cfg(not(unix))]
fn open_file_limit() -> Option<usize> {
    Some(8192)
}

#[cfg(unix)]
fn create_cache_dir(dir: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_cache_dir(dir: &std::path::Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(yaml: &str) -> anyhow::Result<Config> {
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
        cfg.cache_dir = Some(std::env::temp_dir().join("tlsgate-test-cache"));
        cfg.check()?;
        Ok(cfg)
    }

    #[test]
    fn test_mode_normalization() {
        let cfg = checked(
            r"
backends:
  - serverNames: [example.com]
    mode: plaintext
    addresses: ['192.168.0.10:443']
",
        )
        .unwrap();
        assert_eq!(cfg.backends[0].mode, MODE_TCP);
        assert_eq!(cfg.tls_addr.as_deref(), Some(":10443"));
        assert!(cfg.max_open.unwrap() > 0);
    }

    #[test]
    fn test_alpn_defaults() {
        let cfg = checked(
            r"
backends:
  - serverNames: [a.example.com]
    mode: tls
    addresses: ['10.0.0.1:443']
",
        )
        .unwrap();
        assert_eq!(
            cfg.backends[0].alpn_protos.as_deref().unwrap(),
            ["h2", "http/1.1"]
        );
    }

    #[test]
    fn test_idna_round_trip() {
        let cfg = checked(
            r"
backends:
  - serverNames: ['bücher.example.com']
    mode: tcp
    addresses: ['10.0.0.1:443']
",
        )
        .unwrap();
        assert_eq!(cfg.backends[0].server_names[0], "xn--bcher-kva.example.com");
        assert!(cfg.backends[0].server_names[0].is_ascii());
    }

    #[test]
    fn test_duplicate_server_name_alpn_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [dup.example.com]
    mode: tls
    addresses: ['10.0.0.1:443']
    alpnProtos: [h2]
  - serverNames: [dup.example.com]
    mode: tls
    addresses: ['10.0.0.2:443']
    alpnProtos: [h2, http/1.1]
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate server name"), "{err}");
    }

    #[test]
    fn test_distinct_alpn_same_name_allowed() {
        checked(
            r"
backends:
  - serverNames: [split.example.com]
    mode: tls
    addresses: ['10.0.0.1:443']
    alpnProtos: [h2]
  - serverNames: [split.example.com]
    mode: tcp
    addresses: ['10.0.0.2:443']
    alpnProtos: [imap]
",
        )
        .unwrap();
    }

    #[test]
    fn test_empty_alpn_claims_name_exclusively() {
        let err = checked(
            r"
backends:
  - serverNames: [x.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    alpnProtos: []
  - serverNames: [x.example.com]
    mode: tls
    addresses: ['10.0.0.2:443']
    alpnProtos: [h2]
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate server name"), "{err}");
    }

    #[test]
    fn test_passthrough_client_auth_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [pt.example.com]
    mode: tlspassthrough
    addresses: ['10.0.0.1:443']
    clientAuth: {}
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("backend[0].clientAuth"), "{err}");
    }

    #[test]
    fn test_backend_proto_outside_http_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [t.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    backendProto: h2
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("backendProto"), "{err}");
    }

    #[test]
    fn test_path_override_index_path_in_error() {
        let err = checked(
            r"
backends:
  - serverNames: [p.example.com]
    mode: https
    pathOverrides:
      - paths: [/ok]
        addresses: ['10.0.0.1:443']
      - paths: [bad]
        addresses: ['10.0.0.2:443']
",
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("backend[0].pathOverrides[1].paths[0]"),
            "{err}"
        );
    }

    #[test]
    fn test_missing_addresses_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [no-addr.example.com]
    mode: tls
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("backend[0].addresses"), "{err}");
    }

    #[test]
    fn test_local_mode_with_addresses_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [local.example.com]
    mode: local
    addresses: ['10.0.0.1:80']
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("CONSOLE or LOCAL"), "{err}");
    }

    #[test]
    fn test_undefined_bw_limit_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [bw.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    bwLimit: nosuch
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("bwLimit: undefined name"), "{err}");
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [cidr.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
    denyIPs: ['500.1.2.3/24']
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("backend[0].denyIPs[0]"), "{err}");
    }

    #[test]
    fn test_bare_ip_accepted_as_host_cidr() {
        let net = parse_cidr("192.168.1.7").unwrap();
        assert_eq!(net.prefix_len(), 32);
        let net6 = parse_cidr("2001:db8::1").unwrap();
        assert_eq!(net6.prefix_len(), 128);
    }

    #[test]
    fn test_proxy_protocol_version() {
        assert_eq!(parse_proxy_proto_version(None).unwrap(), 0);
        assert_eq!(parse_proxy_proto_version(Some("v1")).unwrap(), 1);
        assert_eq!(parse_proxy_proto_version(Some("v2")).unwrap(), 2);
        assert!(parse_proxy_proto_version(Some("v3")).is_err());
        assert!(parse_proxy_proto_version(Some("2")).is_err());
    }

    #[test]
    fn test_tcp_mode_half_close_defaults() {
        let cfg = checked(
            r"
backends:
  - serverNames: [q.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
",
        )
        .unwrap();
        assert_eq!(cfg.backends[0].server_close_ends_connection, Some(true));
        assert_eq!(cfg.backends[0].client_close_ends_connection, Some(false));
        assert_eq!(
            cfg.backends[0].half_close_timeout,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_duplicate_identity_provider_rejected() {
        let err = checked(
            r"
oidc:
  - name: idp
    discoveryUrl: https://idp.example.com/.well-known/openid-configuration
    redirectUrl: https://login.example.com/callback
    clientId: id
    clientSecret: secret
saml:
  - name: idp
    ssoUrl: https://sso.example.com
    entityId: urn:example
    certs: certs
    acsUrl: https://acs.example.com
backends: []
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("saml[0].name"), "{err}");
    }

    #[test]
    fn test_oidc_domain_suffix_rule() {
        let err = checked(
            r"
oidc:
  - name: idp
    discoveryUrl: https://idp.example.com/.well-known/openid-configuration
    redirectUrl: https://login.other.net/callback
    clientId: id
    clientSecret: secret
    domain: example.com
backends: []
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("oidc[0].domain"), "{err}");
    }

    #[test]
    fn test_pki_endpoint_must_be_local_backend() {
        let err = checked(
            r"
backends:
  - serverNames: [www.example.com]
    mode: tcp
    addresses: ['10.0.0.1:443']
pki:
  - name: internal
    endpoint: https://www.example.com/certs
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("pki[0].endpoint"), "{err}");

        checked(
            r"
backends:
  - serverNames: [ca.example.com]
    mode: console
pki:
  - name: internal
    endpoint: https://ca.example.com/certs
",
        )
        .unwrap();
    }

    #[test]
    fn test_invalid_xfcc_field_rejected() {
        let err = checked(
            r"
backends:
  - serverNames: [xfcc.example.com]
    mode: https
    addresses: ['10.0.0.1:443']
    clientAuth:
      addClientCertHeader: [cert, nonsense]
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("addClientCertHeader"), "{err}");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let res: Result<Config, serde_yaml::Error> = serde_yaml::from_str("bogusKey: true\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_definitions_discarded() {
        let cfg = checked(
            r"
definitions:
  anchor: &a ['10.0.0.1:443']
backends:
  - serverNames: [d.example.com]
    mode: tcp
    addresses: *a
",
        )
        .unwrap();
        assert!(cfg.definitions.is_none());
        assert_eq!(cfg.backends[0].addresses, ["10.0.0.1:443"]);
    }
}
