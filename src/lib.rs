//! tlsgate - multi-mode SNI/ALPN routing TLS reverse proxy
//!
//! A front-door proxy that:
//! - Terminates (or passes through) TLS and QUIC on one public listener
//! - Routes connections to backends by server name and negotiated ALPN
//! - Enforces per-backend IP policy, client-certificate ACLs and rate limits
//! - Bridges bytes or HTTP requests upstream with round-robin failover
//! - Hot-reloads its configuration without dropping in-flight connections

pub mod bwlimit;
pub mod cert;
pub mod config;
pub mod dial;
pub mod forward;
pub mod handler;
pub mod http;
pub mod listener;
pub mod proxy_protocol;
#[cfg(feature = "quic")]
pub mod quic;
pub mod reload;
pub mod routing;
pub mod sni;
pub mod tls;

// Re-export commonly used types
pub use cert::{CertManager, CertificateSource};
pub use config::Config;
pub use forward::{ForwardPolicy, ForwardStats};
pub use listener::Proxy;
pub use reload::{ReloadController, ReloadOutcome};
pub use routing::{Mode, Route, Snapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
