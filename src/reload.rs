//! Reconfiguration controller
//!
//! Publish-replace: a reload validates the whole document, compiles a
//! candidate snapshot, and atomically replaces the published pointer. A
//! snapshot whose content hash equals the published one is a no-op. Handlers
//! that resolved against an earlier snapshot keep their references until
//! their connections end; only new accepts observe the replacement.
//!
//! Listener-shaping options (`tlsAddr`, `httpAddr`, `cacheDir`,
//! `enableQUIC`) take effect only on full restart; a reload that changes
//! them publishes the rest and logs what was ignored.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::bwlimit::BwRegistry;
use crate::config::Config;
use crate::routing::Snapshot;

/// Result of a publish attempt.
pub enum ReloadOutcome {
    Published(Arc<Snapshot>),
    Unchanged,
}

/// Owns the published snapshot pointer and the state that must survive
/// reloads (bandwidth groups).
pub struct ReloadController {
    config_path: PathBuf,
    published: ArcSwap<Snapshot>,
    bw: BwRegistry,
}

impl ReloadController {
    /// Validate the file at `config_path` and publish the initial snapshot.
    pub fn from_file(config_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let config_path = config_path.into();
        let cfg = Config::load(&config_path)?;
        Self::new(config_path, cfg)
    }

    pub fn new(config_path: PathBuf, checked: Config) -> anyhow::Result<Self> {
        let bw = BwRegistry::new();
        bw.sync(&checked.bw_limits);
        let snapshot = Snapshot::build(&checked, |name| bw.get(name))?;
        Ok(ReloadController {
            config_path,
            published: ArcSwap::new(snapshot),
            bw,
        })
    }

    /// The currently published snapshot. Handlers call this once per
    /// connection and hold the result.
    pub fn current(&self) -> Arc<Snapshot> {
        self.published.load_full()
    }

    /// Re-read the config file and publish it. On any validation error the
    /// current snapshot stays published and the error is returned.
    pub fn reload(&self) -> anyhow::Result<ReloadOutcome> {
        let cfg = Config::load(&self.config_path)
            .with_context(|| format!("reload of {}", self.config_path.display()))?;
        self.publish(cfg)
    }

    /// Publish an already-checked configuration.
    pub fn publish(&self, checked: Config) -> anyhow::Result<ReloadOutcome> {
        let current = self.current();
        let candidate_hash = crate::routing::content_hash(&checked)?;
        if candidate_hash == current.hash() {
            return Ok(ReloadOutcome::Unchanged);
        }

        self.bw.sync(&checked.bw_limits);
        let snapshot = Snapshot::build(&checked, |name| self.bw.get(name))?;

        if snapshot.tls_addr() != current.tls_addr() {
            warn!(
                old = current.tls_addr(),
                new = snapshot.tls_addr(),
                "tlsAddr changed; the new value takes effect on restart"
            );
        }
        if snapshot.http_addr() != current.http_addr() {
            warn!("httpAddr changed; the new value takes effect on restart");
        }
        if snapshot.cache_dir() != current.cache_dir() {
            warn!("cacheDir changed; the new value takes effect on restart");
        }
        if snapshot.enable_quic() != current.enable_quic() {
            warn!("enableQUIC changed; the new value takes effect on restart");
        }

        info!(hash = snapshot.hash(), "configuration published");
        self.published.store(snapshot.clone());
        Ok(ReloadOutcome::Published(snapshot))
    }
}
