//! `tlsgate` - multi-mode SNI/ALPN routing TLS reverse proxy
//!
//! Bootstrap: parse the CLI, load and validate the configuration, bind the
//! listeners, then run until a termination signal. SIGHUP reloads the
//! configuration; SIGINT/SIGTERM stop accepting, drain in-flight
//! connections and exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use notify::Watcher;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tlsgate::cert::{CertManager, CertificateSource};
use tlsgate::config::Config;
use tlsgate::listener::Proxy;
use tlsgate::reload::{ReloadController, ReloadOutcome};

/// tlsgate - SNI/ALPN routing TLS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "tlsgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TLSGATE_CONFIG")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TLSGATE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "TLSGATE_JSON_LOGS")]
    json_logs: bool,

    /// Reload automatically when the configuration file changes
    #[arg(long)]
    watch_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    // Install the process-wide provider for code paths that use the
    // default rustls builder.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if args.validate {
        Config::load(&args.config)?;
        info!("configuration is valid");
        return Ok(());
    }

    info!(version = env!("CARGO_PKG_VERSION"), config = %args.config.display(), "starting tlsgate");

    let controller = Arc::new(ReloadController::from_file(&args.config)?);
    let snapshot = controller.current();
    info!(
        hash = snapshot.hash(),
        backends = snapshot.routes().len(),
        tls_addr = snapshot.tls_addr(),
        max_open = snapshot.max_open(),
        "configuration loaded"
    );

    let certs: Arc<dyn CertificateSource> = Arc::new(CertManager::new(snapshot.cache_dir()));
    let proxy = Arc::new(Proxy::new(controller.clone(), certs));

    let _watcher = if args.watch_config {
        Some(watch_config(&args.config, controller.clone())?)
    } else {
        None
    };

    let mut server = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.run().await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt");
                break;
            }
            () = terminate_signal() => {
                info!("received termination signal");
                break;
            }
            () = reload_signal() => {
                apply_reload(&controller);
            }
            res = &mut server => {
                // The listener only returns early on a bind failure.
                return res.context("listener task panicked")?;
            }
        }
    }

    info!("shutting down, draining connections");
    proxy.cancellation().cancel();
    proxy.drain(Duration::from_secs(10)).await;
    info!("shutdown complete");
    Ok(())
}

fn apply_reload(controller: &ReloadController) {
    match controller.reload() {
        Ok(ReloadOutcome::Published(snapshot)) => {
            info!(hash = snapshot.hash(), "configuration reloaded");
        }
        Ok(ReloadOutcome::Unchanged) => {
            info!("configuration unchanged");
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "configuration reload failed");
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
    Ok(())
}

/// Watch the configuration file and reload on change.
fn watch_config(
    path: &Path,
    controller: Arc<ReloadController>,
) -> anyhow::Result<notify::RecommendedWatcher> {
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                apply_reload(&controller);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "config watch error"),
        })?;
    watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "watching configuration file");
    Ok(watcher)
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

#[cfg(unix)]
async fn reload_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn reload_signal() {
    std::future::pending::<()>().await;
}
