//! Listeners and connection admission
//!
//! One TCP listener on the TLS address, an optional QUIC endpoint on the
//! same address, and an optional plain-HTTP listener for ACME http-01
//! challenges. Every accept increments the global open-connection counter;
//! when the ceiling is exceeded the connection is closed immediately, with
//! no handshake. Each admitted connection runs as its own task holding the
//! snapshot that was current at accept time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cert::CertificateSource;
use crate::dial::set_keepalive;
use crate::handler::{handle_connection, ConnContext};
use crate::reload::ReloadController;

/// Keepalive configured on accepted connections.
const ACCEPT_KEEPALIVE: Duration = Duration::from_secs(60);

/// The front-door runtime: listeners, admission gate, and the root
/// cancellation that tears every task down on shutdown.
pub struct Proxy {
    controller: Arc<ReloadController>,
    certs: Arc<dyn CertificateSource>,
    num_open: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(controller: Arc<ReloadController>, certs: Arc<dyn CertificateSource>) -> Self {
        Proxy {
            controller,
            certs,
            num_open: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Root cancellation handle. Cancelling stops the accept loops and
    /// every live connection.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn num_open(&self) -> usize {
        self.num_open.load(Ordering::SeqCst)
    }

    pub fn controller(&self) -> &Arc<ReloadController> {
        &self.controller
    }

    /// Bind the listeners and serve until cancelled. Failing to bind is the
    /// only fatal error.
    pub async fn run(&self) -> anyhow::Result<()> {
        let snapshot = self.controller.current();

        let tls_addr = listen_addr(snapshot.tls_addr())?;
        let listener = TcpListener::bind(tls_addr)
            .await
            .with_context(|| format!("failed to bind TLS listener on {tls_addr}"))?;
        let bound = listener.local_addr()?;
        info!(addr = %bound, "accepting TLS connections");

        if let Some(http_addr) = snapshot.http_addr() {
            let addr = listen_addr(http_addr)?;
            let http_listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
            info!(addr = %http_listener.local_addr()?, "accepting HTTP connections");
            let certs = self.certs.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                crate::http::run_challenge_listener(http_listener, certs, cancel).await;
            });
        }

        #[cfg(feature = "quic")]
        if snapshot.enable_quic() {
            let controller = self.controller.clone();
            let certs = self.certs.clone();
            let num_open = self.num_open.clone();
            let cancel = self.cancel.clone();
            let quic_addr = tls_addr;
            tokio::spawn(async move {
                if let Err(e) =
                    crate::quic::run_listener(quic_addr, controller, certs, num_open, cancel).await
                {
                    error!(error = format!("{e:#}"), "QUIC listener failed");
                }
            });
        }

        self.accept_loop(listener, bound).await;
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener, bound: SocketAddr) {
        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };

            let snapshot = self.controller.current();
            let guard = OpenGuard::acquire(&self.num_open);
            if guard.count() > snapshot.max_open() {
                warn!(
                    %peer,
                    num_open = guard.count(),
                    max_open = snapshot.max_open(),
                    "too many open connections"
                );
                // Dropping the stream sends the close; no handshake happens.
                continue;
            }
            set_keepalive(&stream, ACCEPT_KEEPALIVE);

            let local_addr = stream.local_addr().unwrap_or(bound);
            let ctx = ConnContext {
                snapshot,
                certs: self.certs.clone(),
                cancel: self.cancel.clone(),
                local_addr,
            };
            tokio::spawn(async move {
                let _guard = guard;
                handle_connection(ctx, stream, peer).await;
            });
        }
        info!("listener stopped");
    }

    /// Wait for in-flight connections to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.num_open() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.num_open(), "drain timeout");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII slot in the global connection count.
pub struct OpenGuard {
    counter: Arc<AtomicUsize>,
    count: usize,
}

impl OpenGuard {
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        OpenGuard {
            counter: counter.clone(),
            count,
        }
    }

    /// The counter value right after this acquisition.
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Parse a listener address. A bare `:port`, as in the default `:10443`,
/// binds every interface.
pub fn listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| anyhow!("invalid listen address {addr:?}: {e}"))
}
