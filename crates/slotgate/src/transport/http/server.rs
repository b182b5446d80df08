//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::service::AdmissionService;

use super::routes::router;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If true, ignore SIGTERM and wait for explicit /shutdown or SIGINT.
    /// Used in Kubernetes to allow graceful draining.
    pub await_explicit_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            await_explicit_shutdown: false,
        }
    }
}

impl ServerConfig {
    /// Read `SLOTGATE_HOST`, `SLOTGATE_PORT` and
    /// `SLOTGATE_AWAIT_EXPLICIT_SHUTDOWN`, falling back to the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("SLOTGATE_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("SLOTGATE_PORT") {
            config.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SLOTGATE_PORT {port:?}: {e}"))?;
        }
        if let Some(flag) = lookup("SLOTGATE_AWAIT_EXPLICIT_SHUTDOWN") {
            config.await_explicit_shutdown =
                matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        Ok(config)
    }
}

/// Start the HTTP server: control routes plus `app` behind admission.
pub async fn serve(
    config: ServerConfig,
    service: Arc<AdmissionService>,
    app: Router,
) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = router(Arc::clone(&service), app);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Starting slotgate server on {}", actual_addr);

    let signal_service = Arc::clone(&service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(config.await_explicit_shutdown, shutdown_rx).await;
            // Waiting admissions fail fast instead of holding up the drain.
            signal_service.trigger_shutdown();
        })
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or /shutdown endpoint).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured. That should fail fast at startup.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        if await_explicit_shutdown {
            tracing::info!("await_explicit_shutdown enabled, ignoring SIGTERM");
            std::future::pending::<()>().await
        } else {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect(
                    "failed to install SIGTERM handler - is tokio runtime configured correctly?",
                )
                .recv()
                .await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = async {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested via /shutdown endpoint...");
        }
    }
}
