//! slotgate: standalone admission gate server.
//!
//! Serves the control routes (`/health-check`, `/limiters`, `/shutdown`) and
//! the gated `/ping` liveness probe. Limiters come from the JSON file named
//! by `SLOTGATE_CONFIG`; without it every class is unmanaged.

use std::sync::Arc;

use axum::Router;
use slotgate::transport::{ServerConfig, serve};
use slotgate::{AdmissionConfig, AdmissionService, LimiterRegistry};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SLOTGATE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "slotgate={level},slotgate_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn load_registry() -> anyhow::Result<LimiterRegistry> {
    match std::env::var("SLOTGATE_CONFIG") {
        Ok(path) => {
            let config = AdmissionConfig::from_path(&path)?;
            tracing::info!(%path, limiters = config.limiters.len(), "Loaded admission config");
            Ok(LimiterRegistry::from_config(&config)?)
        }
        Err(_) => {
            tracing::warn!("SLOTGATE_CONFIG not set, every request class is unmanaged");
            Ok(LimiterRegistry::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env()?;
    let registry = Arc::new(load_registry()?);
    let service = Arc::new(AdmissionService::new(registry));

    serve(config, service, Router::new()).await
}
