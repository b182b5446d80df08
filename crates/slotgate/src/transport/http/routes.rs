//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    middleware::from_fn_with_state,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::service::{AdmissionService, HealthSnapshot, LimiterStatus};
use crate::version::VersionInfo;

use super::middleware::admission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Ready,
    /// Every enabled limiter is saturated.
    Busy,
    ShuttingDown,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub version: VersionInfo,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        let status = if snapshot.shutting_down {
            HealthStatus::ShuttingDown
        } else if snapshot.is_busy() {
            HealthStatus::Busy
        } else {
            HealthStatus::Ready
        };

        Self {
            status,
            version: snapshot.version,
        }
    }
}

async fn health_check(State(service): State<Arc<AdmissionService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

async fn list_limiters(State(service): State<Arc<AdmissionService>>) -> Json<Vec<LimiterStatus>> {
    Json(service.status())
}

async fn reconfigure(
    State(service): State<Arc<AdmissionService>>,
    Json(config): Json<AdmissionConfig>,
) -> impl IntoResponse {
    match service.reconfigure(&config) {
        Ok(retired) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "limiters": service.status(),
                "retired": retired,
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected admission config");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn shutdown(State(service): State<Arc<AdmissionService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

/// Wrap an application router so every request passes through admission.
pub fn gate(service: Arc<AdmissionService>, app: Router) -> Router {
    app.layer(from_fn_with_state(service, admission))
}

/// Control routes. `/ping` is gated like application traffic so it reports
/// whether the node would actually admit a request.
pub fn routes(service: Arc<AdmissionService>) -> Router {
    let gated = gate(Arc::clone(&service), Router::new().route("/ping", get(ping)));

    Router::new()
        .route("/health-check", get(health_check))
        .route("/limiters", get(list_limiters).put(reconfigure))
        .route("/shutdown", post(shutdown))
        .with_state(service)
        .merge(gated)
}

/// Control routes merged with a gated application router.
pub fn router(service: Arc<AdmissionService>, app: Router) -> Router {
    routes(Arc::clone(&service)).merge(gate(service, app))
}
