//! Admission middleware for axum routers.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;

use crate::class::RequestClass;
use crate::permit::{Rejected, Reservation};
use crate::service::AdmissionService;

/// Gate a request on its class limiter.
///
/// The reservation is held while the inner handler runs and then moves into
/// the response body, so it is released once the body has been written out
/// or dropped. Streamed responses stay bounded for their whole lifetime.
pub async fn admission(
    State(service): State<Arc<AdmissionService>>,
    request: Request,
    next: Next,
) -> Response {
    let class = service.classify(request.headers());
    let (class, outcome) = service.admit_class(class).await;

    match outcome {
        Ok(reservation) if reservation.is_unlimited() => next.run(request).await,
        Ok(reservation) => next
            .run(request)
            .await
            .map(|body| hold_until_written(body, reservation)),
        Err(rejected) => rejection_response(class, rejected),
    }
}

/// Re-wrap `body` so `reservation` lives exactly as long as the stream.
///
/// Trailers and the exact size hint are not carried over.
fn hold_until_written(body: Body, reservation: Reservation) -> Body {
    Body::from_stream(body.into_data_stream().map(move |chunk| {
        let _held = &reservation;
        chunk
    }))
}

fn rejection_response(class: Option<RequestClass>, rejected: Rejected) -> Response {
    match rejected {
        Rejected::TimedOut { .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "Too Many Requests",
                "class": class,
            })),
        )
            .into_response(),
        Rejected::Cancelled => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "Server is shutting down",
                "class": class,
            })),
        )
            .into_response(),
    }
}
