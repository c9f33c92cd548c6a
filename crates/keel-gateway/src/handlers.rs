//! Gateway handlers.
//!
//! Payloads are published exactly as received. Validation belongs to the
//! subscriber: the reconciler logs and discards feedback it cannot parse.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{debug, warn};

use crate::GatewayState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

#[derive(serde::Serialize)]
struct Published {
    subject: String,
    delivered: usize,
}

#[derive(serde::Serialize)]
struct SubjectInfo {
    subject: String,
    subscribers: usize,
}

/// POST /api/v1/feedback
///
/// 202 once a reconciler has the event; 503 when none is subscribed, so the
/// monitor knows to re-send.
pub async fn post_feedback(State(state): State<GatewayState>, body: Bytes) -> impl IntoResponse {
    let delivered = state
        .bus
        .publish(&state.feedback_subject, body.to_vec(), None);
    if delivered == 0 {
        warn!(subject = %state.feedback_subject, "feedback received with no reconciler listening");
        return error_response("no reconciler is listening for feedback", StatusCode::SERVICE_UNAVAILABLE)
            .into_response();
    }
    debug!(subject = %state.feedback_subject, bytes = body.len(), "feedback published");
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(Published {
            subject: state.feedback_subject,
            delivered,
        }),
    )
        .into_response()
}

/// POST /api/v1/subjects/:subject
pub async fn publish(
    State(state): State<GatewayState>,
    Path(subject): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    if subject.trim().is_empty() {
        return error_response("subject must not be blank", StatusCode::BAD_REQUEST).into_response();
    }
    let delivered = state.bus.publish(&subject, body.to_vec(), None);
    debug!(%subject, delivered, "payload published");
    (StatusCode::ACCEPTED, ApiResponse::ok(Published { subject, delivered })).into_response()
}

/// GET /api/v1/subjects/:subject
pub async fn subject_info(
    State(state): State<GatewayState>,
    Path(subject): Path<String>,
) -> impl IntoResponse {
    let subscribers = state.bus.subscriber_count(&subject);
    ApiResponse::ok(SubjectInfo { subject, subscribers })
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}
