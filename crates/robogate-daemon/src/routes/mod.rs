//! HTTP + WebSocket surface.
//!
//! Thin axum handlers over the [`Gateway`](crate::state::Gateway) record.
//! Command, live-rewind, and code endpoints require the lease token in the
//! `X-Lease-Id` header; a mismatch is `403 not_holder`. Dry-run rewinds,
//! the read-only endpoints, rewind tuning (`GET|PUT /rewind/config`), and
//! `POST /trajectory/clear` are deliberately open so dashboards and
//! monitors keep working without holding the lease. Internal failures are
//! logged with a correlation id and surfaced as plain 500s.

mod code;
mod commands;
mod lease;
mod rewind;
mod services;
mod state;
mod ws;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use robogate_core::trajectory::WaypointSource;
use robogate_core::GatewayError;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::state::Gateway;

/// Build the full router over a gateway.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(state::health))
        .route("/state", get(state::snapshot))
        .route("/state/cameras", get(state::camera_frame))
        .route("/trajectory", get(state::trajectory))
        .route("/trajectory/clear", post(state::clear_trajectory))
        .route("/lease/acquire", post(lease::acquire))
        .route("/lease/release", post(lease::release))
        .route("/lease/extend", post(lease::extend))
        .route("/lease/cancel", post(lease::cancel))
        .route("/lease/status", get(lease::status))
        .route("/cmd/arm/move", post(commands::arm_move))
        .route("/cmd/arm/stop", post(commands::arm_stop))
        .route("/cmd/base/move", post(commands::base_move))
        .route("/cmd/base/stop", post(commands::base_stop))
        .route("/cmd/gripper", post(commands::gripper))
        .route("/rewind/steps", post(rewind::steps))
        .route("/rewind/percentage", post(rewind::percentage))
        .route("/rewind/to-waypoint", post(rewind::to_waypoint))
        .route("/rewind/to-safe", post(rewind::to_safe))
        .route("/rewind/stop", post(rewind::stop))
        .route("/rewind/status", get(rewind::status))
        .route("/rewind/config", get(rewind::get_config).put(rewind::put_config))
        .route("/code/execute", post(code::execute))
        .route("/code/stop", post(code::stop))
        .route("/code/status", get(code::status))
        .route("/code/result", get(code::result))
        .route("/services", get(services::list))
        .route("/services/:key", get(services::status))
        .route("/services/:key/start", post(services::start))
        .route("/services/:key/stop", post(services::stop))
        .route("/services/:key/restart", post(services::restart))
        .route("/services/:key/logs", get(services::logs))
        .route("/ws/state", get(ws::state_stream))
        .route("/ws/feedback", get(ws::feedback_stream))
        .route("/ws/cameras", get(ws::camera_stream))
        .with_state(gateway)
}

/// Gateway errors as HTTP responses.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::InvalidArgument(_) | GatewayError::SafetyViolation { .. } => {
                StatusCode::BAD_REQUEST
            },
            GatewayError::NotHolder | GatewayError::LeaseExpired => StatusCode::FORBIDDEN,
            GatewayError::Busy | GatewayError::DependencyNotRunning { .. } => {
                StatusCode::CONFLICT
            },
            GatewayError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = match &self.0 {
            GatewayError::SafetyViolation { reason, detail } => {
                json!({"error": self.0.code(), "reason": reason, "detail": detail})
            },
            GatewayError::Internal(message) => {
                // Log the detail with a correlation id; clients only see
                // the id.
                let correlation_id = Uuid::new_v4().to_string();
                error!(correlation_id, message, "internal error");
                json!({"error": self.0.code(), "correlation_id": correlation_id})
            },
            other => json!({"error": other.code(), "detail": other.to_string()}),
        };

        (status, Json(body)).into_response()
    }
}

/// Extract and authorize the lease token from `X-Lease-Id`.
pub(crate) async fn require_lease(
    gateway: &Gateway,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    let token = headers
        .get("x-lease-id")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(GatewayError::NotHolder))?;
    if !gateway.lease.authorize(token).await {
        return Err(ApiError(GatewayError::NotHolder));
    }
    Ok(token.to_string())
}

/// Who a command came from: scripts mark themselves via a header set by
/// the executor's SDK shim.
pub(crate) fn command_source(headers: &HeaderMap) -> WaypointSource {
    match headers.get("x-command-source").and_then(|v| v.to_str().ok()) {
        Some("script") => WaypointSource::Script,
        _ => WaypointSource::Command,
    }
}

/// Short correlation id for command feedback events.
pub(crate) fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}
