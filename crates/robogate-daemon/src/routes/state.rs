//! Read-only state endpoints. These never require a lease and keep serving
//! while individual backends are down.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::state::Gateway;

pub(super) async fn health(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let lease = gateway.lease.status().await;
    Json(json!({
        "status": "ok",
        "backends": {
            "arm": gateway.arm.is_connected(),
            "base": gateway.base.is_connected(),
            "gripper": gateway.gripper.is_connected(),
            "cameras": gateway.cameras.is_connected(),
        },
        "lease": {
            "holder": lease.holder,
            "queue_length": lease.queue_length,
        },
    }))
}

pub(super) async fn snapshot(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let snapshot = gateway.aggregator.latest();
    Json(serde_json::to_value(&*snapshot).unwrap_or_else(|_| json!({})))
}

pub(super) async fn trajectory(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let waypoints = gateway
        .recorder
        .lock()
        .expect("recorder lock")
        .snapshot();
    Json(json!({"count": waypoints.len(), "waypoints": waypoints}))
}

pub(super) async fn clear_trajectory(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    gateway.recorder.lock().expect("recorder lock").clear();
    Json(json!({"success": true}))
}

pub(super) async fn camera_frame(State(gateway): State<Arc<Gateway>>) -> Response {
    match gateway.cameras.latest_frame() {
        Some(frame) => {
            ([(header::CONTENT_TYPE, "image/jpeg")], frame).into_response()
        },
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "backend_unavailable", "detail": "no camera frame available"})),
        )
            .into_response(),
    }
}
