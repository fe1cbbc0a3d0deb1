//! Code execution endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{require_lease, ApiError};
use crate::state::Gateway;

#[derive(Debug, Deserialize)]
pub(super) struct ExecuteRequest {
    code: String,
    /// Seconds; capped by the configured maximum.
    timeout: Option<f64>,
}

pub(super) async fn execute(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let timeout = req
        .timeout
        .filter(|t| *t > 0.0)
        .map(Duration::from_secs_f64);

    let execution_id = gateway.executor.execute(&req.code, timeout, &token).await?;
    gateway.lease.touch(&token).await;
    Ok(Json(json!({"success": true, "execution_id": execution_id})))
}

pub(super) async fn stop(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let stopped = gateway.executor.stop().await;
    gateway.lease.touch(&token).await;
    Ok(Json(json!({"stopped": stopped})))
}

pub(super) async fn status(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let status = gateway.executor.status().await;
    Json(serde_json::to_value(status).unwrap_or_else(|_| json!({})))
}

pub(super) async fn result(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    match gateway.executor.last_result().await {
        Some(record) => Json(json!({"success": true, "result": record})),
        None => Json(json!({
            "success": false,
            "result": Value::Null,
            "error": "no execution result available",
        })),
    }
}
