//! Service supervisor endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use robogate_core::GatewayError;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiError;
use crate::services::ServiceRuntime;
use crate::state::Gateway;

fn runtime(gateway: &Gateway) -> Result<&Arc<ServiceRuntime>, ApiError> {
    gateway.services.as_ref().ok_or_else(|| {
        ApiError(GatewayError::InvalidArgument(
            "service manager is disabled".to_string(),
        ))
    })
}

pub(super) async fn list(State(gateway): State<Arc<Gateway>>) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    Ok(Json(json!({"services": runtime.statuses()})))
}

pub(super) async fn status(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    let status = runtime.status(&key)?;
    Ok(Json(serde_json::to_value(status).unwrap_or_else(|_| json!({}))))
}

pub(super) async fn start(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    let status = runtime.start(&key).await?;
    Ok(Json(json!({"ok": true, "key": key, "state": status.state})))
}

pub(super) async fn stop(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    let status = runtime.stop(&key).await?;
    Ok(Json(json!({"ok": true, "key": key, "state": status.state})))
}

pub(super) async fn restart(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    let status = runtime.restart(&key).await?;
    Ok(Json(json!({"ok": true, "key": key, "state": status.state})))
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    lines: Option<usize>,
}

pub(super) async fn logs(
    State(gateway): State<Arc<Gateway>>,
    Path(key): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let runtime = runtime(&gateway)?;
    let lines = runtime.logs(&key, query.lines.unwrap_or(50))?;
    Ok(Json(json!({"key": key, "lines": lines})))
}
