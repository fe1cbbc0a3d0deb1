//! Rewind endpoints.
//!
//! Dry runs validate and time the replay without touching the adapters and
//! need no lease; live rewinds are mutating and require the token.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use robogate_core::rewind::{RewindRequest, RewindResult};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{require_lease, ApiError};
use crate::state::Gateway;

#[derive(Debug, Deserialize)]
pub(super) struct StepsRequest {
    steps: usize,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct PercentageRequest {
    percentage: f64,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ToWaypointRequest {
    waypoint_idx: usize,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ToSafeRequest {
    #[serde(default)]
    dry_run: bool,
}

/// Runtime-tunable configuration, durations in seconds.
#[derive(Debug, Deserialize)]
pub(super) struct ConfigPatch {
    chunk_size: Option<usize>,
    chunk_duration: Option<f64>,
    settle_time: Option<f64>,
    command_rate: Option<f64>,
    joint_tolerance: Option<f64>,
    position_tolerance: Option<f64>,
    auto_rewind_enabled: Option<bool>,
    auto_rewind_steps: Option<usize>,
    monitor_interval: Option<f64>,
}

async fn run(
    gateway: &Gateway,
    headers: &HeaderMap,
    request: RewindRequest,
    dry_run: bool,
) -> Result<Json<RewindResult>, ApiError> {
    if !dry_run {
        let token = require_lease(gateway, headers).await?;
        gateway.lease.touch(&token).await;
    }
    let result = gateway.rewind.rewind(request, dry_run).await?;
    Ok(Json(result))
}

pub(super) async fn steps(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<StepsRequest>,
) -> Result<Json<RewindResult>, ApiError> {
    run(&gateway, &headers, RewindRequest::Steps(req.steps), req.dry_run).await
}

pub(super) async fn percentage(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<PercentageRequest>,
) -> Result<Json<RewindResult>, ApiError> {
    run(
        &gateway,
        &headers,
        RewindRequest::Percentage(req.percentage),
        req.dry_run,
    )
    .await
}

pub(super) async fn to_waypoint(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<ToWaypointRequest>,
) -> Result<Json<RewindResult>, ApiError> {
    run(
        &gateway,
        &headers,
        RewindRequest::ToWaypoint(req.waypoint_idx),
        req.dry_run,
    )
    .await
}

pub(super) async fn to_safe(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<ToSafeRequest>,
) -> Result<Json<RewindResult>, ApiError> {
    run(&gateway, &headers, RewindRequest::ToLastSafe, req.dry_run).await
}

pub(super) async fn stop(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_lease(&gateway, &headers).await?;
    let was_rewinding = gateway.rewind.is_rewinding();
    gateway.rewind.stop();
    Ok(Json(json!({"stopped": was_rewinding})))
}

pub(super) async fn status(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let engine = gateway.rewind.status();
    let monitor = gateway.monitor.status();
    Json(json!({
        "is_rewinding": engine.is_rewinding,
        "trajectory_length": engine.trajectory_length,
        "last_safe_waypoint_idx": engine.last_safe_waypoint_idx,
        "auto_rewind_enabled": monitor.auto_rewind_enabled,
        "auto_rewind_steps": monitor.auto_rewind_steps,
        "auto_rewind_count": monitor.trigger_count,
        "last_auto_rewind_time": monitor.last_trigger_at,
    }))
}

fn config_body(config: &robogate_core::rewind::RewindConfig) -> Value {
    json!({
        "chunk_size": config.chunk_size,
        "chunk_duration": config.chunk_duration.as_secs_f64(),
        "settle_time": config.settle_time.as_secs_f64(),
        "command_rate": config.command_rate,
        "joint_tolerance": config.joint_tolerance,
        "position_tolerance": config.position_tolerance,
        "auto_rewind_enabled": config.auto_rewind_enabled,
        "auto_rewind_steps": config.auto_rewind_steps,
        "monitor_interval": config.monitor_interval.as_secs_f64(),
    })
}

pub(super) async fn get_config(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    Json(config_body(&gateway.rewind.config()))
}

pub(super) async fn put_config(
    State(gateway): State<Arc<Gateway>>,
    Json(patch): Json<ConfigPatch>,
) -> Json<Value> {
    let updated = gateway.rewind.apply_config(|config| {
        if let Some(v) = patch.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = patch.chunk_duration {
            config.chunk_duration = std::time::Duration::from_secs_f64(v.max(0.0));
        }
        if let Some(v) = patch.settle_time {
            config.settle_time = std::time::Duration::from_secs_f64(v.max(0.0));
        }
        if let Some(v) = patch.command_rate {
            config.command_rate = v;
        }
        if let Some(v) = patch.joint_tolerance {
            config.joint_tolerance = v.max(0.0);
        }
        if let Some(v) = patch.position_tolerance {
            config.position_tolerance = v.max(0.0);
        }
        if let Some(v) = patch.auto_rewind_enabled {
            config.auto_rewind_enabled = v;
        }
        if let Some(v) = patch.auto_rewind_steps {
            config.auto_rewind_steps = v;
        }
        if let Some(v) = patch.monitor_interval {
            config.monitor_interval = std::time::Duration::from_secs_f64(v.clamp(0.05, 10.0));
        }
    });
    Json(config_body(&updated))
}
