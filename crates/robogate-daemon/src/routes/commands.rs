//! Command endpoints: lease check, safety envelope, adapter dispatch,
//! waypoint recording, feedback events.
//!
//! A waypoint is recorded only after the adapter accepted the command, and
//! only for position-type targets. On any dispatch failure the robot is
//! left safe: the arm holds at its current pose, the base gets zero
//! velocity.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use robogate_core::command::{ArmCommand, BaseCommand, GripperCommand};
use robogate_core::trajectory::WaypointKind;
use robogate_core::GatewayError;
use serde_json::{json, Value};

use super::{command_source, require_lease, short_id, ApiError};
use crate::state::Gateway;

pub(super) async fn arm_move(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(cmd): Json<ArmCommand>,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let cmd_id = short_id();
    gateway.feedback.cmd_ack(&cmd_id);

    // Safety first: a rejection means no adapter call and no waypoint.
    let cmd = gateway
        .safety
        .check_arm(&cmd)
        .map_err(GatewayError::from)?
        .into_inner();

    if let Err(e) = gateway.arm.command(&cmd).await {
        gateway.arm.hold_at_current().await;
        gateway.feedback.cmd_result(&cmd_id, "failed");
        return Err(ApiError(e.into()));
    }

    let waypoint = match &cmd {
        ArmCommand::JointPosition { values } => Some(WaypointKind::ArmJoint(*values)),
        ArmCommand::CartesianPose { values } => Some(WaypointKind::ArmCartesian(*values)),
        _ => None,
    };
    if let Some(kind) = waypoint {
        gateway
            .recorder
            .lock()
            .expect("recorder lock")
            .record(kind, command_source(&headers));
    }

    gateway.lease.touch(&token).await;
    gateway.feedback.cmd_result(&cmd_id, "completed");
    Ok(Json(json!({"cmd_id": cmd_id, "status": "completed"})))
}

pub(super) async fn arm_stop(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let cmd_id = short_id();
    gateway
        .arm
        .stop()
        .await
        .map_err(GatewayError::from)?;
    gateway.lease.touch(&token).await;
    Ok(Json(json!({"cmd_id": cmd_id, "status": "completed"})))
}

pub(super) async fn base_move(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(cmd): Json<BaseCommand>,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let cmd_id = short_id();
    gateway.feedback.cmd_ack(&cmd_id);

    let cmd = gateway
        .safety
        .check_base(&cmd)
        .map_err(GatewayError::from)?
        .into_inner();

    let result = match &cmd {
        BaseCommand::Pose { x, y, theta } => gateway.base.move_to(*x, *y, *theta).await,
        BaseCommand::Velocity { vx, vy, wz, frame } => {
            gateway.base.set_velocity(*vx, *vy, *wz, *frame).await
        },
    };
    if let Err(e) = result {
        let _ = gateway.base.stop().await;
        gateway.feedback.cmd_result(&cmd_id, "failed");
        return Err(ApiError(e.into()));
    }

    if let BaseCommand::Pose { x, y, theta } = &cmd {
        gateway
            .recorder
            .lock()
            .expect("recorder lock")
            .record(
                WaypointKind::BasePose([*x, *y, *theta]),
                command_source(&headers),
            );
    }

    gateway.lease.touch(&token).await;
    gateway.feedback.cmd_result(&cmd_id, "completed");
    Ok(Json(json!({"cmd_id": cmd_id, "status": "completed"})))
}

pub(super) async fn base_stop(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let cmd_id = short_id();
    gateway
        .base
        .stop()
        .await
        .map_err(GatewayError::from)?;
    gateway.lease.touch(&token).await;
    Ok(Json(json!({"cmd_id": cmd_id, "status": "completed"})))
}

pub(super) async fn gripper(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(cmd): Json<GripperCommand>,
) -> Result<Json<Value>, ApiError> {
    let token = require_lease(&gateway, &headers).await?;
    let cmd_id = short_id();
    gateway.feedback.cmd_ack(&cmd_id);

    // Gripper checks only clamp (force); they never reject.
    let cmd = gateway.safety.check_gripper(&cmd).into_inner();

    if let Err(e) = gateway.gripper.command(&cmd).await {
        gateway.feedback.cmd_result(&cmd_id, "failed");
        return Err(ApiError(e.into()));
    }

    if let Some(width) = cmd.target_width() {
        gateway
            .recorder
            .lock()
            .expect("recorder lock")
            .record(WaypointKind::GripperWidth(width), command_source(&headers));
    }

    gateway.lease.touch(&token).await;
    gateway.feedback.cmd_result(&cmd_id, "completed");
    Ok(Json(json!({"cmd_id": cmd_id, "status": "completed"})))
}
