//! Lease endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use robogate_core::lease::AcquireOutcome;
use robogate_core::GatewayError;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiError;
use crate::state::Gateway;

#[derive(Debug, Deserialize)]
pub(super) struct AcquireRequest {
    holder: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct LeaseIdRequest {
    lease_id: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct TicketRequest {
    ticket_id: String,
}

pub(super) async fn acquire(
    State(gateway): State<Arc<Gateway>>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.holder.is_empty() {
        return Err(GatewayError::InvalidArgument("holder must not be empty".to_string()).into());
    }
    let body = match gateway.lease.acquire(&req.holder).await {
        AcquireOutcome::Granted { lease_id } => {
            json!({"status": "granted", "lease_id": lease_id})
        },
        AcquireOutcome::Queued {
            ticket_id,
            position,
        } => json!({"status": "queued", "ticket_id": ticket_id, "position": position}),
    };
    Ok(Json(body))
}

pub(super) async fn release(
    State(gateway): State<Arc<Gateway>>,
    Json(req): Json<LeaseIdRequest>,
) -> Result<Json<Value>, ApiError> {
    gateway
        .lease
        .release(&req.lease_id)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(json!({"status": "released"})))
}

pub(super) async fn extend(
    State(gateway): State<Arc<Gateway>>,
    Json(req): Json<LeaseIdRequest>,
) -> Result<Json<Value>, ApiError> {
    gateway
        .lease
        .extend(&req.lease_id)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(json!({"status": "extended"})))
}

pub(super) async fn cancel(
    State(gateway): State<Arc<Gateway>>,
    Json(req): Json<TicketRequest>,
) -> Result<Json<Value>, ApiError> {
    gateway
        .lease
        .cancel(&req.ticket_id)
        .await
        .map_err(GatewayError::from)?;
    Ok(Json(json!({"status": "cancelled"})))
}

pub(super) async fn status(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let status = gateway.lease.status().await;
    Json(serde_json::to_value(status).unwrap_or_else(|_| json!({})))
}
