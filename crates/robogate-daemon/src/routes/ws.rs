//! WebSocket endpoints.
//!
//! `/ws/state` streams snapshots at the client's requested rate. The
//! underlying `watch` channel holds only the newest snapshot, so a slow
//! client conflates: it always receives the latest state, never a backlog.
//! `/ws/feedback` streams command/lease/service events; `/ws/cameras`
//! streams frame bytes. Every session closes on gateway shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::debug;

use crate::state::Gateway;

#[derive(Debug, Deserialize)]
pub(super) struct StateStreamQuery {
    /// Requested snapshot rate, Hz.
    rate: Option<f64>,
}

pub(super) async fn state_stream(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<StateStreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let rate = query
        .rate
        .filter(|r| *r > 0.0)
        .unwrap_or(gateway.config.server.observer_hz)
        .clamp(0.1, 100.0);
    ws.on_upgrade(move |socket| state_session(gateway, socket, rate))
}

async fn state_session(gateway: Arc<Gateway>, mut socket: WebSocket, rate: f64) {
    let mut snapshots = gateway.aggregator.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_seq = 0u64;

    loop {
        tokio::select! {
            () = gateway.cancel.cancelled() => break,
            incoming = socket.recv() => {
                // Clients do not need to send anything; any close ends the
                // session.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {},
                }
            },
            _ = ticker.tick() => {
                let snapshot = snapshots.borrow_and_update().clone();
                // Monotonic per subscriber: never resend an old snapshot.
                if snapshot.seq <= last_seq {
                    continue;
                }
                last_seq = snapshot.seq;
                let Ok(text) = serde_json::to_string(&*snapshot) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            },
        }
    }
    debug!("state stream session closed");
}

pub(super) async fn feedback_stream(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| feedback_session(gateway, socket))
}

async fn feedback_session(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let mut events = gateway.feedback.subscribe();

    loop {
        tokio::select! {
            () = gateway.cancel.cancelled() => break,
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {},
                }
            },
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    },
                    // A lagged subscriber skips missed events and goes on.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            },
        }
    }
    debug!("feedback session closed");
}

pub(super) async fn camera_stream(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| camera_session(gateway, socket))
}

async fn camera_session(gateway: Arc<Gateway>, mut socket: WebSocket) {
    let mut frames = gateway.cameras.subscribe();

    loop {
        tokio::select! {
            () = gateway.cancel.cancelled() => break,
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {},
                }
            },
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {},
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            },
        }
    }
    debug!("camera session closed");
}
