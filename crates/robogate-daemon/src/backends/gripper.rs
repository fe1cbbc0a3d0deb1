//! Gripper adapter. Request/reply; every action is one round-trip.

use std::sync::Mutex as StdMutex;

use robogate_core::command::GripperCommand;
use robogate_core::config::GripperBackendConfig;
use robogate_core::state::GripperState;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BackendError, ConnectionHealth, JsonLineClient};

const OPEN_WIDTH: f64 = 0.08;

#[derive(Debug)]
struct SimGripper {
    state: GripperState,
}

impl SimGripper {
    fn apply(&mut self, cmd: &GripperCommand) {
        match cmd {
            GripperCommand::Activate | GripperCommand::Calibrate => {},
            GripperCommand::Move { width, .. } => {
                self.state.width = width.clamp(0.0, OPEN_WIDTH);
                self.state.object_detected = false;
            },
            GripperCommand::Open { .. } => {
                self.state.width = OPEN_WIDTH;
                self.state.object_detected = false;
            },
            GripperCommand::Close { .. } => {
                self.state.width = 0.0;
            },
            GripperCommand::Grasp { width, .. } => {
                self.state.width = width.clamp(0.0, OPEN_WIDTH);
                self.state.object_detected = true;
            },
            GripperCommand::Stop => {
                self.state.is_moving = false;
            },
        }
    }
}

/// Adapter to the gripper controller.
pub struct GripperAdapter {
    cfg: GripperBackendConfig,
    dry_run: bool,
    link: Mutex<Option<JsonLineClient>>,
    sim: StdMutex<SimGripper>,
    health: StdMutex<ConnectionHealth>,
}

impl GripperAdapter {
    /// Create an adapter. `dry_run` substitutes the simulator for the wire.
    #[must_use]
    pub fn new(cfg: GripperBackendConfig, dry_run: bool) -> Self {
        Self {
            cfg,
            dry_run,
            link: Mutex::new(None),
            sim: StdMutex::new(SimGripper {
                state: GripperState::default(),
            }),
            health: StdMutex::new(ConnectionHealth::default()),
        }
    }

    /// Connect to the gripper server.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when the socket cannot be established.
    pub async fn connect(&self) -> Result<(), BackendError> {
        if self.dry_run {
            self.health.lock().expect("health lock").mark_connected();
            return Ok(());
        }
        match JsonLineClient::connect(&self.cfg.host, self.cfg.port, self.cfg.request_timeout).await
        {
            Ok(client) => {
                *self.link.lock().await = Some(client);
                self.health.lock().expect("health lock").mark_connected();
                debug!(host = %self.cfg.host, port = self.cfg.port, "gripper connected");
                Ok(())
            },
            Err(e) => {
                self.health.lock().expect("health lock").mark_error(&e);
                Err(e)
            },
        }
    }

    /// Drop the connection.
    pub async fn close(&self) {
        *self.link.lock().await = None;
        self.health.lock().expect("health lock").mark_disconnected();
    }

    /// Whether the adapter holds a live connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.health.lock().expect("health lock").is_connected()
    }

    /// Connection status for health reporting.
    #[must_use]
    pub fn status(&self) -> robogate_core::state::BackendStatus {
        self.health.lock().expect("health lock").status()
    }

    /// Execute a gripper action.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the action is
    /// refused.
    pub async fn command(&self, cmd: &GripperCommand) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        if self.dry_run {
            self.sim.lock().expect("sim lock").apply(cmd);
            self.health.lock().expect("health lock").mark_ok();
            return Ok(());
        }
        let msg = serde_json::to_value(cmd)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        let reply = self.roundtrip(&json!({"cmd": "gripper", "action": msg})).await?;
        if reply.get("ok").and_then(serde_json::Value::as_bool) == Some(true) {
            self.health.lock().expect("health lock").mark_ok();
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("action refused: {reply}")))
        }
    }

    /// Current gripper state.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the reply is
    /// malformed.
    pub async fn get_state(&self) -> Result<GripperState, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        if self.dry_run {
            let state = self.sim.lock().expect("sim lock").state.clone();
            self.health.lock().expect("health lock").mark_ok();
            return Ok(state);
        }
        let reply = self.roundtrip(&json!({"cmd": "get_state"})).await?;
        let state: GripperState = serde_json::from_value(reply)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        self.health.lock().expect("health lock").mark_ok();
        Ok(state)
    }

    async fn roundtrip(&self, msg: &serde_json::Value) -> Result<serde_json::Value, BackendError> {
        let mut link = self.link.lock().await;
        let client = link.as_mut().ok_or(BackendError::NotConnected)?;
        match client.request(msg, self.cfg.request_timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.health.lock().expect("health lock").mark_error(&e);
                if matches!(e, BackendError::Io(_)) {
                    *link = None;
                }
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_actions() {
        let gripper = GripperAdapter::new(GripperBackendConfig::default(), true);
        gripper.connect().await.unwrap();

        gripper
            .command(&GripperCommand::Move {
                width: 0.03,
                speed: 0.1,
            })
            .await
            .unwrap();
        assert!((gripper.get_state().await.unwrap().width - 0.03).abs() < 1e-9);

        gripper
            .command(&GripperCommand::Grasp {
                width: 0.02,
                speed: 0.1,
                force: 20.0,
            })
            .await
            .unwrap();
        assert!(gripper.get_state().await.unwrap().object_detected);

        gripper
            .command(&GripperCommand::Open { speed: 0.1 })
            .await
            .unwrap();
        let state = gripper.get_state().await.unwrap();
        assert!((state.width - 0.08).abs() < 1e-9);
        assert!(!state.object_detected);
    }
}
