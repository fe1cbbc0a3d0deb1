//! Mobile-base adapter. Request/reply at ~10-50 Hz; one operation is one
//! round-trip.

use std::sync::Mutex as StdMutex;

use robogate_core::command::BaseFrame;
use robogate_core::config::BaseBackendConfig;
use robogate_core::state::BaseState;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BackendError, ConnectionHealth, JsonLineClient};

#[derive(Debug, Default)]
struct SimBase {
    state: BaseState,
}

/// Adapter to the base RPC server.
pub struct BaseAdapter {
    cfg: BaseBackendConfig,
    dry_run: bool,
    link: Mutex<Option<JsonLineClient>>,
    sim: StdMutex<SimBase>,
    health: StdMutex<ConnectionHealth>,
}

impl BaseAdapter {
    /// Create an adapter. `dry_run` substitutes the simulator for the wire.
    #[must_use]
    pub fn new(cfg: BaseBackendConfig, dry_run: bool) -> Self {
        Self {
            cfg,
            dry_run,
            link: Mutex::new(None),
            sim: StdMutex::new(SimBase::default()),
            health: StdMutex::new(ConnectionHealth::default()),
        }
    }

    /// Connect to the base server.
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
                debug!(host = %self.cfg.host, port = self.cfg.port, "base connected");
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

    /// Move to an absolute pose. One round-trip; the base ramps on its own.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the move is refused.
    pub async fn move_to(&self, x: f64, y: f64, theta: f64) -> Result<(), BackendError> {
        if self.dry_run {
            if !self.is_connected() {
                return Err(BackendError::NotConnected);
            }
            let mut sim = self.sim.lock().expect("sim lock");
            sim.state.pose = [x, y, theta];
            sim.state.velocity = [0.0; 3];
            self.health.lock().expect("health lock").mark_ok();
            return Ok(());
        }
        self.ok_roundtrip(&json!({"cmd": "move_to", "pose": [x, y, theta]}))
            .await
    }

    /// Hold a velocity until replaced or stopped.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected.
    pub async fn set_velocity(
        &self,
        vx: f64,
        vy: f64,
        wz: f64,
        frame: BaseFrame,
    ) -> Result<(), BackendError> {
        if self.dry_run {
            if !self.is_connected() {
                return Err(BackendError::NotConnected);
            }
            self.sim.lock().expect("sim lock").state.velocity = [vx, vy, wz];
            self.health.lock().expect("health lock").mark_ok();
            return Ok(());
        }
        let frame = match frame {
            BaseFrame::Global => "global",
            BaseFrame::Local => "local",
        };
        self.ok_roundtrip(&json!({"cmd": "set_velocity", "velocity": [vx, vy, wz], "frame": frame}))
            .await
    }

    /// Zero the base velocity. The safety floor on any failed command.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected.
    pub async fn stop(&self) -> Result<(), BackendError> {
        if self.dry_run {
            if !self.is_connected() {
                return Err(BackendError::NotConnected);
            }
            self.sim.lock().expect("sim lock").state.velocity = [0.0; 3];
            return Ok(());
        }
        self.ok_roundtrip(&json!({"cmd": "stop"})).await
    }

    /// Current base state.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the reply is
    /// malformed.
    pub async fn get_state(&self) -> Result<BaseState, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        if self.dry_run {
            let state = self.sim.lock().expect("sim lock").state.clone();
            self.health.lock().expect("health lock").mark_ok();
            return Ok(state);
        }
        let reply = self.roundtrip(&json!({"cmd": "get_state"})).await?;
        let state: BaseState = serde_json::from_value(reply)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        self.health.lock().expect("health lock").mark_ok();
        Ok(state)
    }

    async fn ok_roundtrip(&self, msg: &serde_json::Value) -> Result<(), BackendError> {
        let reply = self.roundtrip(msg).await?;
        if reply.get("ok").and_then(serde_json::Value::as_bool) == Some(true) {
            self.health.lock().expect("health lock").mark_ok();
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("request refused: {reply}")))
        }
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
    async fn test_dry_run_pose_and_stop() {
        let base = BaseAdapter::new(BaseBackendConfig::default(), true);
        base.connect().await.unwrap();

        base.move_to(1.0, 2.0, 0.5).await.unwrap();
        let state = base.get_state().await.unwrap();
        assert_eq!(state.pose, [1.0, 2.0, 0.5]);

        base.set_velocity(0.2, 0.0, 0.1, BaseFrame::Global)
            .await
            .unwrap();
        assert_eq!(base.get_state().await.unwrap().velocity, [0.2, 0.0, 0.1]);

        base.stop().await.unwrap();
        assert_eq!(base.get_state().await.unwrap().velocity, [0.0; 3]);
    }

    #[tokio::test]
    async fn test_disconnected_command_fails() {
        let base = BaseAdapter::new(BaseBackendConfig::default(), true);
        assert!(matches!(
            base.move_to(0.0, 0.0, 0.0).await,
            Err(BackendError::NotConnected)
        ));
    }
}
