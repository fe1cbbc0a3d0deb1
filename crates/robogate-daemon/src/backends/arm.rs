//! Arm adapter.
//!
//! The arm controller expects targets at ~50 Hz; a single command times out
//! and the controller holds. The adapter owns the streamer: callers submit a
//! target, a background sender emits it at the configured rate until a new
//! target arrives or the adapter is stopped. Mode switches are confirmed
//! round-trips; a move command is only accepted once its mode is active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use robogate_core::command::{ArmCommand, ControlMode};
use robogate_core::config::ArmBackendConfig;
use robogate_core::state::ArmState;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BackendError, ConnectionHealth, JsonLineClient};

/// A streaming target for the background sender.
#[derive(Debug, Clone, PartialEq)]
pub enum ArmTarget {
    /// Joint positions, radians.
    Joints([f64; 7]),
    /// End-effector pose, 4x4 column-major.
    Pose([f64; 16]),
    /// Joint velocities, rad/s.
    JointVelocities([f64; 7]),
    /// Cartesian twist.
    CartesianVelocity([f64; 6]),
}

impl ArmTarget {
    fn from_command(cmd: &ArmCommand) -> Self {
        match cmd {
            ArmCommand::JointPosition { values } => Self::Joints(*values),
            ArmCommand::CartesianPose { values } => Self::Pose(*values),
            ArmCommand::JointVelocity { values } => Self::JointVelocities(*values),
            ArmCommand::CartesianVelocity { values } => Self::CartesianVelocity(*values),
        }
    }

    fn wire_values(&self) -> Vec<f64> {
        match self {
            Self::Joints(v) | Self::JointVelocities(v) => v.to_vec(),
            Self::Pose(v) => v.to_vec(),
            Self::CartesianVelocity(v) => v.to_vec(),
        }
    }
}

#[derive(Debug)]
struct SimArm {
    state: ArmState,
}

impl SimArm {
    fn apply(&mut self, target: &ArmTarget) {
        match target {
            ArmTarget::Joints(q) => {
                self.state.q = *q;
                self.state.dq = [0.0; 7];
            },
            ArmTarget::Pose(pose) => {
                self.state.ee_pose = *pose;
            },
            ArmTarget::JointVelocities(dq) => {
                self.state.dq = *dq;
            },
            ArmTarget::CartesianVelocity(_) => {},
        }
    }

    fn hold(&mut self) {
        self.state.dq = [0.0; 7];
    }
}

/// Adapter to the arm control loop.
pub struct ArmAdapter {
    cfg: ArmBackendConfig,
    dry_run: bool,
    link: Mutex<Option<JsonLineClient>>,
    sim: StdMutex<SimArm>,
    health: StdMutex<ConnectionHealth>,
    mode: StdMutex<ControlMode>,
    target_tx: watch::Sender<Option<ArmTarget>>,
    streaming: AtomicBool,
}

impl ArmAdapter {
    /// Create an adapter. `dry_run` substitutes the simulator for the wire.
    #[must_use]
    pub fn new(cfg: ArmBackendConfig, dry_run: bool) -> Self {
        let (target_tx, _) = watch::channel(None);
        Self {
            cfg,
            dry_run,
            link: Mutex::new(None),
            sim: StdMutex::new(SimArm {
                state: ArmState::default(),
            }),
            health: StdMutex::new(ConnectionHealth::default()),
            mode: StdMutex::new(ControlMode::Idle),
            target_tx,
            streaming: AtomicBool::new(false),
        }
    }

    /// Connect to the arm server (no-op beyond bookkeeping in dry-run).
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when the socket cannot be established.
    pub async fn connect(&self) -> Result<(), BackendError> {
        if self.dry_run {
            self.health.lock().expect("health lock").mark_connected();
            return Ok(());
        }
        match JsonLineClient::connect(&self.cfg.host, self.cfg.cmd_port, self.cfg.request_timeout)
            .await
        {
            Ok(client) => {
                *self.link.lock().await = Some(client);
                self.health.lock().expect("health lock").mark_connected();
                debug!(host = %self.cfg.host, port = self.cfg.cmd_port, "arm connected");
                Ok(())
            },
            Err(e) => {
                self.health.lock().expect("health lock").mark_error(&e);
                Err(e)
            },
        }
    }

    /// Drop the connection and clear any streaming target.
    pub async fn close(&self) {
        self.target_tx.send_replace(None);
        *self.link.lock().await = None;
        self.health.lock().expect("health lock").mark_disconnected();
    }

    /// Whether the adapter holds a live connection (always true in dry-run
    /// once connected).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.health.lock().expect("health lock").is_connected()
    }

    /// Connection status for health reporting.
    #[must_use]
    pub fn status(&self) -> robogate_core::state::BackendStatus {
        self.health.lock().expect("health lock").status()
    }

    /// The currently confirmed control mode.
    #[must_use]
    pub fn mode(&self) -> ControlMode {
        *self.mode.lock().expect("mode lock")
    }

    /// Switch the controller mode. Synchronous from the caller's
    /// perspective: the switch is confirmed before this returns.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the controller
    /// refuses the switch.
    pub async fn set_mode(&self, mode: ControlMode) -> Result<(), BackendError> {
        if self.mode() == mode {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }

        if !self.dry_run {
            let reply = self
                .roundtrip(&json!({"cmd": "set_mode", "mode": mode.to_string()}))
                .await?;
            if reply.get("ok").and_then(serde_json::Value::as_bool) != Some(true) {
                return Err(BackendError::Protocol(format!(
                    "mode switch refused: {reply}"
                )));
            }
        }

        // Mode changes invalidate the previous stream target.
        self.target_tx.send_replace(None);
        *self.mode.lock().expect("mode lock") = mode;
        {
            let mut sim = self.sim.lock().expect("sim lock");
            sim.state.mode = mode;
        }
        debug!(%mode, "arm mode set");
        Ok(())
    }

    /// Accept a move command: switch to its mode, then hand the target to
    /// the streamer. In dry-run the simulator reaches the target
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected.
    pub async fn command(&self, cmd: &ArmCommand) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        self.set_mode(cmd.control_mode()).await?;
        let target = ArmTarget::from_command(cmd);
        if self.dry_run {
            self.sim.lock().expect("sim lock").apply(&target);
        }
        self.target_tx.send_replace(Some(target));
        self.health.lock().expect("health lock").mark_ok();
        Ok(())
    }

    /// Replace the streaming target without re-confirming the mode. Used by
    /// the rewind engine inside a chunk, after `set_mode`.
    pub fn stream_target(&self, target: ArmTarget) {
        if self.dry_run {
            self.sim.lock().expect("sim lock").apply(&target);
        }
        self.target_tx.send_replace(Some(target));
    }

    /// Stop arm motion: clear the stream and drop to idle.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when the idle switch cannot be confirmed.
    pub async fn stop(&self) -> Result<(), BackendError> {
        self.target_tx.send_replace(None);
        self.sim.lock().expect("sim lock").hold();
        self.set_mode(ControlMode::Idle).await
    }

    /// Safety floor after failures: keep the current pose as the target so
    /// the controller holds instead of timing out. Never fails; a
    /// disconnected arm already holds on its own.
    pub async fn hold_at_current(&self) {
        if !self.is_connected() {
            return;
        }
        match self.get_state().await {
            Ok(state) => {
                self.sim.lock().expect("sim lock").hold();
                self.target_tx.send_replace(Some(ArmTarget::Joints(state.q)));
            },
            Err(e) => warn!(error = %e, "hold-at-current skipped"),
        }
    }

    /// Current arm state.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when disconnected or the reply is
    /// malformed.
    pub async fn get_state(&self) -> Result<ArmState, BackendError> {
        if !self.is_connected() {
            return Err(BackendError::NotConnected);
        }
        if self.dry_run {
            let state = self.sim.lock().expect("sim lock").state.clone();
            self.health.lock().expect("health lock").mark_ok();
            return Ok(state);
        }
        let reply = self.roundtrip(&json!({"cmd": "get_state"})).await?;
        let state: ArmState = serde_json::from_value(reply)
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        self.health.lock().expect("health lock").mark_ok();
        Ok(state)
    }

    /// Background sender: emits the latest target at the stream rate until
    /// cancelled. Spawn exactly one per adapter.
    pub async fn run_streamer(&self, cancel: CancellationToken) {
        if self.streaming.swap(true, Ordering::SeqCst) {
            warn!("arm streamer already running");
            return;
        }
        let period = std::time::Duration::from_secs_f64(1.0 / self.cfg.stream_rate.max(1.0));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut rx = self.target_tx.subscribe();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let target = rx.borrow_and_update().clone();
            let Some(target) = target else { continue };
            if self.dry_run {
                continue;
            }
            let msg = json!({"cmd": "stream", "values": target.wire_values()});
            let mut link = self.link.lock().await;
            if let Some(client) = link.as_mut() {
                if let Err(e) = client.send(&msg).await {
                    self.health.lock().expect("health lock").mark_error(&e);
                    *link = None;
                }
            }
        }
        self.streaming.store(false, Ordering::SeqCst);
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

    fn adapter() -> ArmAdapter {
        ArmAdapter::new(ArmBackendConfig::default(), true)
    }

    #[tokio::test]
    async fn test_command_requires_connection() {
        let arm = adapter();
        let cmd = ArmCommand::JointPosition {
            values: [0.0; 7],
        };
        assert!(matches!(
            arm.command(&cmd).await,
            Err(BackendError::NotConnected)
        ));

        arm.connect().await.unwrap();
        arm.command(&cmd).await.unwrap();
        assert_eq!(arm.mode(), ControlMode::JointPosition);
    }

    #[tokio::test]
    async fn test_dry_run_reaches_target() {
        let arm = adapter();
        arm.connect().await.unwrap();
        let target = [0.1, -0.7, 0.0, -2.0, 0.0, 1.5, 0.7];
        arm.command(&ArmCommand::JointPosition { values: target })
            .await
            .unwrap();
        let state = arm.get_state().await.unwrap();
        assert_eq!(state.q, target);
    }

    #[tokio::test]
    async fn test_stop_returns_to_idle() {
        let arm = adapter();
        arm.connect().await.unwrap();
        arm.command(&ArmCommand::JointVelocity {
            values: [0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        })
        .await
        .unwrap();
        arm.stop().await.unwrap();
        assert_eq!(arm.mode(), ControlMode::Idle);
        let state = arm.get_state().await.unwrap();
        assert_eq!(state.dq, [0.0; 7]);
    }
}
