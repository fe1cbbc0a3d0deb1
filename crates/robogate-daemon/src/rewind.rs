//! Rewind engine.
//!
//! Executes reverse replay against the adapters: the recorded trajectory is
//! read back newest-first, partitioned into same-kind chunks, and each
//! chunk is driven through the matching adapter. Arm chunks stream
//! interpolated targets at the configured rate; base chunks are absolute
//! pose targets with a settle wait; gripper widths are discrete. Adjacent
//! arm/base chunks whose source times overlap are driven concurrently and
//! both must finish before the replay advances.
//!
//! Only one rewind can be active per process; a second start fails
//! immediately with `busy`. Every target passes the safety envelope before
//! issue, a rejection aborts with the partial count, and `stop()` cancels
//! cooperatively between waypoints, leaving the arm holding and the base
//! stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use robogate_core::command::ControlMode;
use robogate_core::rewind::{
    cubic_ease_in_out, interpolate_joints, plan_chunks, Chunk, ResolveError, RewindConfig,
    RewindRequest, RewindResult,
};
use robogate_core::safety::SafetyEnvelope;
use robogate_core::trajectory::{TrajectoryRecorder, Waypoint, WaypointKind, WaypointSource};
use robogate_core::GatewayError;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backends::{ArmAdapter, ArmTarget, BaseAdapter, GripperAdapter};

/// Public status of the rewind engine.
#[derive(Debug, Clone, Serialize)]
pub struct RewindStatus {
    /// Whether a replay is active right now.
    pub is_rewinding: bool,
    /// Recorded trajectory length.
    pub trajectory_length: usize,
    /// Index of the most recent waypoint inside the envelope, if any.
    pub last_safe_waypoint_idx: Option<usize>,
}

/// Why a chunk run ended early.
enum Interrupt {
    Cancelled,
    Safety(String),
    Backend(String),
}

/// Drives reverse replay through the adapters.
pub struct RewindEngine {
    arm: Arc<ArmAdapter>,
    base: Arc<BaseAdapter>,
    gripper: Arc<GripperAdapter>,
    recorder: Arc<StdMutex<TrajectoryRecorder>>,
    safety: SafetyEnvelope,
    config: StdMutex<RewindConfig>,
    /// Process-wide exclusivity. `try_lock` failure means busy.
    active: Mutex<()>,
    is_rewinding: AtomicBool,
    cancel_slot: StdMutex<Option<CancellationToken>>,
}

impl RewindEngine {
    /// Create an engine over the adapters and the shared recorder.
    #[must_use]
    pub fn new(
        arm: Arc<ArmAdapter>,
        base: Arc<BaseAdapter>,
        gripper: Arc<GripperAdapter>,
        recorder: Arc<StdMutex<TrajectoryRecorder>>,
        safety: SafetyEnvelope,
        config: RewindConfig,
    ) -> Self {
        Self {
            arm,
            base,
            gripper,
            recorder,
            safety,
            config: StdMutex::new(config),
            active: Mutex::new(()),
            is_rewinding: AtomicBool::new(false),
            cancel_slot: StdMutex::new(None),
        }
    }

    /// Whether a replay is active.
    #[must_use]
    pub fn is_rewinding(&self) -> bool {
        self.is_rewinding.load(Ordering::SeqCst)
    }

    /// A copy of the current configuration.
    #[must_use]
    pub fn config(&self) -> RewindConfig {
        self.config.lock().expect("config lock").clone()
    }

    /// Mutate the configuration in place, then clamp it to valid ranges.
    pub fn apply_config(&self, mutate: impl FnOnce(&mut RewindConfig)) -> RewindConfig {
        let mut config = self.config.lock().expect("config lock");
        mutate(&mut config);
        config.sanitize();
        config.clone()
    }

    /// Engine status.
    #[must_use]
    pub fn status(&self) -> RewindStatus {
        let (trajectory_length, last_safe) = {
            let recorder = self.recorder.lock().expect("recorder lock");
            (recorder.len(), self.find_last_safe(&recorder))
        };
        RewindStatus {
            is_rewinding: self.is_rewinding(),
            trajectory_length,
            last_safe_waypoint_idx: last_safe,
        }
    }

    /// Cancel the active replay, if any. The replay notices between
    /// waypoints, stops the arm and base, and returns in the stopped state.
    pub fn stop(&self) {
        if let Some(token) = self.cancel_slot.lock().expect("cancel slot").as_ref() {
            token.cancel();
        }
    }

    /// Execute a rewind.
    ///
    /// With `dry_run` every validation and timing step runs but no adapter
    /// call is made; the result carries the full target preview.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Busy`] when a replay is already active, and
    /// [`GatewayError::InvalidArgument`] for unresolvable requests.
    pub async fn rewind(
        &self,
        request: RewindRequest,
        dry_run: bool,
    ) -> Result<RewindResult, GatewayError> {
        let Ok(_guard) = self.active.try_lock() else {
            return Err(GatewayError::Busy);
        };

        let cfg = self.config();
        let (len, reversed) = {
            let recorder = self.recorder.lock().expect("recorder lock");
            let len = recorder.len();
            let last_safe = self.find_last_safe(&recorder);
            let steps = request.resolve(len, last_safe).map_err(|e| match e {
                ResolveError::InvalidRequest(msg) => GatewayError::InvalidArgument(msg),
                ResolveError::NoSafeWaypoint => {
                    GatewayError::InvalidArgument("no safe waypoint recorded".to_string())
                },
            })?;
            (len, recorder.reverse_slice(steps))
        };

        if reversed.is_empty() {
            return Ok(RewindResult {
                success: true,
                ..RewindResult::default()
            });
        }

        let cancel = CancellationToken::new();
        *self.cancel_slot.lock().expect("cancel slot") = Some(cancel.clone());
        self.is_rewinding.store(true, Ordering::SeqCst);
        info!(steps = reversed.len(), dry_run, "rewind started");

        let outcome = self.run_replay(&reversed, &cfg, dry_run, &cancel).await;

        self.is_rewinding.store(false, Ordering::SeqCst);
        *self.cancel_slot.lock().expect("cancel slot") = None;

        let (executed, targets, interrupt) = outcome;
        let mut result = RewindResult {
            success: interrupt.is_none(),
            steps_rewound: executed,
            start_index: Some(len - 1),
            end_index: if executed > 0 { Some(len - executed) } else { None },
            targets,
            stopped: false,
            error: None,
        };

        match interrupt {
            None => info!(steps = executed, "rewind complete"),
            Some(Interrupt::Cancelled) => {
                result.stopped = true;
                result.error = Some("stopped".to_string());
                warn!(steps = executed, "rewind stopped");
                self.settle_safe().await;
            },
            Some(Interrupt::Safety(reason)) => {
                result.error = Some(reason.clone());
                warn!(steps = executed, reason, "rewind aborted by envelope");
                self.settle_safe().await;
            },
            Some(Interrupt::Backend(message)) => {
                result.error = Some(message.clone());
                warn!(steps = executed, message, "rewind aborted by backend");
                self.settle_safe().await;
            },
        }
        Ok(result)
    }

    async fn run_replay(
        &self,
        reversed: &[Waypoint],
        cfg: &RewindConfig,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> (usize, Vec<WaypointKind>, Option<Interrupt>) {
        let chunks = plan_chunks(reversed, cfg.chunk_size);
        let mut executed = 0usize;
        let mut targets = Vec::new();
        let mut i = 0usize;

        while i < chunks.len() {
            if cancel.is_cancelled() {
                return (executed, targets, Some(Interrupt::Cancelled));
            }

            let chunk = &chunks[i];
            // An arm chunk and a base chunk recorded at the same source
            // time replay together; both must finish before advancing.
            let paired = chunks.get(i + 1).filter(|next| {
                chunk.overlaps(next)
                    && ((chunk.is_arm() && next.is_base()) || (chunk.is_base() && next.is_arm()))
            });

            let outcome = if let Some(pair) = paired {
                let (a, b) = tokio::join!(
                    self.run_chunk(chunk, cfg, dry_run, cancel),
                    self.run_chunk(pair, cfg, dry_run, cancel),
                );
                let (a_count, mut a_targets, a_int) = a;
                let (b_count, b_targets, b_int) = b;
                a_targets.extend(b_targets);
                (a_count + b_count, a_targets, a_int.or(b_int))
            } else {
                self.run_chunk(chunk, cfg, dry_run, cancel).await
            };

            let (count, chunk_targets, interrupt) = outcome;
            executed += count;
            targets.extend(chunk_targets);
            if interrupt.is_some() {
                return (executed, targets, interrupt);
            }

            i += if paired.is_some() { 2 } else { 1 };

            if i < chunks.len() && !cfg.settle_time.is_zero() {
                tokio::select! {
                    () = cancel.cancelled() => {
                        return (executed, targets, Some(Interrupt::Cancelled));
                    },
                    () = tokio::time::sleep(cfg.settle_time) => {},
                }
            }
        }

        (executed, targets, None)
    }

    async fn run_chunk(
        &self,
        chunk: &Chunk,
        cfg: &RewindConfig,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> (usize, Vec<WaypointKind>, Option<Interrupt>) {
        // Validate the whole chunk against the envelope before any motion.
        for wp in &chunk.waypoints {
            if let Err(v) = self.validate_target(&wp.kind) {
                return (0, Vec::new(), Some(Interrupt::Safety(v)));
            }
        }

        let per_waypoint = cfg
            .chunk_duration
            .div_f64(chunk.waypoints.len().max(1) as f64);

        let mut executed = 0usize;
        let mut targets = Vec::new();

        for wp in &chunk.waypoints {
            if cancel.is_cancelled() {
                return (executed, targets, Some(Interrupt::Cancelled));
            }
            let result = match &wp.kind {
                WaypointKind::ArmJoint(q) => {
                    self.replay_arm_joint(*q, per_waypoint, cfg, dry_run, cancel)
                        .await
                },
                WaypointKind::ArmCartesian(pose) => {
                    self.replay_arm_pose(*pose, per_waypoint, cfg, dry_run, cancel)
                        .await
                },
                WaypointKind::BasePose(pose) => self.replay_base(*pose, cfg, dry_run).await,
                WaypointKind::GripperWidth(width) => self.replay_gripper(*width, dry_run).await,
            };

            if let Err(interrupt) = result {
                return (executed, targets, Some(interrupt));
            }

            if !dry_run {
                self.recorder
                    .lock()
                    .expect("recorder lock")
                    .record(wp.kind.clone(), WaypointSource::Rewind);
            }
            targets.push(wp.kind.clone());
            executed += 1;
        }

        (executed, targets, None)
    }

    async fn replay_arm_joint(
        &self,
        target: [f64; 7],
        duration: Duration,
        cfg: &RewindConfig,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupt> {
        if !dry_run {
            self.arm
                .set_mode(ControlMode::JointPosition)
                .await
                .map_err(|e| Interrupt::Backend(e.to_string()))?;
        }

        let start = if dry_run {
            target
        } else {
            self.arm
                .get_state()
                .await
                .map_err(|e| Interrupt::Backend(e.to_string()))?
                .q
        };

        let tick = Duration::from_secs_f64(1.0 / cfg.command_rate.max(1.0));
        let steps = (duration.as_secs_f64() / tick.as_secs_f64()).ceil().max(1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let steps = steps as u64;

        for step in 1..=steps {
            if cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            #[allow(clippy::cast_precision_loss)]
            let alpha = cubic_ease_in_out(step as f64 / steps as f64);
            if !dry_run {
                let q = interpolate_joints(&start, &target, alpha);
                self.arm.stream_target(ArmTarget::Joints(q));

                // Early out once the reported state is within tolerance.
                if let Ok(state) = self.arm.get_state().await {
                    if robogate_core::rewind::joints_reached(
                        &state.q,
                        &target,
                        cfg.joint_tolerance,
                    ) {
                        return Ok(());
                    }
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Interrupt::Cancelled),
                () = tokio::time::sleep(tick) => {},
            }
        }
        Ok(())
    }

    async fn replay_arm_pose(
        &self,
        target: [f64; 16],
        duration: Duration,
        cfg: &RewindConfig,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupt> {
        if !dry_run {
            self.arm
                .set_mode(ControlMode::CartesianPose)
                .await
                .map_err(|e| Interrupt::Backend(e.to_string()))?;
            self.arm.stream_target(ArmTarget::Pose(target));
        }
        let tick = Duration::from_secs_f64(1.0 / cfg.command_rate.max(1.0));
        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            tokio::select! {
                () = cancel.cancelled() => return Err(Interrupt::Cancelled),
                () = tokio::time::sleep(tick) => elapsed += tick,
            }
        }
        Ok(())
    }

    async fn replay_base(
        &self,
        pose: [f64; 3],
        cfg: &RewindConfig,
        dry_run: bool,
    ) -> Result<(), Interrupt> {
        if !dry_run {
            self.base
                .move_to(pose[0], pose[1], pose[2])
                .await
                .map_err(|e| Interrupt::Backend(e.to_string()))?;
        }
        // Settle: give the base time to come to rest on the target.
        if !cfg.settle_time.is_zero() {
            tokio::time::sleep(cfg.settle_time).await;
        }
        Ok(())
    }

    async fn replay_gripper(&self, width: f64, dry_run: bool) -> Result<(), Interrupt> {
        if dry_run {
            return Ok(());
        }
        self.gripper
            .command(&robogate_core::command::GripperCommand::Move { width, speed: 0.1 })
            .await
            .map_err(|e| Interrupt::Backend(e.to_string()))
    }

    fn validate_target(&self, kind: &WaypointKind) -> Result<(), String> {
        match kind {
            WaypointKind::ArmJoint(q) => self
                .safety
                .check_arm(&robogate_core::command::ArmCommand::JointPosition { values: *q })
                .map(|_| ())
                .map_err(|v| v.reason),
            WaypointKind::ArmCartesian(pose) => self
                .safety
                .check_arm(&robogate_core::command::ArmCommand::CartesianPose { values: *pose })
                .map(|_| ())
                .map_err(|v| v.reason),
            WaypointKind::BasePose(pose) => self
                .safety
                .check_base_position(pose[0], pose[1])
                .map_err(|v| v.reason),
            WaypointKind::GripperWidth(_) => Ok(()),
        }
    }

    fn find_last_safe(&self, recorder: &TrajectoryRecorder) -> Option<usize> {
        let snapshot = recorder.snapshot();
        snapshot
            .iter()
            .enumerate()
            .rev()
            .find(|(_, wp)| self.validate_target(&wp.kind).is_ok())
            .map(|(i, _)| i)
    }

    /// Leave the robot safe after a stop or abort: arm holds, base stops.
    async fn settle_safe(&self) {
        self.arm.hold_at_current().await;
        if let Err(e) = self.base.stop().await {
            warn!(error = %e, "base stop after rewind interruption failed");
        }
    }
}
