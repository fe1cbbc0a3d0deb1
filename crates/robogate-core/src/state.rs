//! Aggregated robot state.
//!
//! The aggregator composes per-backend readings into an immutable
//! [`Snapshot`]. Snapshots are never partially updated: the publisher builds
//! a complete value and swaps it in, so readers either see the previous
//! snapshot or the new one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::ControlMode;

/// Joint-space home position used by the dry-run simulator.
pub const HOME_JOINTS: [f64; 7] = [0.0, -0.785, 0.0, -2.356, 0.0, 1.571, 0.785];

/// Identity transform, column-major.
pub const IDENTITY_POSE: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Arm reading: joint positions/velocities and end-effector pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    /// Joint positions, radians.
    pub q: [f64; 7],
    /// Joint velocities, rad/s.
    pub dq: [f64; 7],
    /// End-effector pose in the base frame, 4x4 column-major.
    pub ee_pose: [f64; 16],
    /// Active controller mode.
    pub mode: ControlMode,
}

impl Default for ArmState {
    fn default() -> Self {
        Self {
            q: HOME_JOINTS,
            dq: [0.0; 7],
            ee_pose: IDENTITY_POSE,
            mode: ControlMode::Idle,
        }
    }
}

/// Mobile-base reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BaseState {
    /// Odometry pose `[x, y, theta]`.
    pub pose: [f64; 3],
    /// Velocity `[vx, vy, wz]`.
    pub velocity: [f64; 3],
}

/// Gripper reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GripperState {
    /// Jaw width, meters.
    pub width: f64,
    /// Whether the jaws are in motion.
    pub is_moving: bool,
    /// Whether an object is held.
    pub object_detected: bool,
}

impl Default for GripperState {
    fn default() -> Self {
        Self {
            width: 0.08,
            is_moving: false,
            object_detected: false,
        }
    }
}

/// Connection status of one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BackendStatus {
    /// Whether the adapter currently holds a live connection.
    pub connected: bool,
    /// Last successful round-trip or state read.
    pub last_ok_at: Option<DateTime<Utc>>,
    /// Most recent error, if any.
    pub last_error: Option<String>,
}

/// Per-backend connection statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BackendStatuses {
    pub arm: BackendStatus,
    pub base: BackendStatus,
    pub gripper: BackendStatus,
    pub cameras: BackendStatus,
}

/// A subsystem value plus a staleness marker. When a backend is
/// disconnected its slot keeps the last known value with `stale = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Stamped<T> {
    /// Last known reading.
    pub state: T,
    /// True when the backing poll has not succeeded recently.
    pub stale: bool,
}

/// Immutable composite of the most recent per-backend states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    /// Monotonically increasing publish counter.
    pub seq: u64,
    /// Wall-clock publish time.
    pub timestamp: DateTime<Utc>,
    pub arm: Stamped<ArmState>,
    pub base: Stamped<BaseState>,
    pub gripper: Stamped<GripperState>,
    pub backends: BackendStatuses,
    /// Whether any motor is in significant motion.
    pub motors_moving: bool,
}

/// Velocity magnitude below which a motor counts as stationary.
const MOTION_EPSILON: f64 = 0.01;

impl Snapshot {
    /// Derive the motion flag from the current readings.
    #[must_use]
    pub fn compute_motors_moving(&self) -> bool {
        self.arm.state.dq.iter().any(|v| v.abs() > MOTION_EPSILON)
            || self.gripper.state.is_moving
            || self
                .base
                .state
                .velocity
                .iter()
                .any(|v| v.abs() > MOTION_EPSILON)
    }
}

/// End-effector position in the world frame, composing the base odometry
/// pose with the arm's base-frame end-effector pose.
#[must_use]
pub fn world_ee_position(base_pose: &[f64; 3], ee_pose: &[f64; 16]) -> [f64; 3] {
    let (x, y, theta) = (base_pose[0], base_pose[1], base_pose[2]);
    let (c, s) = (theta.cos(), theta.sin());
    // Column-major: translation is elements 12, 13, 14.
    let (ex, ey, ez) = (ee_pose[12], ee_pose[13], ee_pose[14]);
    [x + c * ex - s * ey, y + s * ex + c * ey, ez]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motors_moving_from_joint_velocity() {
        let mut snap = Snapshot::default();
        assert!(!snap.compute_motors_moving());

        snap.arm.state.dq[2] = 0.5;
        assert!(snap.compute_motors_moving());
    }

    #[test]
    fn test_motors_moving_from_base_velocity() {
        let mut snap = Snapshot::default();
        snap.base.state.velocity = [0.2, 0.0, 0.0];
        assert!(snap.compute_motors_moving());
    }

    #[test]
    fn test_world_ee_position_identity_base() {
        let mut ee = IDENTITY_POSE;
        ee[12] = 0.5;
        ee[14] = 0.3;
        let pos = world_ee_position(&[0.0, 0.0, 0.0], &ee);
        assert!((pos[0] - 0.5).abs() < 1e-9);
        assert!((pos[1]).abs() < 1e-9);
        assert!((pos[2] - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_world_ee_position_rotated_base() {
        let mut ee = IDENTITY_POSE;
        ee[12] = 1.0;
        // Base at (1, 0) facing +y: the arm's +x points along world +y.
        let pos = world_ee_position(&[1.0, 0.0, std::f64::consts::FRAC_PI_2], &ee);
        assert!((pos[0] - 1.0).abs() < 1e-9);
        assert!((pos[1] - 1.0).abs() < 1e-9);
    }
}
