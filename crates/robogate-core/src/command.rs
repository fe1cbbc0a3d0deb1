//! Typed command payloads for the three mutating subsystems.
//!
//! Command bodies carry a discriminator (`mode` for the arm, `action` for the
//! gripper) with mode-dependent shapes. They are modeled as tagged variants
//! with per-variant fields fixed at compile time, so unknown modes and wrong
//! arities are rejected during deserialization rather than deep inside a
//! handler.

use serde::{Deserialize, Serialize};

/// Arm controller modes.
///
/// Setting the mode is a precondition for any arm move; the adapter confirms
/// the switch before the next command is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Controller holds position and accepts no motion commands.
    #[default]
    Idle,
    /// Streaming joint-space position targets.
    JointPosition,
    /// Streaming Cartesian end-effector pose targets.
    CartesianPose,
    /// Streaming joint-space velocity targets.
    JointVelocity,
    /// Streaming Cartesian velocity targets.
    CartesianVelocity,
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::JointPosition => write!(f, "joint_position"),
            Self::CartesianPose => write!(f, "cartesian_pose"),
            Self::JointVelocity => write!(f, "joint_velocity"),
            Self::CartesianVelocity => write!(f, "cartesian_velocity"),
        }
    }
}

/// An arm motion command. The `mode` field selects the variant and fixes the
/// arity of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ArmCommand {
    /// Absolute joint positions, radians.
    JointPosition {
        /// One target angle per joint.
        values: [f64; 7],
    },
    /// Absolute end-effector pose as a 4x4 column-major transform.
    CartesianPose {
        /// Flattened transform; translation lives at elements 12, 13, 14.
        values: [f64; 16],
    },
    /// Joint velocities, rad/s.
    JointVelocity {
        /// One velocity per joint.
        values: [f64; 7],
    },
    /// Cartesian twist: linear m/s then angular rad/s.
    CartesianVelocity {
        /// `[vx, vy, vz, wx, wy, wz]`.
        values: [f64; 6],
    },
}

impl ArmCommand {
    /// The controller mode this command requires.
    #[must_use]
    pub const fn control_mode(&self) -> ControlMode {
        match self {
            Self::JointPosition { .. } => ControlMode::JointPosition,
            Self::CartesianPose { .. } => ControlMode::CartesianPose,
            Self::JointVelocity { .. } => ControlMode::JointVelocity,
            Self::CartesianVelocity { .. } => ControlMode::CartesianVelocity,
        }
    }

    /// Whether this is a position-type target (recorded as a waypoint) as
    /// opposed to a velocity command.
    #[must_use]
    pub const fn is_positional(&self) -> bool {
        matches!(self, Self::JointPosition { .. } | Self::CartesianPose { .. })
    }
}

/// Reference frame for base velocity commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaseFrame {
    /// World/odometry frame.
    #[default]
    Global,
    /// Robot-local frame.
    Local,
}

/// A mobile-base command: either an absolute pose target or a velocity.
///
/// The two shapes are distinguished by their required fields, so a body with
/// `vx`/`vy`/`wz` parses as a velocity and one with `x`/`y`/`theta` as a
/// pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BaseCommand {
    /// Velocity command, held until replaced or stopped.
    Velocity {
        /// Linear velocity x, m/s.
        vx: f64,
        /// Linear velocity y, m/s.
        vy: f64,
        /// Angular velocity, rad/s.
        wz: f64,
        /// Frame the velocity is expressed in.
        #[serde(default)]
        frame: BaseFrame,
    },
    /// Absolute pose target in the world frame.
    Pose {
        /// Target x, meters.
        x: f64,
        /// Target y, meters.
        y: f64,
        /// Target heading, radians.
        theta: f64,
    },
}

impl BaseCommand {
    /// Whether this is a pose target (recorded as a waypoint).
    #[must_use]
    pub const fn is_positional(&self) -> bool {
        matches!(self, Self::Pose { .. })
    }
}

const fn default_speed() -> f64 {
    0.1
}

const fn default_force() -> f64 {
    20.0
}

const fn default_width() -> f64 {
    0.04
}

/// A parallel-jaw gripper command, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GripperCommand {
    /// Activate/initialize the gripper.
    Activate,
    /// Calibrate the width range.
    Calibrate,
    /// Move jaws to a width.
    Move {
        /// Target width, meters.
        width: f64,
        /// Jaw speed, m/s.
        #[serde(default = "default_speed")]
        speed: f64,
    },
    /// Open fully.
    Open {
        /// Jaw speed, m/s.
        #[serde(default = "default_speed")]
        speed: f64,
    },
    /// Close fully.
    Close {
        /// Jaw speed, m/s.
        #[serde(default = "default_speed")]
        speed: f64,
    },
    /// Close until an object is grasped with bounded force.
    Grasp {
        /// Expected object width, meters.
        #[serde(default = "default_width")]
        width: f64,
        /// Jaw speed, m/s.
        #[serde(default = "default_speed")]
        speed: f64,
        /// Grasp force, newtons. Clamped by the safety envelope.
        #[serde(default = "default_force")]
        force: f64,
    },
    /// Stop jaw motion.
    Stop,
}

impl GripperCommand {
    /// Target width for recording purposes, when the action implies one.
    #[must_use]
    pub fn target_width(&self) -> Option<f64> {
        match self {
            Self::Move { width, .. } | Self::Grasp { width, .. } => Some(*width),
            Self::Open { .. } => Some(0.08),
            Self::Close { .. } => Some(0.0),
            Self::Activate | Self::Calibrate | Self::Stop => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_command_mode_tag() {
        let cmd: ArmCommand = serde_json::from_str(
            r#"{"mode":"joint_position","values":[0,-0.785,0,-2.356,0,1.571,0.785]}"#,
        )
        .unwrap();
        assert_eq!(cmd.control_mode(), ControlMode::JointPosition);
        assert!(cmd.is_positional());
    }

    #[test]
    fn test_arm_command_unknown_mode_rejected() {
        let result: Result<ArmCommand, _> =
            serde_json::from_str(r#"{"mode":"teleport","values":[1,2,3]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_arm_command_wrong_arity_rejected() {
        let result: Result<ArmCommand, _> =
            serde_json::from_str(r#"{"mode":"joint_position","values":[0.0,0.0,0.0]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_base_command_shapes() {
        let pose: BaseCommand = serde_json::from_str(r#"{"x":1.0,"y":0.5,"theta":0.0}"#).unwrap();
        assert!(pose.is_positional());

        let vel: BaseCommand = serde_json::from_str(r#"{"vx":0.2,"vy":0.0,"wz":0.1}"#).unwrap();
        assert!(!vel.is_positional());
        match vel {
            BaseCommand::Velocity { frame, .. } => assert_eq!(frame, BaseFrame::Global),
            BaseCommand::Pose { .. } => panic!("parsed as pose"),
        }
    }

    #[test]
    fn test_gripper_defaults() {
        let cmd: GripperCommand = serde_json::from_str(r#"{"action":"grasp"}"#).unwrap();
        match cmd {
            GripperCommand::Grasp {
                width,
                speed,
                force,
            } => {
                assert!((width - 0.04).abs() < f64::EPSILON);
                assert!((speed - 0.1).abs() < f64::EPSILON);
                assert!((force - 20.0).abs() < f64::EPSILON);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_gripper_unknown_action_rejected() {
        let result: Result<GripperCommand, _> = serde_json::from_str(r#"{"action":"launch"}"#);
        assert!(result.is_err());
    }
}
