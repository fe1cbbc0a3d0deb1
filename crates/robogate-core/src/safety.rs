//! Safety envelope.
//!
//! A pure validator applied to every mutating command before it reaches an
//! adapter. Velocities and gripper forces are clamped to their caps; position
//! targets that leave the workspace are rejected outright, never silently
//! moved.

use serde::{Deserialize, Serialize};

use crate::command::{ArmCommand, BaseCommand, GripperCommand};

/// Workspace, velocity, and force bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Arm workspace box minimum `[x, y, z]` in the base frame, meters.
    #[serde(default = "default_arm_workspace_min")]
    pub arm_workspace_min: [f64; 3],
    /// Arm workspace box maximum `[x, y, z]`, meters.
    #[serde(default = "default_arm_workspace_max")]
    pub arm_workspace_max: [f64; 3],
    /// Base workspace box minimum `[x, y]`, meters.
    #[serde(default = "default_base_workspace_min")]
    pub base_workspace_min: [f64; 2],
    /// Base workspace box maximum `[x, y]`, meters.
    #[serde(default = "default_base_workspace_max")]
    pub base_workspace_max: [f64; 2],
    /// Per-joint position lower limits, radians.
    #[serde(default = "default_joint_min")]
    pub arm_joint_min: [f64; 7],
    /// Per-joint position upper limits, radians.
    #[serde(default = "default_joint_max")]
    pub arm_joint_max: [f64; 7],
    /// Per-joint velocity cap, rad/s.
    #[serde(default = "default_arm_max_joint_vel")]
    pub arm_max_joint_vel: f64,
    /// Cartesian linear velocity cap, m/s.
    #[serde(default = "default_arm_max_linear_vel")]
    pub arm_max_linear_vel: f64,
    /// Base linear velocity cap, m/s.
    #[serde(default = "default_base_max_linear_vel")]
    pub base_max_linear_vel: f64,
    /// Base angular velocity cap, rad/s.
    #[serde(default = "default_base_max_angular_vel")]
    pub base_max_angular_vel: f64,
    /// Gripper force cap, newtons.
    #[serde(default = "default_gripper_max_force")]
    pub gripper_max_force: f64,
}

const fn default_arm_workspace_min() -> [f64; 3] {
    [-0.8, -0.8, 0.0]
}

const fn default_arm_workspace_max() -> [f64; 3] {
    [0.8, 0.8, 1.2]
}

const fn default_base_workspace_min() -> [f64; 2] {
    [-5.0, -5.0]
}

const fn default_base_workspace_max() -> [f64; 2] {
    [5.0, 5.0]
}

const fn default_joint_min() -> [f64; 7] {
    [-2.8973, -1.7628, -2.8973, -3.0718, -2.8973, -0.0175, -2.8973]
}

const fn default_joint_max() -> [f64; 7] {
    [2.8973, 1.7628, 2.8973, -0.0698, 2.8973, 3.7525, 2.8973]
}

const fn default_arm_max_joint_vel() -> f64 {
    2.0
}

const fn default_arm_max_linear_vel() -> f64 {
    0.5
}

const fn default_base_max_linear_vel() -> f64 {
    0.5
}

const fn default_base_max_angular_vel() -> f64 {
    1.57
}

const fn default_gripper_max_force() -> f64 {
    70.0
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            arm_workspace_min: default_arm_workspace_min(),
            arm_workspace_max: default_arm_workspace_max(),
            base_workspace_min: default_base_workspace_min(),
            base_workspace_max: default_base_workspace_max(),
            arm_joint_min: default_joint_min(),
            arm_joint_max: default_joint_max(),
            arm_max_joint_vel: default_arm_max_joint_vel(),
            arm_max_linear_vel: default_arm_max_linear_vel(),
            base_max_linear_vel: default_base_max_linear_vel(),
            base_max_angular_vel: default_base_max_angular_vel(),
            gripper_max_force: default_gripper_max_force(),
        }
    }
}

/// A rejected command, with a stable reason and a human-readable detail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}: {detail}")]
pub struct SafetyViolation {
    /// Stable machine-readable reason, e.g. `safety:z_out_of_bounds`.
    pub reason: String,
    /// What exceeded which bound.
    pub detail: String,
}

impl SafetyViolation {
    /// Build a violation from a reason code and detail text.
    #[must_use]
    pub fn new(reason: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: detail.into(),
        }
    }
}

/// Outcome of a passing check: the command, possibly with clamped fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Checked<T> {
    /// The command passed unchanged.
    Pass(T),
    /// Velocities or forces were clamped to their caps.
    Clamped(T),
}

impl<T> Checked<T> {
    /// The validated command, clamped or not.
    pub fn into_inner(self) -> T {
        match self {
            Self::Pass(cmd) | Self::Clamped(cmd) => cmd,
        }
    }

    /// Whether clamping was applied.
    #[must_use]
    pub const fn was_clamped(&self) -> bool {
        matches!(self, Self::Clamped(_))
    }
}

const AXES: [&str; 3] = ["x", "y", "z"];

/// The envelope validator. All checks are pure.
#[derive(Debug, Clone, Default)]
pub struct SafetyEnvelope {
    cfg: SafetyConfig,
}

impl SafetyEnvelope {
    /// Create an envelope over the given bounds.
    #[must_use]
    pub const fn new(cfg: SafetyConfig) -> Self {
        Self { cfg }
    }

    /// The configured bounds.
    #[must_use]
    pub const fn config(&self) -> &SafetyConfig {
        &self.cfg
    }

    /// Validate an arm command.
    ///
    /// # Errors
    ///
    /// Returns a [`SafetyViolation`] when a position target leaves the joint
    /// limits or the workspace box.
    pub fn check_arm(&self, cmd: &ArmCommand) -> Result<Checked<ArmCommand>, SafetyViolation> {
        match cmd {
            ArmCommand::JointPosition { values } => {
                for (i, q) in values.iter().enumerate() {
                    if *q < self.cfg.arm_joint_min[i] || *q > self.cfg.arm_joint_max[i] {
                        return Err(SafetyViolation::new(
                            "safety:joint_limit",
                            format!(
                                "joint {i} target {q:.3} rad outside [{:.3}, {:.3}]",
                                self.cfg.arm_joint_min[i], self.cfg.arm_joint_max[i]
                            ),
                        ));
                    }
                }
                Ok(Checked::Pass(cmd.clone()))
            },
            ArmCommand::CartesianPose { values } => {
                // Column-major transform: translation at 12, 13, 14.
                let pos = [values[12], values[13], values[14]];
                for (i, axis) in AXES.iter().enumerate() {
                    if pos[i] < self.cfg.arm_workspace_min[i]
                        || pos[i] > self.cfg.arm_workspace_max[i]
                    {
                        return Err(SafetyViolation::new(
                            format!("safety:{axis}_out_of_bounds"),
                            format!(
                                "end-effector {axis}={:.3} outside [{:.3}, {:.3}]",
                                pos[i], self.cfg.arm_workspace_min[i], self.cfg.arm_workspace_max[i]
                            ),
                        ));
                    }
                }
                Ok(Checked::Pass(cmd.clone()))
            },
            ArmCommand::JointVelocity { values } => {
                let cap = self.cfg.arm_max_joint_vel;
                let mut clamped = *values;
                let mut any = false;
                for v in &mut clamped {
                    if v.abs() > cap {
                        *v = v.signum() * cap;
                        any = true;
                    }
                }
                let out = ArmCommand::JointVelocity { values: clamped };
                Ok(if any {
                    Checked::Clamped(out)
                } else {
                    Checked::Pass(out)
                })
            },
            ArmCommand::CartesianVelocity { values } => {
                let lin = (values[0].powi(2) + values[1].powi(2) + values[2].powi(2)).sqrt();
                let cap = self.cfg.arm_max_linear_vel;
                if lin > cap {
                    let scale = cap / lin;
                    let mut v = *values;
                    for c in v.iter_mut().take(3) {
                        *c *= scale;
                    }
                    return Ok(Checked::Clamped(ArmCommand::CartesianVelocity { values: v }));
                }
                Ok(Checked::Pass(cmd.clone()))
            },
        }
    }

    /// Validate a base command.
    ///
    /// # Errors
    ///
    /// Returns a [`SafetyViolation`] when a pose target leaves the base
    /// workspace box.
    pub fn check_base(&self, cmd: &BaseCommand) -> Result<Checked<BaseCommand>, SafetyViolation> {
        match cmd {
            BaseCommand::Pose { x, y, theta } => {
                self.check_base_position(*x, *y)?;
                Ok(Checked::Pass(BaseCommand::Pose {
                    x: *x,
                    y: *y,
                    theta: *theta,
                }))
            },
            BaseCommand::Velocity { vx, vy, wz, frame } => {
                let mut vx = *vx;
                let mut vy = *vy;
                let mut wz = *wz;
                let mut any = false;

                let lin = vx.hypot(vy);
                if lin > self.cfg.base_max_linear_vel {
                    let scale = self.cfg.base_max_linear_vel / lin;
                    vx *= scale;
                    vy *= scale;
                    any = true;
                }
                if wz.abs() > self.cfg.base_max_angular_vel {
                    wz = wz.signum() * self.cfg.base_max_angular_vel;
                    any = true;
                }

                let out = BaseCommand::Velocity {
                    vx,
                    vy,
                    wz,
                    frame: *frame,
                };
                Ok(if any {
                    Checked::Clamped(out)
                } else {
                    Checked::Pass(out)
                })
            },
        }
    }

    /// Validate a gripper command, clamping the grasp force to its cap.
    ///
    /// Gripper commands have no position bounds; this never rejects.
    pub fn check_gripper(&self, cmd: &GripperCommand) -> Checked<GripperCommand> {
        if let GripperCommand::Grasp {
            width,
            speed,
            force,
        } = cmd
        {
            if *force > self.cfg.gripper_max_force {
                return Checked::Clamped(GripperCommand::Grasp {
                    width: *width,
                    speed: *speed,
                    force: self.cfg.gripper_max_force,
                });
            }
        }
        Checked::Pass(cmd.clone())
    }

    /// Check a bare base position against the workspace box.
    ///
    /// # Errors
    ///
    /// Returns a [`SafetyViolation`] naming the offending axis.
    pub fn check_base_position(&self, x: f64, y: f64) -> Result<(), SafetyViolation> {
        let pos = [x, y];
        for i in 0..2 {
            if pos[i] < self.cfg.base_workspace_min[i] || pos[i] > self.cfg.base_workspace_max[i] {
                return Err(SafetyViolation::new(
                    format!("safety:{}_out_of_bounds", AXES[i]),
                    format!(
                        "base {}={:.2} outside [{:.2}, {:.2}]",
                        AXES[i], pos[i], self.cfg.base_workspace_min[i],
                        self.cfg.base_workspace_max[i]
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Check an end-effector position against the arm workspace box.
    ///
    /// # Errors
    ///
    /// Returns a [`SafetyViolation`] naming the offending axis.
    pub fn check_ee_position(&self, pos: &[f64; 3]) -> Result<(), SafetyViolation> {
        for (i, axis) in AXES.iter().enumerate() {
            if pos[i] < self.cfg.arm_workspace_min[i] || pos[i] > self.cfg.arm_workspace_max[i] {
                return Err(SafetyViolation::new(
                    format!("safety:{axis}_out_of_bounds"),
                    format!(
                        "end-effector {axis}={:.3} outside [{:.3}, {:.3}]",
                        pos[i], self.cfg.arm_workspace_min[i], self.cfg.arm_workspace_max[i]
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IDENTITY_POSE;

    fn pose_at(x: f64, y: f64, z: f64) -> ArmCommand {
        let mut values = IDENTITY_POSE;
        values[12] = x;
        values[13] = y;
        values[14] = z;
        ArmCommand::CartesianPose { values }
    }

    #[test]
    fn test_cartesian_pose_inside_box_passes() {
        let envelope = SafetyEnvelope::default();
        assert!(envelope.check_arm(&pose_at(0.5, 0.0, 0.3)).is_ok());
    }

    #[test]
    fn test_cartesian_pose_above_z_max_rejected() {
        let envelope = SafetyEnvelope::default();
        let err = envelope.check_arm(&pose_at(0.5, 0.0, 5.0)).unwrap_err();
        assert_eq!(err.reason, "safety:z_out_of_bounds");
    }

    #[test]
    fn test_joint_limit_rejected_not_clamped() {
        let envelope = SafetyEnvelope::default();
        let mut q = crate::state::HOME_JOINTS;
        q[0] = 3.5;
        let err = envelope
            .check_arm(&ArmCommand::JointPosition { values: q })
            .unwrap_err();
        assert_eq!(err.reason, "safety:joint_limit");
    }

    #[test]
    fn test_joint_velocity_clamped() {
        let envelope = SafetyEnvelope::default();
        let checked = envelope
            .check_arm(&ArmCommand::JointVelocity {
                values: [5.0, -5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            })
            .unwrap();
        assert!(checked.was_clamped());
        match checked.into_inner() {
            ArmCommand::JointVelocity { values } => {
                assert!((values[0] - 2.0).abs() < 1e-9);
                assert!((values[1] + 2.0).abs() < 1e-9);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_base_velocity_scaled_preserving_direction() {
        let envelope = SafetyEnvelope::default();
        let checked = envelope
            .check_base(&BaseCommand::Velocity {
                vx: 3.0,
                vy: 4.0,
                wz: 0.0,
                frame: crate::command::BaseFrame::Global,
            })
            .unwrap();
        assert!(checked.was_clamped());
        match checked.into_inner() {
            BaseCommand::Velocity { vx, vy, .. } => {
                let lin = vx.hypot(vy);
                assert!((lin - 0.5).abs() < 1e-9);
                // Direction preserved: 3:4 ratio.
                assert!((vy / vx - 4.0 / 3.0).abs() < 1e-9);
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_base_pose_out_of_bounds_rejected() {
        let envelope = SafetyEnvelope::default();
        let err = envelope
            .check_base(&BaseCommand::Pose {
                x: 6.0,
                y: 0.0,
                theta: 0.0,
            })
            .unwrap_err();
        assert_eq!(err.reason, "safety:x_out_of_bounds");
    }

    #[test]
    fn test_gripper_force_clamped() {
        let envelope = SafetyEnvelope::default();
        let checked = envelope.check_gripper(&GripperCommand::Grasp {
            width: 0.02,
            speed: 0.1,
            force: 500.0,
        });
        assert!(checked.was_clamped());
        match checked.into_inner() {
            GripperCommand::Grasp { force, .. } => assert!((force - 70.0).abs() < f64::EPSILON),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
