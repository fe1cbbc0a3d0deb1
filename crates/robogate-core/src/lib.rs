//! Core domain logic for the robogate hardware-control gateway.
//!
//! This crate holds the pieces of the gateway that are independent of any
//! transport or process wiring:
//!
//! - **Commands & state**: typed command payloads with mode discriminators,
//!   and the aggregated robot state snapshot.
//! - **Safety envelope**: a pure validator that clamps or rejects commands
//!   against workspace, velocity, and force bounds.
//! - **Trajectory recorder**: a bounded, append-only ring of executed
//!   waypoints.
//! - **Lease coordinator**: single-holder exclusive access with a FIFO
//!   queue, idle/TTL revocation, and constant-time token checks.
//! - **Rewind planning**: chunking and interpolation for reverse replay of
//!   recorded motion.
//! - **Service registry**: the supervisor state machine for dependent
//!   backend processes.
//!
//! The daemon crate (`robogate-daemon`) owns all I/O: backend sockets,
//! process spawning, and the HTTP/WebSocket surface.

pub mod command;
pub mod config;
pub mod error;
pub mod lease;
pub mod rewind;
pub mod safety;
pub mod state;
pub mod supervisor;
pub mod trajectory;

pub use command::{ArmCommand, BaseCommand, BaseFrame, ControlMode, GripperCommand};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use lease::{AcquireOutcome, LeaseConfig, LeaseCoordinator, LeaseEvent, LeaseStatus};
pub use rewind::{RewindConfig, RewindRequest, RewindResult};
pub use safety::{SafetyConfig, SafetyEnvelope, SafetyViolation};
pub use state::{ArmState, BaseState, GripperState, Snapshot};
pub use supervisor::{ServiceDefinition, ServiceRegistry, ServiceState};
pub use trajectory::{TrajectoryRecorder, Waypoint, WaypointKind, WaypointSource};
