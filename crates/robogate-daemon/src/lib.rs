//! robogate-daemon - hardware-control gateway.
//!
//! A single network-visible process mediating between remote agents and a
//! physical robot (7-DoF arm, holonomic base, parallel-jaw gripper,
//! cameras). Agents connect over HTTP/WebSocket; the daemon translates
//! requests into backend commands, aggregates telemetry into unified
//! snapshots, enforces the safety envelope, and records motion history that
//! can be replayed in reverse.
//!
//! Module map:
//!
//! - [`backends`] — typed adapters to the arm/base/gripper/camera servers,
//!   each with a dry-run simulator.
//! - [`aggregator`] — per-backend pollers feeding a conflated snapshot
//!   channel.
//! - [`rewind`] — the reverse-replay engine driving the adapters.
//! - [`executor`] — sandboxed command-script execution in a child process.
//! - [`services`] — lifecycle runtime for dependent backend processes.
//! - [`monitor`] — background envelope monitor that triggers auto-rewind.
//! - [`routes`] — the axum HTTP + WebSocket surface.
//! - [`state`] — the `Gateway` dependency-injection record and lifecycle.

pub mod aggregator;
pub mod backends;
pub mod executor;
pub mod feedback;
pub mod monitor;
pub mod rewind;
pub mod routes;
pub mod services;
pub mod state;

pub use state::Gateway;
