//! Backend adapters.
//!
//! Each adapter is a typed client to one backend server: the arm control
//! loop (streaming), the base RPC server (request/reply), the gripper
//! controller (request/reply), and the camera streams. Wire protocols are
//! opaque newline-delimited JSON; the adapters only care about connect,
//! typed requests, and state reads.
//!
//! Every adapter carries a dry-run simulator that integrates commanded
//! targets into plausible state, so the whole gateway is exercisable
//! without hardware. A command sent while disconnected fails with
//! `backend_unavailable`; that is never fatal to the gateway.

mod arm;
mod base;
mod cameras;
mod gripper;
mod wire;

use chrono::Utc;
use robogate_core::state::BackendStatus;

pub use arm::{ArmAdapter, ArmTarget};
pub use base::BaseAdapter;
pub use cameras::CameraAdapter;
pub use gripper::GripperAdapter;
pub use wire::JsonLineClient;

/// Adapter-level errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The adapter holds no live connection.
    #[error("backend not connected")]
    NotConnected,

    /// A round-trip exceeded its timeout.
    #[error("backend request timed out")]
    Timeout,

    /// Socket-level failure.
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend replied with something unexpected.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl From<BackendError> for robogate_core::GatewayError {
    fn from(e: BackendError) -> Self {
        Self::BackendUnavailable(e.to_string())
    }
}

/// Shared connection bookkeeping behind each adapter.
#[derive(Debug, Default)]
pub(crate) struct ConnectionHealth {
    connected: bool,
    last_ok_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

impl ConnectionHealth {
    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
        self.last_ok_at = Some(Utc::now());
        self.last_error = None;
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    pub(crate) fn mark_ok(&mut self) {
        self.last_ok_at = Some(Utc::now());
    }

    pub(crate) fn mark_error(&mut self, err: &BackendError) {
        self.last_error = Some(err.to_string());
        if matches!(err, BackendError::Io(_) | BackendError::NotConnected) {
            self.connected = false;
        }
    }

    pub(crate) const fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn status(&self) -> BackendStatus {
        BackendStatus {
            connected: self.connected,
            last_ok_at: self.last_ok_at,
            last_error: self.last_error.clone(),
        }
    }
}
