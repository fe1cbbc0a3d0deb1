//! Lease errors.

/// Errors from lease operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    /// The presented token does not match the current lease.
    #[error("presented token does not match the current lease")]
    NotHolder,

    /// No queue entry exists for the given ticket.
    #[error("unknown ticket: {0}")]
    UnknownTicket(String),
}
