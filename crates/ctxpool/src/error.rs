use std::time::Duration;

use crate::types::{RequesterId, SlotId};

/// Failures raised while creating or using a backend context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to create drawing surface: {0}")]
    SurfaceCreation(String),
    #[error("failed to create rendering context: {0}")]
    ContextCreation(String),
    #[error("host refused a new context; limit of {limit} live contexts reached")]
    ContextLimit { limit: usize },
    #[error("rendering context for {0} was lost")]
    ContextLost(SlotId),
    #[error("failed to build shared resources: {0}")]
    ResourceCreation(String),
    #[error("failed to read back surface: {0}")]
    Readback(String),
    #[error("{0} is busy inside another frame")]
    Busy(SlotId),
}

/// Fatal pool construction failures.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool size must be greater than zero")]
    InvalidSize,
    #[error("none of the {requested} requested slots could be initialised")]
    NoUsableSlots {
        requested: usize,
        failures: Vec<(SlotId, BackendError)>,
    },
}

/// Rejections delivered to a borrow ticket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BorrowError {
    #[error("borrow request was cancelled")]
    Cancelled,
    #[error("borrow request timed out after {waited:?}")]
    TimedOut { waited: Duration },
    #[error("borrow already pending for {0}")]
    AlreadyPending(RequesterId),
    #[error("{requester} already holds {slot}")]
    AlreadyHolding { requester: RequesterId, slot: SlotId },
    #[error("resource pool has been shut down")]
    PoolClosed,
}

impl BorrowError {
    /// Cancellation and timeouts are ordinary control flow for consumers.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut { .. })
    }
}

/// Result of a release call.
///
/// Anything other than [`ReleaseOutcome::Released`] is a caller bug that the
/// pool logs and ignores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    UnknownSlot,
    NotOwner,
    /// The handle's lease ended earlier (force release or a re-lend).
    Stale,
    Closed,
}

impl ReleaseOutcome {
    pub fn is_released(self) -> bool {
        matches!(self, Self::Released)
    }
}
