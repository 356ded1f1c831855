use std::fmt;

use ctxpool::RequesterId;
use serde::Serialize;

/// Cards borrow slots under their own id.
pub type CardId = RequesterId;

/// Where a card is in its lazy-activation lifecycle.
///
/// A card holds a pool slot only while `StaticRendering`, `Activating` or
/// `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    WaitingIntersection,
    StaticRendering,
    StaticRendered,
    Activating,
    Active,
    Deactivating,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 7] = [
        Self::Idle,
        Self::WaitingIntersection,
        Self::StaticRendering,
        Self::StaticRendered,
        Self::Activating,
        Self::Active,
        Self::Deactivating,
    ];

    pub fn may_hold_slot(self) -> bool {
        matches!(
            self,
            Self::StaticRendering | Self::Activating | Self::Active
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WaitingIntersection => "waiting_intersection",
            Self::StaticRendering => "static_rendering",
            Self::StaticRendered => "static_rendered",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
        };
        f.write_str(name)
    }
}

/// What the card currently shows on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presentation {
    /// Nothing rendered yet.
    Placeholder,
    /// The cached snapshot.
    Still,
    /// Frames from a live slot.
    Live,
}

/// Diagnostics emitted by [`crate::CardHost`].
#[derive(Debug, Clone, PartialEq)]
pub enum CardEvent {
    StateChanged {
        card: CardId,
        from: LifecycleState,
        to: LifecycleState,
    },
    Failed {
        card: CardId,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("unknown card {0}")]
    UnknownCard(CardId),
    #[error(transparent)]
    Scheduler(#[from] scheduler::SchedulerError),
    #[error("failed to spawn card task: {0}")]
    Spawn(#[from] futures::task::SpawnError),
}
