use std::fmt;
use std::time::Duration;

use poolconfig::CardPoolConfig;
use serde::Serialize;

/// Stable identifier of a pool slot.
///
/// Ids are assigned from the slot's position in the initial build order, so a
/// pool whose second slot failed to initialise reports ids `0, 2, 3, ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Opaque identity of whoever borrows a slot. Only ever compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequesterId(pub u64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Parameters used when creating the drawing surface behind each slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceParams {
    /// Surface width in physical pixels.
    pub width: u32,
    /// Surface height in physical pixels.
    pub height: u32,
    /// Whether the surface keeps an alpha channel for compositing over the page.
    pub transparent: bool,
    /// Label used in backend debug output.
    pub label: String,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            width: 320,
            height: 448,
            transparent: true,
            label: "card surface".to_string(),
        }
    }
}

/// Construction options for [`crate::ResourcePool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Number of slots to attempt to build.
    pub size: usize,
    /// Surface parameters shared by every slot.
    pub surface: SurfaceParams,
    /// Optional safety net for queued borrows; `None` waits indefinitely.
    pub borrow_timeout: Option<Duration>,
}

impl PoolOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn from_config(config: &CardPoolConfig) -> Self {
        Self {
            size: config.pool.size,
            surface: SurfaceParams {
                width: config.pool.width,
                height: config.pool.height,
                ..SurfaceParams::default()
            },
            borrow_timeout: config.pool.borrow_timeout,
        }
    }

    pub fn with_borrow_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_timeout = Some(timeout);
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 8,
            surface: SurfaceParams::default(),
            borrow_timeout: None,
        }
    }
}

/// Diagnostic counters reported by [`crate::ResourcePool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Slots that initialised successfully.
    pub total: usize,
    /// Slots currently lent out.
    pub in_use: usize,
    /// Free slots that pass the liveness check.
    pub available: usize,
    /// Slots whose context has been lost or destroyed.
    pub invalid: usize,
    /// Borrow requests waiting for a slot.
    pub queue_length: usize,
}
