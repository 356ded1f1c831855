//! Fixed-size pool of reusable rendering contexts.
//!
//! Hosts cap how many accelerated contexts may exist at once, while a page of
//! cards may hold any number of consumers. The pool builds a fixed set of
//! slots up front and lends them out one consumer at a time:
//!
//! ```text
//!   ResourcePool::new(backend, options)
//!          │ builds N × PooledResourceSet (context + shared programs/geometry)
//!          ▼
//!   borrow(requester) ──▶ BorrowTicket ──await──▶ BorrowedSlot ──with_frame()──▶ draw
//!          ▲                                            │
//!          └──── FIFO hand-off inside release() ◀───────┘ release() / drop
//! ```
//!
//! Everything is single-threaded: the pool is an `Rc` handle and queued
//! borrows are `futures` oneshot receivers resolved synchronously by the
//! release that frees a slot. [`SoftwareBackend`] renders into CPU images and
//! supports fault injection; `GpuBackend` (feature `wgpu`) drives real devices.

mod backend;
mod cache;
mod error;
#[cfg(feature = "wgpu")]
mod gpu;
mod pool;
mod slot;
mod software;
mod ticket;
mod types;

pub use backend::{RenderBackend, EFFECT_PROGRAMS};
pub use cache::SlotCache;
pub use error::{BackendError, BorrowError, PoolError, ReleaseOutcome};
#[cfg(feature = "wgpu")]
pub use gpu::{EffectUniforms, GpuBackend, GpuContext, GpuShared};
#[cfg(feature = "wgpu")]
pub use wgpu;
pub use pool::ResourcePool;
pub use slot::{PooledResourceSet, SlotResources};
pub use software::{
    ProgramHandle, QuadGeometry, SoftwareBackend, SoftwareContext, SoftwareShared,
};
pub use ticket::{BorrowTicket, BorrowedSlot, Frame};
pub use types::{PoolOptions, PoolStats, RequesterId, SlotId, SurfaceParams};
