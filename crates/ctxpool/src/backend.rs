use crate::error::BackendError;
use crate::types::{SlotId, SurfaceParams};

/// Effect programs compiled once per slot and shared by every borrower.
pub const EFFECT_PROGRAMS: [&str; 5] = ["tilt", "holographic", "foil", "parallax", "composite"];

/// Host-specific rendering contexts behind the pool.
///
/// A backend knows how to create a surface plus context for a slot, how to
/// tell whether that context is still usable, and how to build the expensive
/// sub-resources (geometry, programs, procedural textures) that every consumer
/// of the slot reuses. The pool never inspects any of these values.
pub trait RenderBackend {
    /// Surface plus context handle owned by one slot.
    type Context;
    /// Geometry, compiled programs, and shared textures for one context.
    type Shared;
    /// Captured still image of a surface.
    type Snapshot: Clone;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn create_context(
        &self,
        slot: SlotId,
        params: &SurfaceParams,
    ) -> Result<Self::Context, BackendError>;

    /// Liveness check: false once the host invalidated the context.
    fn is_alive(&self, context: &Self::Context) -> bool;

    fn build_shared(&self, context: &mut Self::Context) -> Result<Self::Shared, BackendError>;

    /// Resets the surface to transparent.
    fn clear(&self, context: &mut Self::Context);

    /// Resizes the backing surface in place. Callers clear before drawing again.
    fn resize(&self, context: &mut Self::Context, width: u32, height: u32);

    fn snapshot(&self, context: &mut Self::Context) -> Result<Self::Snapshot, BackendError>;

    /// Releases the context and whatever shared resources were built for it.
    fn destroy(&self, context: Self::Context, shared: Option<Self::Shared>);
}
