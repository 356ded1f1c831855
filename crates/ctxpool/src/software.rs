//! CPU-backed contexts for headless runs and tests.
//!
//! `SoftwareBackend` mimics a host that caps the number of live contexts and
//! may invalidate a context at any moment. Fault injection (`fail_slot`,
//! `lose_context`) lets callers exercise degraded pools and context loss
//! without a GPU.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use tracing::{debug, trace};

use crate::backend::{RenderBackend, EFFECT_PROGRAMS};
use crate::error::BackendError;
use crate::types::{SlotId, SurfaceParams};

const NOISE_SIZE: u32 = 64;
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Handle for a compiled effect program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHandle {
    pub id: u32,
    pub name: &'static str,
}

/// Fullscreen quad shared by every effect.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadGeometry {
    pub vertices: [[f32; 2]; 4],
    pub indices: [u16; 6],
}

impl Default for QuadGeometry {
    fn default() -> Self {
        Self {
            vertices: [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]],
            indices: [0, 1, 2, 0, 2, 3],
        }
    }
}

/// Shared sub-resources built once per software context.
#[derive(Debug, Clone)]
pub struct SoftwareShared {
    pub quad: QuadGeometry,
    pub programs: BTreeMap<&'static str, ProgramHandle>,
    pub noise: GrayImage,
}

impl SoftwareShared {
    pub fn program(&self, name: &str) -> Option<ProgramHandle> {
        self.programs.get(name).copied()
    }
}

/// One software "rendering context": an RGBA surface plus a liveness flag.
#[derive(Debug)]
pub struct SoftwareContext {
    slot: SlotId,
    surface: RgbaImage,
    alive: Rc<Cell<bool>>,
    clears: u64,
}

impl SoftwareContext {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut RgbaImage {
        &mut self.surface
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    /// Fills the whole surface with one colour.
    pub fn fill(&mut self, rgba: [u8; 4]) {
        for pixel in self.surface.pixels_mut() {
            *pixel = Rgba(rgba);
        }
    }

    /// Number of clears issued against this context.
    pub fn clear_count(&self) -> u64 {
        self.clears
    }

    pub fn is_blank(&self) -> bool {
        self.surface.pixels().all(|pixel| *pixel == TRANSPARENT)
    }
}

#[derive(Debug, Default)]
struct SoftwareState {
    context_limit: Option<usize>,
    failing: RefCell<HashSet<SlotId>>,
    alive_flags: RefCell<HashMap<SlotId, Rc<Cell<bool>>>>,
    live: Cell<usize>,
    peak: Cell<usize>,
    created: Cell<usize>,
    next_program: Cell<u32>,
}

/// Headless backend; clones share the same fault-injection state.
#[derive(Debug, Clone, Default)]
pub struct SoftwareBackend {
    state: Rc<SoftwareState>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulates a host ceiling on simultaneously live contexts.
    pub fn with_context_limit(limit: usize) -> Self {
        Self {
            state: Rc::new(SoftwareState {
                context_limit: Some(limit),
                ..SoftwareState::default()
            }),
        }
    }

    /// Makes context creation for `slot` fail from now on.
    pub fn fail_slot(&self, slot: SlotId) {
        self.state.failing.borrow_mut().insert(slot);
    }

    /// Lets context creation for `slot` succeed again.
    pub fn heal_slot(&self, slot: SlotId) {
        self.state.failing.borrow_mut().remove(&slot);
    }

    /// Invalidates the live context of `slot`, as a host would on GPU reset.
    pub fn lose_context(&self, slot: SlotId) -> bool {
        match self.state.alive_flags.borrow().get(&slot) {
            Some(flag) if flag.get() => {
                flag.set(false);
                debug!(%slot, "software context lost");
                true
            }
            _ => false,
        }
    }

    pub fn live_contexts(&self) -> usize {
        self.state.live.get()
    }

    pub fn peak_contexts(&self) -> usize {
        self.state.peak.get()
    }

    pub fn contexts_created(&self) -> usize {
        self.state.created.get()
    }

    fn next_program_id(&self) -> u32 {
        let id = self.state.next_program.get();
        self.state.next_program.set(id.wrapping_add(1));
        id
    }
}

impl RenderBackend for SoftwareBackend {
    type Context = SoftwareContext;
    type Shared = SoftwareShared;
    type Snapshot = RgbaImage;

    fn name(&self) -> &'static str {
        "software"
    }

    fn create_context(
        &self,
        slot: SlotId,
        params: &SurfaceParams,
    ) -> Result<Self::Context, BackendError> {
        if params.width == 0 || params.height == 0 {
            return Err(BackendError::SurfaceCreation(format!(
                "{} requested an empty surface ({}x{})",
                params.label, params.width, params.height
            )));
        }

        if self.state.failing.borrow().contains(&slot) {
            return Err(BackendError::ContextCreation(format!(
                "host refused context for {slot}"
            )));
        }

        if let Some(limit) = self.state.context_limit {
            if self.state.live.get() >= limit {
                return Err(BackendError::ContextLimit { limit });
            }
        }

        let live = self.state.live.get() + 1;
        self.state.live.set(live);
        self.state.peak.set(self.state.peak.get().max(live));
        self.state.created.set(self.state.created.get() + 1);

        let alive = Rc::new(Cell::new(true));
        self.state
            .alive_flags
            .borrow_mut()
            .insert(slot, Rc::clone(&alive));

        trace!(%slot, width = params.width, height = params.height, live, "created software context");
        Ok(SoftwareContext {
            slot,
            surface: RgbaImage::from_pixel(params.width, params.height, TRANSPARENT),
            alive,
            clears: 0,
        })
    }

    fn is_alive(&self, context: &Self::Context) -> bool {
        context.alive.get()
    }

    fn build_shared(&self, context: &mut Self::Context) -> Result<Self::Shared, BackendError> {
        if !context.alive.get() {
            return Err(BackendError::ContextLost(context.slot));
        }

        let programs = EFFECT_PROGRAMS
            .into_iter()
            .map(|name| {
                (
                    name,
                    ProgramHandle {
                        id: self.next_program_id(),
                        name,
                    },
                )
            })
            .collect();

        Ok(SoftwareShared {
            quad: QuadGeometry::default(),
            programs,
            noise: procedural_noise(NOISE_SIZE, context.slot.0 as u32),
        })
    }

    fn clear(&self, context: &mut Self::Context) {
        if !context.alive.get() {
            return;
        }
        context.fill([0, 0, 0, 0]);
        context.clears += 1;
    }

    fn resize(&self, context: &mut Self::Context, width: u32, height: u32) {
        if width == 0 || height == 0 || context.surface.dimensions() == (width, height) {
            return;
        }
        context.surface = RgbaImage::from_pixel(width, height, TRANSPARENT);
    }

    fn snapshot(&self, context: &mut Self::Context) -> Result<Self::Snapshot, BackendError> {
        if !context.alive.get() {
            return Err(BackendError::ContextLost(context.slot));
        }
        Ok(context.surface.clone())
    }

    fn destroy(&self, context: Self::Context, _shared: Option<Self::Shared>) {
        context.alive.set(false);
        let mut flags = self.state.alive_flags.borrow_mut();
        if flags
            .get(&context.slot)
            .is_some_and(|flag| Rc::ptr_eq(flag, &context.alive))
        {
            flags.remove(&context.slot);
        }
        self.state
            .live
            .set(self.state.live.get().saturating_sub(1));
        trace!(slot = %context.slot, live = self.state.live.get(), "destroyed software context");
    }
}

/// Deterministic value noise used as the shared sparkle texture.
pub(crate) fn procedural_noise(size: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        let mut h = x
            .wrapping_mul(374_761_393)
            .wrapping_add(y.wrapping_mul(668_265_263))
            .wrapping_add(seed.wrapping_mul(2_246_822_519));
        h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
        Luma([(h >> 24) as u8])
    })
}
