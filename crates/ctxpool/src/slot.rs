use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::backend::RenderBackend;
use crate::error::BackendError;
use crate::types::{RequesterId, SlotId, SurfaceParams};

/// Context plus the sub-resources that are expensive to rebuild.
pub struct SlotResources<B: RenderBackend> {
    pub context: B::Context,
    pub shared: B::Shared,
    pub size: (u32, u32),
}

pub(crate) type ResourceCell<B> = Rc<RefCell<Option<SlotResources<B>>>>;

/// One pool slot: a fully initialised context and its shared resources.
///
/// Ownership bookkeeping (`in_use`, `owner`, lease generation) lives here and
/// is only touched by the pool. The resources sit behind their own cell so a
/// borrower can draw without holding the pool's state.
pub struct PooledResourceSet<B: RenderBackend> {
    id: SlotId,
    resources: ResourceCell<B>,
    in_use: bool,
    owner: Option<RequesterId>,
    generation: u64,
}

impl<B: RenderBackend> PooledResourceSet<B> {
    /// Creates the surface and context, checks liveness, then builds the
    /// shared resources. Any failure leaves nothing allocated.
    pub(crate) fn create(
        backend: &B,
        id: SlotId,
        params: &SurfaceParams,
    ) -> Result<Self, BackendError> {
        let resources = build_resources(backend, id, params)?;
        Ok(Self {
            id,
            resources: Rc::new(RefCell::new(Some(resources))),
            in_use: false,
            owner: None,
            generation: 0,
        })
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn owner(&self) -> Option<RequesterId> {
        self.owner
    }

    pub fn is_initialized(&self) -> bool {
        self.resources
            .try_borrow()
            .map(|resources| resources.is_some())
            .unwrap_or(true)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A slot someone is drawing into right now counts as alive.
    pub(crate) fn is_alive(&self, backend: &B) -> bool {
        match self.resources.try_borrow() {
            Ok(resources) => resources
                .as_ref()
                .is_some_and(|resources| backend.is_alive(&resources.context)),
            Err(_) => true,
        }
    }

    pub(crate) fn resources(&self) -> ResourceCell<B> {
        Rc::clone(&self.resources)
    }

    /// Marks the slot as lent to `owner` and returns the new lease generation.
    pub(crate) fn assign_to(&mut self, owner: RequesterId) -> u64 {
        self.in_use = true;
        self.owner = Some(owner);
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub(crate) fn holds_lease(&self, generation: u64) -> bool {
        self.in_use && self.generation == generation
    }

    /// Frees the slot and clears its surface; no reallocation.
    pub(crate) fn release(&mut self, backend: &B) {
        self.in_use = false;
        self.owner = None;
        match self.resources.try_borrow_mut() {
            Ok(mut resources) => {
                if let Some(resources) = resources.as_mut() {
                    backend.clear(&mut resources.context);
                }
            }
            Err(_) => warn!(slot = %self.id, "surface busy during release; clear skipped"),
        }
    }

    /// Replaces a lost context with a fresh one. Only valid on a free slot.
    pub(crate) fn rebuild(&mut self, backend: &B, params: &SurfaceParams) -> Result<(), BackendError> {
        debug_assert!(!self.in_use, "rebuild on a lent slot");
        let mut cell = self
            .resources
            .try_borrow_mut()
            .map_err(|_| BackendError::Busy(self.id))?;
        if let Some(old) = cell.take() {
            backend.destroy(old.context, Some(old.shared));
        }
        *cell = Some(build_resources(backend, self.id, params)?);
        debug!(slot = %self.id, "rebuilt slot context");
        Ok(())
    }

    /// Tears down the context and shared resources. Pool shutdown only.
    pub(crate) fn destroy(&mut self, backend: &B) {
        self.in_use = false;
        self.owner = None;
        match self.resources.try_borrow_mut() {
            Ok(mut cell) => {
                if let Some(old) = cell.take() {
                    backend.destroy(old.context, Some(old.shared));
                }
            }
            Err(_) => warn!(slot = %self.id, "slot destroyed while a frame was open; context leaked"),
        }
    }
}

fn build_resources<B: RenderBackend>(
    backend: &B,
    id: SlotId,
    params: &SurfaceParams,
) -> Result<SlotResources<B>, BackendError> {
    let mut context = backend.create_context(id, params)?;
    if !backend.is_alive(&context) {
        backend.destroy(context, None);
        return Err(BackendError::ContextLost(id));
    }
    let shared = match backend.build_shared(&mut context) {
        Ok(shared) => shared,
        Err(err) => {
            backend.destroy(context, None);
            return Err(err);
        }
    };
    backend.clear(&mut context);
    Ok(SlotResources {
        context,
        shared,
        size: (params.width, params.height),
    })
}
