use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::backend::RenderBackend;
use crate::cache::{SharedSlotCache, SlotCache};
use crate::error::{BackendError, BorrowError, ReleaseOutcome};
use crate::pool::ResourcePool;
use crate::slot::{ResourceCell, SlotResources};
use crate::types::{RequesterId, SlotId};

pub(crate) type BorrowResult<B> = Result<BorrowedSlot<B>, BorrowError>;

/// Pending result of [`ResourcePool::borrow`].
///
/// Resolves immediately when a slot was free at call time, otherwise once a
/// release hands a slot over, or with an error when the request is cancelled,
/// times out, or the pool shuts down.
#[must_use = "dropping a ticket abandons the borrow"]
pub struct BorrowTicket<B: RenderBackend> {
    state: TicketState<B>,
}

enum TicketState<B: RenderBackend> {
    Ready(Option<BorrowResult<B>>),
    Waiting(oneshot::Receiver<BorrowResult<B>>),
}

impl<B: RenderBackend> BorrowTicket<B> {
    pub(crate) fn ready(result: BorrowResult<B>) -> Self {
        Self {
            state: TicketState::Ready(Some(result)),
        }
    }

    pub(crate) fn waiting(receiver: oneshot::Receiver<BorrowResult<B>>) -> Self {
        Self {
            state: TicketState::Waiting(receiver),
        }
    }

    /// True when the request is sitting in the pool's wait queue.
    pub fn is_queued(&self) -> bool {
        matches!(self.state, TicketState::Waiting(_))
    }

    /// Non-blocking check for callers outside an executor.
    ///
    /// Returns `None` while the request is still queued.
    pub fn try_take(&mut self) -> Option<BorrowResult<B>> {
        match &mut self.state {
            TicketState::Ready(result) => result.take(),
            TicketState::Waiting(receiver) => match receiver.try_recv() {
                Ok(Some(result)) => Some(result),
                Ok(None) => None,
                Err(oneshot::Canceled) => Some(Err(BorrowError::PoolClosed)),
            },
        }
    }
}

impl<B: RenderBackend> Future for BorrowTicket<B> {
    type Output = BorrowResult<B>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            TicketState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(BorrowError::Cancelled)))
            }
            TicketState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(BorrowError::PoolClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<B: RenderBackend> fmt::Debug for BorrowTicket<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowTicket")
            .field("queued", &self.is_queued())
            .finish()
    }
}

/// A slot lent to one requester.
///
/// Releasing is bound to the slot, the requester, and the lease generation,
/// so a handle can never free a slot it no longer owns. Dropping an
/// unreleased handle releases it.
pub struct BorrowedSlot<B: RenderBackend> {
    pool: ResourcePool<B>,
    slot: SlotId,
    requester: RequesterId,
    generation: u64,
    resources: ResourceCell<B>,
    cache: SharedSlotCache,
    released: bool,
}

impl<B: RenderBackend> BorrowedSlot<B> {
    pub(crate) fn new(
        pool: ResourcePool<B>,
        slot: SlotId,
        requester: RequesterId,
        generation: u64,
        resources: ResourceCell<B>,
        cache: SharedSlotCache,
    ) -> Self {
        Self {
            pool,
            slot,
            requester,
            generation,
            resources,
            cache,
            released: false,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    /// Whether this handle still owns its slot.
    pub fn is_current(&self) -> bool {
        !self.released && self.pool.lease_is_current(self.slot, self.generation)
    }

    /// Liveness check: the lease is current and the context was not lost.
    pub fn is_alive(&self) -> bool {
        if !self.is_current() {
            return false;
        }
        match self.resources.try_borrow() {
            Ok(resources) => resources
                .as_ref()
                .is_some_and(|resources| self.pool.backend().is_alive(&resources.context)),
            Err(_) => true,
        }
    }

    /// Runs `draw` against the slot's context, shared resources, and cache.
    ///
    /// Fails with [`BackendError::ContextLost`] when the lease ended or the
    /// context is gone; callers should drop the slot and borrow a fresh one.
    pub fn with_frame<R>(
        &self,
        draw: impl FnOnce(&mut Frame<'_, B>) -> R,
    ) -> Result<R, BackendError> {
        if !self.is_current() {
            return Err(BackendError::ContextLost(self.slot));
        }
        let backend = self.pool.backend();
        let mut resources = self
            .resources
            .try_borrow_mut()
            .map_err(|_| BackendError::Busy(self.slot))?;
        let resources = match resources.as_mut() {
            Some(resources) if backend.is_alive(&resources.context) => resources,
            _ => return Err(BackendError::ContextLost(self.slot)),
        };
        let mut cache = self
            .cache
            .try_borrow_mut()
            .map_err(|_| BackendError::Busy(self.slot))?;
        let mut frame = Frame {
            slot: self.slot,
            backend,
            resources,
            cache: &mut *cache,
        };
        Ok(draw(&mut frame))
    }

    /// Resizes the backing surface. Clear before drawing the next frame.
    pub fn resize(&self, width: u32, height: u32) -> Result<(), BackendError> {
        self.with_frame(|frame| frame.resize(width, height))
    }

    /// Captures the current surface contents.
    pub fn snapshot(&self) -> Result<B::Snapshot, BackendError> {
        self.with_frame(|frame| frame.snapshot())?
    }

    /// Returns the slot to the pool, handing it to the next waiter.
    pub fn release(mut self) -> ReleaseOutcome {
        self.released = true;
        self.pool
            .release_lease(self.slot, self.requester, self.generation)
    }

    /// Forgets the lease without touching the pool. The pool has already
    /// reclaimed the slot when this is called.
    pub(crate) fn disarm(mut self) {
        self.released = true;
    }
}

impl<B: RenderBackend> Drop for BorrowedSlot<B> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool
                .release_lease(self.slot, self.requester, self.generation);
        }
    }
}

impl<B: RenderBackend> fmt::Debug for BorrowedSlot<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BorrowedSlot")
            .field("slot", &self.slot)
            .field("requester", &self.requester)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish()
    }
}

/// Mutable view of a borrowed slot for the duration of one draw.
pub struct Frame<'a, B: RenderBackend> {
    slot: SlotId,
    backend: &'a B,
    resources: &'a mut SlotResources<B>,
    cache: &'a mut SlotCache,
}

impl<'a, B: RenderBackend> Frame<'a, B> {
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    pub fn context(&self) -> &B::Context {
        &self.resources.context
    }

    pub fn context_mut(&mut self) -> &mut B::Context {
        &mut self.resources.context
    }

    pub fn shared(&self) -> &B::Shared {
        &self.resources.shared
    }

    /// Context and shared resources together, for draws that need both.
    pub fn parts_mut(&mut self) -> (&mut B::Context, &B::Shared) {
        (&mut self.resources.context, &self.resources.shared)
    }

    pub fn cache(&mut self) -> &mut SlotCache {
        &mut *self.cache
    }

    pub fn size(&self) -> (u32, u32) {
        self.resources.size
    }

    pub fn clear(&mut self) {
        self.backend.clear(&mut self.resources.context);
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.backend
            .resize(&mut self.resources.context, width, height);
        self.resources.size = (width, height);
    }

    pub fn snapshot(&mut self) -> Result<B::Snapshot, BackendError> {
        self.backend.snapshot(&mut self.resources.context)
    }
}
