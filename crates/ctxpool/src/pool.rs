use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use tracing::{debug, info, warn};

use crate::backend::RenderBackend;
use crate::cache::SlotCacheArena;
use crate::error::{BorrowError, PoolError, ReleaseOutcome};
use crate::slot::PooledResourceSet;
use crate::ticket::{BorrowResult, BorrowTicket, BorrowedSlot};
use crate::types::{PoolOptions, PoolStats, RequesterId, SlotId, SurfaceParams};

/// A borrow waiting for a slot to free up.
struct BorrowRequest<B: RenderBackend> {
    requester: RequesterId,
    enqueued_at: Instant,
    completion: oneshot::Sender<BorrowResult<B>>,
}

struct PoolState<B: RenderBackend> {
    slots: Vec<PooledResourceSet<B>>,
    waiters: VecDeque<BorrowRequest<B>>,
    caches: SlotCacheArena,
    surface: SurfaceParams,
    borrow_timeout: Option<Duration>,
    closed: bool,
}

impl<B: RenderBackend> PoolState<B> {
    fn find(&self, slot: SlotId) -> Option<usize> {
        self.slots.iter().position(|entry| entry.id() == slot)
    }

    fn slot_owned_by(&self, requester: RequesterId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|entry| entry.is_in_use() && entry.owner() == Some(requester))
            .map(|entry| entry.id())
    }

    fn first_available(&self, backend: &B) -> Option<usize> {
        self.slots
            .iter()
            .position(|entry| !entry.is_in_use() && entry.is_alive(backend))
    }

    fn is_pending(&self, requester: RequesterId) -> bool {
        self.waiters
            .iter()
            .any(|request| request.requester == requester)
    }
}

/// Fixed-size pool of reusable rendering contexts.
///
/// The pool is a cheap handle: clones share the same slots and wait queue.
/// All operations are synchronous; only a queued [`BorrowTicket`] suspends.
///
/// ```text
///   borrow ──▶ free live slot? ──yes──▶ ticket ready
///                  │ no
///                  ▼
///            FIFO wait queue ◀── cancel / tick(timeout) reject
///                  ▲
///   release ──▶ clear surface ──▶ hand slot to queue head (same call)
/// ```
pub struct ResourcePool<B: RenderBackend> {
    backend: Rc<B>,
    state: Rc<RefCell<PoolState<B>>>,
}

impl<B: RenderBackend> Clone for ResourcePool<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Rc::clone(&self.backend),
            state: Rc::clone(&self.state),
        }
    }
}

impl<B: RenderBackend> fmt::Debug for ResourcePool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<B: RenderBackend> ResourcePool<B> {
    /// Builds up to `options.size` slots.
    ///
    /// A slot whose context cannot be created is skipped; the pool runs with
    /// fewer slots. Fails only when no slot could be built at all.
    pub fn new(backend: B, options: PoolOptions) -> Result<Self, PoolError> {
        if options.size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let mut slots = Vec::with_capacity(options.size);
        let mut failures = Vec::new();
        for index in 0..options.size {
            let id = SlotId(index);
            match PooledResourceSet::create(&backend, id, &options.surface) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    warn!(slot = %id, error = %err, "slot initialisation failed; skipping");
                    failures.push((id, err));
                }
            }
        }

        if slots.is_empty() {
            return Err(PoolError::NoUsableSlots {
                requested: options.size,
                failures,
            });
        }

        info!(
            backend = backend.name(),
            requested = options.size,
            ready = slots.len(),
            skipped = failures.len(),
            "resource pool initialised"
        );

        Ok(Self {
            backend: Rc::new(backend),
            state: Rc::new(RefCell::new(PoolState {
                slots,
                waiters: VecDeque::new(),
                caches: SlotCacheArena::default(),
                surface: options.surface,
                borrow_timeout: options.borrow_timeout,
                closed: false,
            })),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of slots that initialised successfully.
    pub fn capacity(&self) -> usize {
        self.state.borrow().slots.len()
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.state.borrow().slots.iter().map(|slot| slot.id()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Requests a slot for `requester`.
    ///
    /// The ticket is already resolved when a free, live slot exists and no one
    /// is queued ahead. Otherwise the request joins the tail of the FIFO queue.
    /// A requester may have one pending request and hold one slot at a time.
    pub fn borrow(&self, requester: RequesterId) -> BorrowTicket<B> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return BorrowTicket::ready(Err(BorrowError::PoolClosed));
        }
        if state.is_pending(requester) {
            warn!(%requester, "borrow already pending; rejecting duplicate request");
            return BorrowTicket::ready(Err(BorrowError::AlreadyPending(requester)));
        }
        if let Some(slot) = state.slot_owned_by(requester) {
            warn!(%requester, %slot, "borrow from a requester that already holds a slot");
            return BorrowTicket::ready(Err(BorrowError::AlreadyHolding { requester, slot }));
        }

        if state.waiters.is_empty() {
            if let Some(index) = state.first_available(&self.backend) {
                let lease = self.lend(&mut state, index, requester);
                debug!(%requester, slot = %lease.slot(), "borrow satisfied immediately");
                return BorrowTicket::ready(Ok(lease));
            }
        }

        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(BorrowRequest {
            requester,
            enqueued_at: Instant::now(),
            completion: sender,
        });
        debug!(%requester, queue_length = state.waiters.len(), "borrow queued");
        self.service_waiters(&mut state);
        BorrowTicket::waiting(receiver)
    }

    /// Frees `slot` on behalf of `requester` and services the wait queue.
    ///
    /// Unknown slots and releases from a requester that does not own the slot
    /// are logged and ignored.
    pub fn release(&self, slot: SlotId, requester: RequesterId) -> ReleaseOutcome {
        self.release_inner(slot, requester, None)
    }

    pub(crate) fn release_lease(
        &self,
        slot: SlotId,
        requester: RequesterId,
        generation: u64,
    ) -> ReleaseOutcome {
        self.release_inner(slot, requester, Some(generation))
    }

    fn release_inner(
        &self,
        slot: SlotId,
        requester: RequesterId,
        generation: Option<u64>,
    ) -> ReleaseOutcome {
        let mut state = self.state.borrow_mut();
        if state.closed {
            debug!(%slot, %requester, "release after shutdown ignored");
            return ReleaseOutcome::Closed;
        }
        let Some(index) = state.find(slot) else {
            warn!(%slot, %requester, "release for unknown slot ignored");
            return ReleaseOutcome::UnknownSlot;
        };

        let entry = &mut state.slots[index];
        if let Some(generation) = generation {
            if !entry.holds_lease(generation) {
                debug!(%slot, %requester, "stale lease released; ignoring");
                return ReleaseOutcome::Stale;
            }
        }
        if entry.owner() != Some(requester) {
            warn!(
                %slot,
                %requester,
                owner = ?entry.owner(),
                "release from non-owner ignored"
            );
            return ReleaseOutcome::NotOwner;
        }

        entry.release(&self.backend);
        debug!(%slot, %requester, "slot released");
        self.service_waiters(&mut state);
        ReleaseOutcome::Released
    }

    /// Removes the pending request of `requester` and rejects its ticket.
    ///
    /// Returns false when nothing was pending.
    pub fn cancel(&self, requester: RequesterId) -> bool {
        let removed = {
            let mut state = self.state.borrow_mut();
            let position = state
                .waiters
                .iter()
                .position(|request| request.requester == requester);
            position.and_then(|index| state.waiters.remove(index))
        };

        match removed {
            Some(request) => {
                // A receiver that is already gone has nothing to wake.
                let _ = request.completion.send(Err(BorrowError::Cancelled));
                debug!(%requester, "pending borrow cancelled");
                true
            }
            None => false,
        }
    }

    /// Releases whichever slot `requester` currently holds.
    pub fn force_release_for(&self, requester: RequesterId) -> Option<SlotId> {
        let slot = self.state.borrow().slot_owned_by(requester)?;
        match self.release(slot, requester) {
            ReleaseOutcome::Released => {
                info!(%requester, %slot, "slot force-released");
                Some(slot)
            }
            _ => None,
        }
    }

    /// Expires queued borrows older than the configured timeout.
    ///
    /// Expired requests leave the queue before they are rejected, so a slot
    /// freed afterwards can never reach them. Returns how many expired.
    pub fn tick(&self, now: Instant) -> usize {
        let expired: Vec<(BorrowRequest<B>, Duration)> = {
            let mut state = self.state.borrow_mut();
            let Some(timeout) = state.borrow_timeout else {
                return 0;
            };
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.waiters.len());
            while let Some(request) = state.waiters.pop_front() {
                let waited = now.saturating_duration_since(request.enqueued_at);
                if waited >= timeout {
                    expired.push((request, waited));
                } else {
                    kept.push_back(request);
                }
            }
            state.waiters = kept;
            expired
        };

        let count = expired.len();
        for (request, waited) in expired {
            warn!(requester = %request.requester, ?waited, "queued borrow timed out");
            let _ = request.completion.send(Err(BorrowError::TimedOut { waited }));
        }
        count
    }

    /// Rebuilds the contexts of free slots that failed their liveness check,
    /// then hands recovered slots to waiters. Returns how many recovered.
    pub fn recover_lost_slots(&self) -> usize {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return 0;
        }
        let surface = state.surface.clone();
        let mut recovered = 0;
        for index in 0..state.slots.len() {
            let (id, lost) = {
                let entry = &state.slots[index];
                (entry.id(), !entry.is_in_use() && !entry.is_alive(&self.backend))
            };
            if !lost {
                continue;
            }
            state.caches.destroy(id);
            match state.slots[index].rebuild(&self.backend, &surface) {
                Ok(()) => recovered += 1,
                Err(err) => warn!(slot = %id, error = %err, "slot recovery failed"),
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered lost slots");
            self.service_waiters(&mut state);
        }
        recovered
    }

    /// Rejects every waiter and destroys every slot. Idempotent.
    pub fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            for slot in state.slots.iter_mut() {
                slot.destroy(&self.backend);
            }
            state.caches.destroy_all();
            std::mem::take(&mut state.waiters)
        };

        let rejected = waiters.len();
        for request in waiters {
            let _ = request.completion.send(Err(BorrowError::PoolClosed));
        }
        info!(rejected, "resource pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.borrow();
        let mut stats = PoolStats {
            total: state.slots.len(),
            queue_length: state.waiters.len(),
            ..PoolStats::default()
        };
        for slot in &state.slots {
            let alive = slot.is_alive(&self.backend);
            if slot.is_in_use() {
                stats.in_use += 1;
            } else if alive {
                stats.available += 1;
            }
            if !alive {
                stats.invalid += 1;
            }
        }
        stats
    }

    pub fn owner_of(&self, slot: SlotId) -> Option<RequesterId> {
        let state = self.state.borrow();
        state.find(slot).and_then(|index| state.slots[index].owner())
    }

    pub fn slot_held_by(&self, requester: RequesterId) -> Option<SlotId> {
        self.state.borrow().slot_owned_by(requester)
    }

    pub fn is_pending(&self, requester: RequesterId) -> bool {
        self.state.borrow().is_pending(requester)
    }

    /// Requesters waiting for a slot, head first.
    pub fn queued_requesters(&self) -> Vec<RequesterId> {
        self.state
            .borrow()
            .waiters
            .iter()
            .map(|request| request.requester)
            .collect()
    }

    pub(crate) fn lease_is_current(&self, slot: SlotId, generation: u64) -> bool {
        let state = self.state.borrow();
        state
            .find(slot)
            .is_some_and(|index| state.slots[index].holds_lease(generation))
    }

    fn lend(
        &self,
        state: &mut PoolState<B>,
        index: usize,
        requester: RequesterId,
    ) -> BorrowedSlot<B> {
        let entry = &mut state.slots[index];
        let generation = entry.assign_to(requester);
        let slot = entry.id();
        let resources = entry.resources();
        let cache = state.caches.cache_for(slot);
        BorrowedSlot::new(self.clone(), slot, requester, generation, resources, cache)
    }

    /// Hands free live slots to the head of the queue until either runs out.
    fn service_waiters(&self, state: &mut PoolState<B>) {
        while !state.waiters.is_empty() {
            let Some(index) = state.first_available(&self.backend) else {
                break;
            };
            let Some(request) = state.waiters.pop_front() else {
                break;
            };
            if request.completion.is_canceled() {
                debug!(requester = %request.requester, "dropping abandoned borrow request");
                continue;
            }

            let requester = request.requester;
            let lease = self.lend(state, index, requester);
            let slot = lease.slot();
            if let Err(returned) = request.completion.send(Ok(lease)) {
                if let Ok(lease) = returned {
                    lease.disarm();
                }
                state.slots[index].release(&self.backend);
                debug!(%requester, %slot, "waiter vanished during hand-off");
                continue;
            }
            debug!(
                %requester,
                %slot,
                queue_length = state.waiters.len(),
                "slot handed to queued borrower"
            );
        }
    }
}
