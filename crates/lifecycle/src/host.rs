use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::Instant;

use ctxpool::{
    BackendError, BorrowError, BorrowedSlot, RenderBackend, RequesterId, ResourcePool,
};
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use poolconfig::{CardPoolConfig, LifecycleSection};
use scheduler::{StaticRenderOutcome, StaticRenderScheduler};
use tracing::{debug, trace, warn};

use crate::renderer::{CardRenderer, SharedRenderer, StillJob};
use crate::state::{CardEvent, CardId, LifecycleError, LifecycleState, Presentation};

struct LiveSlot<B: RenderBackend> {
    lease: BorrowedSlot<B>,
    since: Instant,
    leave_requested: Option<Instant>,
}

enum Phase<B: RenderBackend> {
    Idle,
    WaitingIntersection,
    StaticRendering,
    StaticRendered,
    Activating,
    Active(LiveSlot<B>),
    Deactivating,
}

impl<B: RenderBackend> Phase<B> {
    fn state(&self) -> LifecycleState {
        match self {
            Phase::Idle => LifecycleState::Idle,
            Phase::WaitingIntersection => LifecycleState::WaitingIntersection,
            Phase::StaticRendering => LifecycleState::StaticRendering,
            Phase::StaticRendered => LifecycleState::StaticRendered,
            Phase::Activating => LifecycleState::Activating,
            Phase::Active(_) => LifecycleState::Active,
            Phase::Deactivating => LifecycleState::Deactivating,
        }
    }
}

struct Card<B: RenderBackend> {
    renderer: SharedRenderer<B>,
    phase: Phase<B>,
    hovered: bool,
    started: bool,
    visible: bool,
    /// Bumped whenever an async step starts; completions carrying an older
    /// epoch are stale.
    epoch: u64,
    snapshot: Option<B::Snapshot>,
    presentation: Presentation,
    frames: u64,
}

impl<B: RenderBackend> Card<B> {
    fn wants_active(&self) -> bool {
        self.hovered || self.started
    }
}

struct HostState<B: RenderBackend> {
    cards: HashMap<CardId, Card<B>>,
    events: Vec<CardEvent>,
    next_id: u64,
    clock: Instant,
}

/// Per-tick counters returned by [`CardHost::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frames_drawn: usize,
    pub deactivated: usize,
    pub timed_out: usize,
    pub recovered: usize,
}

/// Drives every card's lifecycle against one pool and one static render
/// scheduler.
///
/// Input (visibility, pointer, start/stop, teardown) is applied immediately;
/// borrows and static renders complete on the local executor behind
/// `spawner`, and each completion re-checks what the card wants *now*.
/// [`CardHost::tick`] draws frames for active cards and runs the debounced
/// deactivations.
pub struct CardHost<B: RenderBackend> {
    pool: ResourcePool<B>,
    scheduler: StaticRenderScheduler<B>,
    spawner: LocalSpawner,
    lifecycle: LifecycleSection,
    state: Rc<RefCell<HostState<B>>>,
}

impl<B: RenderBackend> Clone for CardHost<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            scheduler: self.scheduler.clone(),
            spawner: self.spawner.clone(),
            lifecycle: self.lifecycle.clone(),
            state: Rc::clone(&self.state),
        }
    }
}

impl<B: RenderBackend + 'static> CardHost<B> {
    pub fn new(pool: ResourcePool<B>, spawner: LocalSpawner, config: &CardPoolConfig) -> Self {
        let scheduler = StaticRenderScheduler::from_config(pool.clone(), spawner.clone(), config);
        Self::with_scheduler(pool, scheduler, spawner, config.lifecycle.clone())
    }

    pub fn with_scheduler(
        pool: ResourcePool<B>,
        scheduler: StaticRenderScheduler<B>,
        spawner: LocalSpawner,
        lifecycle: LifecycleSection,
    ) -> Self {
        Self {
            pool,
            scheduler,
            spawner,
            lifecycle,
            state: Rc::new(RefCell::new(HostState {
                cards: HashMap::new(),
                events: Vec::new(),
                next_id: 1,
                clock: Instant::now(),
            })),
        }
    }

    pub fn pool(&self) -> &ResourcePool<B> {
        &self.pool
    }

    pub fn scheduler(&self) -> &StaticRenderScheduler<B> {
        &self.scheduler
    }

    /// Adds a card and starts tracking its visibility.
    pub fn register(&self, renderer: impl CardRenderer<B> + 'static) -> CardId {
        let renderer: SharedRenderer<B> = Rc::new(RefCell::new(renderer));
        let mut state = self.state.borrow_mut();
        let id: CardId = RequesterId(state.next_id);
        state.next_id += 1;

        let mut card = Card {
            renderer,
            phase: Phase::Idle,
            hovered: false,
            started: false,
            visible: false,
            epoch: 0,
            snapshot: None,
            presentation: Presentation::Placeholder,
            frames: 0,
        };
        transition(id, &mut card, Phase::WaitingIntersection, &mut state.events);
        state.cards.insert(id, card);
        id
    }

    /// Reports the fraction of the card inside the viewport.
    ///
    /// Crossing the threshold the first time queues the static render. A card
    /// that leaves again keeps its place in the queue.
    pub fn set_intersection(&self, id: CardId, ratio: f32) -> Result<(), LifecycleError> {
        let mut state = self.state.borrow_mut();
        let HostState { cards, events, .. } = &mut *state;
        let card = cards.get_mut(&id).ok_or(LifecycleError::UnknownCard(id))?;
        card.visible = ratio >= self.lifecycle.intersection_threshold;
        if card.visible && matches!(card.phase, Phase::WaitingIntersection) {
            self.begin_static_render(id, card, events)?;
        }
        Ok(())
    }

    pub fn pointer_enter(&self, id: CardId) -> Result<(), LifecycleError> {
        self.update_intent(id, |card| card.hovered = true, None)
    }

    pub fn pointer_leave(&self, id: CardId, now: Instant) -> Result<(), LifecycleError> {
        self.update_intent(id, |card| card.hovered = false, Some(now))
    }

    /// Animates the card regardless of hover until [`CardHost::stop`].
    pub fn start(&self, id: CardId) -> Result<(), LifecycleError> {
        self.update_intent(id, |card| card.started = true, None)
    }

    pub fn stop(&self, id: CardId, now: Instant) -> Result<(), LifecycleError> {
        self.update_intent(id, |card| card.started = false, Some(now))
    }

    /// Removes the card from every queue, returns any slot it holds and
    /// discards it. Completions still in flight for the card are ignored.
    pub fn teardown(&self, id: CardId) -> Result<(), LifecycleError> {
        let (released, card) = {
            let mut state = self.state.borrow_mut();
            let HostState { cards, events, .. } = &mut *state;
            let mut card = cards.remove(&id).ok_or(LifecycleError::UnknownCard(id))?;
            match card.phase {
                Phase::StaticRendering => {
                    self.scheduler.remove(id);
                }
                Phase::Activating => {
                    self.pool.cancel(id);
                }
                _ => {}
            }
            let previous = transition(id, &mut card, Phase::Idle, events);
            let released = match previous {
                Phase::Active(live) => Some(live.lease),
                _ => None,
            };
            (released, card)
        };
        if let Some(lease) = released {
            lease.release();
        }
        debug!(card = %id, "card discarded");
        drop(card);
        Ok(())
    }

    /// Tears down every card and shuts the pool.
    pub fn shutdown(&self) {
        for id in self.card_ids() {
            let _ = self.teardown(id);
        }
        self.scheduler.clear();
        self.pool.shutdown();
    }

    /// Advances time: expires queued borrows, recovers lost contexts, runs
    /// due deactivations and draws one frame for every active card.
    pub fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport {
            timed_out: self.pool.tick(now),
            ..TickReport::default()
        };
        if self.pool.stats().invalid > 0 {
            report.recovered = self.pool.recover_lost_slots();
        }

        let mut state = self.state.borrow_mut();
        state.clock = now;
        let HostState { cards, events, .. } = &mut *state;
        let mut ids: Vec<CardId> = cards.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let Some(card) = cards.get_mut(&id) else {
                continue;
            };
            let due = match &card.phase {
                Phase::Active(live) => live.leave_requested.is_some_and(|at| {
                    !card.wants_active()
                        && now.saturating_duration_since(at) >= self.lifecycle.deactivate_debounce
                }),
                _ => continue,
            };
            if due {
                self.deactivate(id, card, events);
                report.deactivated += 1;
                continue;
            }
            if self.draw_frame(id, card, events, now) {
                report.frames_drawn += 1;
            }
        }
        report
    }

    pub fn state(&self, id: CardId) -> Option<LifecycleState> {
        self.state
            .borrow()
            .cards
            .get(&id)
            .map(|card| card.phase.state())
    }

    pub fn presentation(&self, id: CardId) -> Option<Presentation> {
        self.state
            .borrow()
            .cards
            .get(&id)
            .map(|card| card.presentation)
    }

    pub fn snapshot(&self, id: CardId) -> Option<B::Snapshot> {
        self.state
            .borrow()
            .cards
            .get(&id)
            .and_then(|card| card.snapshot.clone())
    }

    /// Frames drawn from a live slot; static renders are not counted.
    pub fn frames(&self, id: CardId) -> Option<u64> {
        self.state.borrow().cards.get(&id).map(|card| card.frames)
    }

    pub fn card_ids(&self) -> Vec<CardId> {
        let mut ids: Vec<CardId> = self.state.borrow().cards.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state_counts(&self) -> BTreeMap<LifecycleState, usize> {
        let mut counts: BTreeMap<LifecycleState, usize> =
            LifecycleState::ALL.into_iter().map(|state| (state, 0)).collect();
        for card in self.state.borrow().cards.values() {
            *counts.entry(card.phase.state()).or_default() += 1;
        }
        counts
    }

    pub fn drain_events(&self) -> Vec<CardEvent> {
        std::mem::take(&mut self.state.borrow_mut().events)
    }

    fn update_intent(
        &self,
        id: CardId,
        apply: impl FnOnce(&mut Card<B>),
        now: Option<Instant>,
    ) -> Result<(), LifecycleError> {
        let mut state = self.state.borrow_mut();
        let clock = state.clock;
        let HostState { cards, events, .. } = &mut *state;
        let card = cards.get_mut(&id).ok_or(LifecycleError::UnknownCard(id))?;
        apply(card);

        let wants_active = card.wants_active();
        if wants_active && matches!(card.phase, Phase::StaticRendered) {
            self.begin_activation(id, card, events)?;
        } else if let Phase::Active(live) = &mut card.phase {
            live.leave_requested = if wants_active {
                None
            } else {
                live.leave_requested.or(Some(now.unwrap_or(clock)))
            };
        }
        // Earlier states keep the intent; later completions reconcile it.
        Ok(())
    }

    fn begin_static_render(
        &self,
        id: CardId,
        card: &mut Card<B>,
        events: &mut Vec<CardEvent>,
    ) -> Result<(), LifecycleError> {
        let job = StillJob {
            renderer: Rc::clone(&card.renderer),
        };
        let completion = self.scheduler.enqueue(id, Box::new(job))?;
        card.epoch += 1;
        let epoch = card.epoch;
        transition(id, card, Phase::StaticRendering, events);

        let host = self.clone();
        self.spawner.spawn_local(async move {
            let outcome = completion.await;
            host.finish_static_render(id, epoch, outcome);
        })?;
        Ok(())
    }

    fn finish_static_render(&self, id: CardId, epoch: u64, outcome: StaticRenderOutcome<B::Snapshot>) {
        let mut state = self.state.borrow_mut();
        let HostState { cards, events, .. } = &mut *state;
        let Some(card) = cards.get_mut(&id) else {
            return;
        };
        if card.epoch != epoch || !matches!(card.phase, Phase::StaticRendering) {
            trace!(card = %id, "stale static render completion ignored");
            return;
        }

        match outcome {
            StaticRenderOutcome::Rendered(snapshot) => {
                card.snapshot = Some(snapshot);
                card.presentation = Presentation::Still;
                transition(id, card, Phase::StaticRendered, events);
            }
            StaticRenderOutcome::Failed(reason) => {
                warn!(card = %id, %reason, "static render failed");
                events.push(CardEvent::Failed { card: id, reason });
                transition(id, card, Phase::StaticRendered, events);
            }
            StaticRenderOutcome::Removed => {
                transition(id, card, Phase::WaitingIntersection, events);
                return;
            }
        }

        if card.wants_active() {
            if let Err(err) = self.begin_activation(id, card, events) {
                warn!(card = %id, error = %err, "activation after static render failed");
            }
        }
    }

    fn begin_activation(
        &self,
        id: CardId,
        card: &mut Card<B>,
        events: &mut Vec<CardEvent>,
    ) -> Result<(), LifecycleError> {
        let ticket = self.pool.borrow(id);
        card.epoch += 1;
        let epoch = card.epoch;
        transition(id, card, Phase::Activating, events);

        let host = self.clone();
        let spawned = self.spawner.spawn_local(async move {
            let result = ticket.await;
            host.finish_activation(id, epoch, result);
        });
        if let Err(err) = spawned {
            self.pool.cancel(id);
            transition(id, card, Phase::StaticRendered, events);
            return Err(err.into());
        }
        Ok(())
    }

    fn finish_activation(
        &self,
        id: CardId,
        epoch: u64,
        result: Result<BorrowedSlot<B>, BorrowError>,
    ) {
        let mut state = self.state.borrow_mut();
        let clock = state.clock;
        let HostState { cards, events, .. } = &mut *state;
        let Some(card) = cards.get_mut(&id) else {
            return;
        };
        if card.epoch != epoch || !matches!(card.phase, Phase::Activating) {
            trace!(card = %id, "stale activation completion ignored");
            return;
        }

        let lease = match result {
            Ok(lease) => lease,
            Err(err) => {
                if err.is_cancellation() {
                    debug!(card = %id, error = %err, "activation abandoned");
                } else {
                    warn!(card = %id, error = %err, "activation borrow rejected");
                    events.push(CardEvent::Failed {
                        card: id,
                        reason: err.to_string(),
                    });
                }
                transition(id, card, Phase::StaticRendered, events);
                return;
            }
        };

        if !card.wants_active() {
            debug!(card = %id, slot = %lease.slot(), "intent reversed while activating");
            transition(id, card, Phase::Deactivating, events);
            lease.release();
            restore_still(card);
            transition(id, card, Phase::StaticRendered, events);
            return;
        }

        let renderer = Rc::clone(&card.renderer);
        let init = lease.with_frame(|frame| {
            frame.clear();
            renderer.borrow_mut().init(frame)
        });
        let failure = match init {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(err) => Some(err.to_string()),
        };
        if let Some(reason) = failure {
            warn!(card = %id, %reason, "card initialisation failed");
            events.push(CardEvent::Failed { card: id, reason });
            transition(id, card, Phase::Deactivating, events);
            lease.release();
            restore_still(card);
            transition(id, card, Phase::StaticRendered, events);
            return;
        }

        debug!(card = %id, slot = %lease.slot(), "card active");
        card.presentation = Presentation::Live;
        transition(
            id,
            card,
            Phase::Active(LiveSlot {
                lease,
                since: clock,
                leave_requested: None,
            }),
            events,
        );
    }

    fn deactivate(&self, id: CardId, card: &mut Card<B>, events: &mut Vec<CardEvent>) {
        if let Phase::Active(live) = transition(id, card, Phase::Deactivating, events) {
            live.lease.release();
        }
        restore_still(card);
        transition(id, card, Phase::StaticRendered, events);
    }

    /// Returns whether a frame was drawn.
    fn draw_frame(
        &self,
        id: CardId,
        card: &mut Card<B>,
        events: &mut Vec<CardEvent>,
        now: Instant,
    ) -> bool {
        let Phase::Active(live) = &card.phase else {
            return false;
        };
        let elapsed = now.saturating_duration_since(live.since);
        let renderer = Rc::clone(&card.renderer);
        let drawn = live.lease.with_frame(|frame| {
            frame.clear();
            renderer.borrow_mut().draw(frame, elapsed)
        });

        match drawn {
            Ok(Ok(())) => {
                card.frames += 1;
                trace!(card = %id, frame = card.frames, ?elapsed, "frame drawn");
                true
            }
            Ok(Err(err)) => {
                let reason = format!("{err:#}");
                warn!(card = %id, %reason, "card draw failed");
                events.push(CardEvent::Failed { card: id, reason });
                self.deactivate(id, card, events);
                false
            }
            Err(BackendError::ContextLost(slot)) => {
                warn!(card = %id, %slot, "context lost while active");
                self.deactivate(id, card, events);
                if card.wants_active() {
                    if let Err(err) = self.begin_activation(id, card, events) {
                        warn!(card = %id, error = %err, "re-activation failed");
                    }
                }
                false
            }
            Err(err) => {
                warn!(card = %id, error = %err, "card frame skipped");
                false
            }
        }
    }
}

fn restore_still<B: RenderBackend>(card: &mut Card<B>) {
    card.presentation = if card.snapshot.is_some() {
        Presentation::Still
    } else {
        Presentation::Placeholder
    };
}

/// Moves `card` to `next`, records the change, and returns the old phase.
fn transition<B: RenderBackend>(
    id: CardId,
    card: &mut Card<B>,
    next: Phase<B>,
    events: &mut Vec<CardEvent>,
) -> Phase<B> {
    let from = card.phase.state();
    let to = next.state();
    let previous = std::mem::replace(&mut card.phase, next);
    if from != to {
        debug!(card = %id, %from, %to, "card state changed");
        events.push(CardEvent::StateChanged { card: id, from, to });
    }
    previous
}
