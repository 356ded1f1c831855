//! One-shot static renders for cards that have just scrolled into view.
//!
//! Jobs queue up as cards appear. A single drain task repeatedly sorts the
//! queue by on-page position and runs the front of it, one job at a time or
//! in small batches bounded by the pool size. Each job borrows a slot, draws
//! once, captures a snapshot and hands the slot straight back.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use ctxpool::{BackendError, Frame, RenderBackend, RequesterId, ResourcePool};
use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::future::join_all;
use futures::task::LocalSpawnExt;
use poolconfig::CardPoolConfig;
use tracing::{debug, warn};

/// Fresh slots a job may be given after its context was lost mid-render.
const CONTEXT_LOSS_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to spawn static render drain: {0}")]
    Spawn(#[from] futures::task::SpawnError),
}

/// Top-left corner of a card in page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub top: f32,
    pub left: f32,
}

impl Position {
    pub fn new(top: f32, left: f32) -> Self {
        Self { top, left }
    }
}

/// Work for one static render.
pub trait StaticRenderJob<B: RenderBackend> {
    /// Queried once per drain pass; cards may move between passes.
    fn position(&self) -> Position;

    /// Draws the still frame into a freshly cleared surface.
    fn render(&mut self, frame: &mut Frame<'_, B>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StaticRenderOutcome<S> {
    Rendered(S),
    /// The consumer was removed before its job completed.
    Removed,
    Failed(String),
}

impl<S> StaticRenderOutcome<S> {
    pub fn is_rendered(&self) -> bool {
        matches!(self, Self::Rendered(_))
    }
}

/// Resolves once the job has rendered, failed, or been removed.
#[must_use = "dropping a completion discards the snapshot"]
pub struct StaticRenderCompletion<S> {
    receiver: oneshot::Receiver<StaticRenderOutcome<S>>,
}

impl<S> StaticRenderCompletion<S> {
    /// Non-blocking check; `None` while the job is still pending.
    pub fn try_outcome(&mut self) -> Option<StaticRenderOutcome<S>> {
        match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Some(StaticRenderOutcome::Removed),
        }
    }
}

impl<S> Future for StaticRenderCompletion<S> {
    type Output = StaticRenderOutcome<S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(StaticRenderOutcome::Removed),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct QueuedJob<B: RenderBackend> {
    consumer: RequesterId,
    sequence: u64,
    retries: u32,
    job: Box<dyn StaticRenderJob<B>>,
    completion: oneshot::Sender<StaticRenderOutcome<B::Snapshot>>,
}

struct SchedulerState<B: RenderBackend> {
    queue: Vec<QueuedJob<B>>,
    in_flight: HashMap<RequesterId, Rc<Cell<bool>>>,
    next_sequence: u64,
    draining: bool,
}

/// Position-ordered, capacity-bounded static render queue.
///
/// Cheap to clone; clones share the queue.
pub struct StaticRenderScheduler<B: RenderBackend> {
    pool: ResourcePool<B>,
    spawner: LocalSpawner,
    batch_limit: usize,
    state: Rc<RefCell<SchedulerState<B>>>,
}

impl<B: RenderBackend> Clone for StaticRenderScheduler<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            spawner: self.spawner.clone(),
            batch_limit: self.batch_limit,
            state: Rc::clone(&self.state),
        }
    }
}

impl<B: RenderBackend + 'static> StaticRenderScheduler<B> {
    /// `batch_limit` of 1 drains sequentially. Larger limits are capped by
    /// the number of slots the pool actually built.
    pub fn new(pool: ResourcePool<B>, spawner: LocalSpawner, batch_limit: usize) -> Self {
        let batch_limit = batch_limit.clamp(1, pool.capacity().max(1));
        Self {
            pool,
            spawner,
            batch_limit,
            state: Rc::new(RefCell::new(SchedulerState {
                queue: Vec::new(),
                in_flight: HashMap::new(),
                next_sequence: 0,
                draining: false,
            })),
        }
    }

    pub fn from_config(
        pool: ResourcePool<B>,
        spawner: LocalSpawner,
        config: &CardPoolConfig,
    ) -> Self {
        Self::new(pool, spawner, config.static_batch_limit())
    }

    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Queues a static render for `consumer` and starts the drain if idle.
    ///
    /// A consumer has at most one queued job; enqueueing again replaces the
    /// earlier job, whose completion resolves as removed.
    pub fn enqueue(
        &self,
        consumer: RequesterId,
        job: Box<dyn StaticRenderJob<B>>,
    ) -> Result<StaticRenderCompletion<B::Snapshot>, SchedulerError> {
        let (sender, receiver) = oneshot::channel();
        let (replaced, start_drain) = {
            let mut state = self.state.borrow_mut();
            let replaced = take_queued(&mut state.queue, consumer);
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.queue.push(QueuedJob {
                consumer,
                sequence,
                retries: 0,
                job,
                completion: sender,
            });
            debug!(%consumer, pending = state.queue.len(), "static render queued");
            let start_drain = !state.draining;
            state.draining = true;
            (replaced, start_drain)
        };

        if let Some(replaced) = replaced {
            let _ = replaced.completion.send(StaticRenderOutcome::Removed);
        }
        if start_drain {
            let scheduler = self.clone();
            if let Err(err) = self.spawner.spawn_local(async move { scheduler.drain().await }) {
                self.state.borrow_mut().draining = false;
                return Err(err.into());
            }
        }
        Ok(StaticRenderCompletion { receiver })
    }

    /// Drops the consumer's job. A queued job is excised; a job already
    /// waiting for a slot has its borrow cancelled. Either way the completion
    /// resolves as removed. Returns false when nothing was scheduled.
    pub fn remove(&self, consumer: RequesterId) -> bool {
        let (queued, in_flight) = {
            let mut state = self.state.borrow_mut();
            let queued = take_queued(&mut state.queue, consumer);
            let in_flight = state.in_flight.get(&consumer).cloned();
            (queued, in_flight)
        };

        if let Some(queued) = queued {
            debug!(%consumer, "static render removed before its turn");
            let _ = queued.completion.send(StaticRenderOutcome::Removed);
            return true;
        }
        match in_flight {
            Some(flag) => {
                flag.set(true);
                self.pool.cancel(consumer);
                debug!(%consumer, "in-flight static render removed");
                true
            }
            None => false,
        }
    }

    /// Jobs waiting for their turn.
    pub fn pending(&self) -> usize {
        self.state.borrow().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight.len()
    }

    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    pub fn is_scheduled(&self, consumer: RequesterId) -> bool {
        let state = self.state.borrow();
        state.in_flight.contains_key(&consumer)
            || state.queue.iter().any(|job| job.consumer == consumer)
    }

    /// Resolves every queued job as removed.
    pub fn clear(&self) {
        let queue = std::mem::take(&mut self.state.borrow_mut().queue);
        for job in queue {
            let _ = job.completion.send(StaticRenderOutcome::Removed);
        }
    }

    async fn drain(self) {
        loop {
            let batch = {
                let mut state = self.state.borrow_mut();
                if state.queue.is_empty() {
                    state.draining = false;
                    break;
                }
                let mut keyed: Vec<(Position, QueuedJob<B>)> = state
                    .queue
                    .drain(..)
                    .map(|job| (job.job.position(), job))
                    .collect();
                keyed.sort_by(|(a, job_a), (b, job_b)| {
                    a.top
                        .total_cmp(&b.top)
                        .then(a.left.total_cmp(&b.left))
                        .then(job_a.sequence.cmp(&job_b.sequence))
                });
                let rest = keyed.split_off(self.batch_limit.min(keyed.len()));
                state.queue = rest.into_iter().map(|(_, job)| job).collect();

                keyed
                    .into_iter()
                    .map(|(_, job)| {
                        let removed = Rc::new(Cell::new(false));
                        state.in_flight.insert(job.consumer, Rc::clone(&removed));
                        (job, removed)
                    })
                    .collect::<Vec<_>>()
            };

            debug!(
                batch = batch.len(),
                remaining = self.pending(),
                "running static render batch"
            );
            let retries: Vec<(QueuedJob<B>, Rc<Cell<bool>>)> = join_all(
                batch
                    .into_iter()
                    .map(|(job, removed)| self.run_job(job, removed)),
            )
            .await
            .into_iter()
            .flatten()
            .collect();
            if !retries.is_empty() {
                self.requeue_lost(retries);
            }
            YieldNow::default().await;
        }
    }

    /// Runs one job. Returns it for another pass when its slot's context was
    /// lost; otherwise its completion has been resolved.
    async fn run_job(
        &self,
        mut queued: QueuedJob<B>,
        removed: Rc<Cell<bool>>,
    ) -> Option<(QueuedJob<B>, Rc<Cell<bool>>)> {
        let consumer = queued.consumer;
        let outcome = match self.pool.borrow(consumer).await {
            Err(_) if removed.get() => StaticRenderOutcome::Removed,
            Err(err) => {
                warn!(%consumer, error = %err, "static render could not borrow a slot");
                StaticRenderOutcome::Failed(err.to_string())
            }
            Ok(lease) if removed.get() => {
                lease.release();
                StaticRenderOutcome::Removed
            }
            Ok(lease) => {
                let job = &mut queued.job;
                let result = lease.with_frame(|frame| {
                    frame.clear();
                    job.render(frame)?;
                    Ok::<_, anyhow::Error>(frame.snapshot()?)
                });
                let slot = lease.slot();
                lease.release();

                let lost = match &result {
                    Err(BackendError::ContextLost(_)) => true,
                    Ok(Err(err)) => matches!(
                        err.downcast_ref::<BackendError>(),
                        Some(BackendError::ContextLost(_))
                    ),
                    _ => false,
                };
                if lost && queued.retries < CONTEXT_LOSS_RETRIES {
                    queued.retries += 1;
                    warn!(
                        %consumer,
                        %slot,
                        attempt = queued.retries,
                        "static render lost its context; retrying on a fresh slot"
                    );
                    return Some((queued, removed));
                }

                match result {
                    Ok(Ok(snapshot)) => {
                        debug!(%consumer, %slot, "static render captured");
                        StaticRenderOutcome::Rendered(snapshot)
                    }
                    Ok(Err(err)) => {
                        warn!(%consumer, %slot, error = %format!("{err:#}"), "static render failed");
                        StaticRenderOutcome::Failed(format!("{err:#}"))
                    }
                    Err(err) => {
                        warn!(%consumer, %slot, error = %err, "static render gave up on its slot");
                        StaticRenderOutcome::Failed(err.to_string())
                    }
                }
            }
        };

        self.state.borrow_mut().in_flight.remove(&consumer);
        let _ = queued.completion.send(outcome);
        None
    }

    /// Rebuilds lost contexts and puts the affected jobs back in the queue.
    ///
    /// A job removed meanwhile, or superseded by a newer enqueue, resolves as
    /// removed instead.
    fn requeue_lost(&self, jobs: Vec<(QueuedJob<B>, Rc<Cell<bool>>)>) {
        let recovered = self.pool.recover_lost_slots();
        let superseded: Vec<QueuedJob<B>> = {
            let mut state = self.state.borrow_mut();
            let mut superseded = Vec::new();
            for (job, removed) in jobs {
                state.in_flight.remove(&job.consumer);
                let replaced = state.queue.iter().any(|queued| queued.consumer == job.consumer);
                if removed.get() || replaced {
                    superseded.push(job);
                } else {
                    state.queue.push(job);
                }
            }
            superseded
        };
        debug!(recovered, dropped = superseded.len(), "static renders requeued after context loss");
        for job in superseded {
            let _ = job.completion.send(StaticRenderOutcome::Removed);
        }
    }
}

fn take_queued<B: RenderBackend>(
    queue: &mut Vec<QueuedJob<B>>,
    consumer: RequesterId,
) -> Option<QueuedJob<B>> {
    let index = queue.iter().position(|job| job.consumer == consumer)?;
    Some(queue.remove(index))
}

/// Gives other local tasks one turn before the next pass.
#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxpool::{PoolOptions, SoftwareBackend};
    use futures::executor::LocalPool;

    struct Fill {
        position: Position,
        colour: [u8; 4],
    }

    impl StaticRenderJob<SoftwareBackend> for Fill {
        fn position(&self) -> Position {
            self.position
        }

        fn render(&mut self, frame: &mut Frame<'_, SoftwareBackend>) -> anyhow::Result<()> {
            frame.context_mut().fill(self.colour);
            Ok(())
        }
    }

    fn setup(size: usize, batch: usize) -> (LocalPool, StaticRenderScheduler<SoftwareBackend>) {
        let executor = LocalPool::new();
        let pool = ResourcePool::new(SoftwareBackend::new(), PoolOptions::new(size)).unwrap();
        let scheduler = StaticRenderScheduler::new(pool, executor.spawner(), batch);
        (executor, scheduler)
    }

    #[test]
    fn batch_limit_is_capped_by_pool_capacity() {
        let (_executor, scheduler) = setup(2, 8);
        assert_eq!(scheduler.batch_limit(), 2);
        let (_executor, scheduler) = setup(2, 0);
        assert_eq!(scheduler.batch_limit(), 1);
    }

    #[test]
    fn snapshot_carries_the_drawn_frame() {
        let (mut executor, scheduler) = setup(1, 1);
        let mut completion = scheduler
            .enqueue(
                RequesterId(1),
                Box::new(Fill {
                    position: Position::default(),
                    colour: [9, 8, 7, 255],
                }),
            )
            .unwrap();
        assert!(scheduler.is_draining());
        executor.run_until_stalled();

        match completion.try_outcome() {
            Some(StaticRenderOutcome::Rendered(image)) => {
                assert_eq!(image.get_pixel(0, 0).0, [9, 8, 7, 255]);
            }
            other => panic!("expected a snapshot, got {other:?}"),
        }
        assert!(!scheduler.is_draining());
        assert_eq!(scheduler.pool.stats().in_use, 0);
    }

    #[test]
    fn re_enqueue_replaces_the_earlier_job() {
        let (mut executor, scheduler) = setup(1, 1);
        let job = || {
            Box::new(Fill {
                position: Position::default(),
                colour: [1, 1, 1, 255],
            })
        };
        let mut first = scheduler.enqueue(RequesterId(1), job()).unwrap();
        let mut second = scheduler.enqueue(RequesterId(1), job()).unwrap();
        assert_eq!(scheduler.pending(), 1);
        executor.run_until_stalled();
        assert_eq!(first.try_outcome(), Some(StaticRenderOutcome::Removed));
        assert!(second.try_outcome().is_some_and(|outcome| outcome.is_rendered()));
    }
}
