use std::cell::RefCell;
use std::rc::Rc;

use ctxpool::{Frame, PoolOptions, RequesterId, ResourcePool, SlotId, SoftwareBackend};
use futures::executor::LocalPool;
use scheduler::{Position, StaticRenderJob, StaticRenderOutcome, StaticRenderScheduler};

type Log = Rc<RefCell<Vec<&'static str>>>;

struct Recorded {
    name: &'static str,
    position: Position,
    log: Log,
    pool: ResourcePool<SoftwareBackend>,
    busy: Rc<RefCell<Vec<usize>>>,
    fail: bool,
    on_render: Option<Box<dyn FnOnce()>>,
}

impl Recorded {
    fn new(name: &'static str, top: f32, log: &Log, pool: &ResourcePool<SoftwareBackend>) -> Self {
        Self {
            name,
            position: Position::new(top, 0.0),
            log: Rc::clone(log),
            pool: pool.clone(),
            busy: Rc::default(),
            fail: false,
            on_render: None,
        }
    }
}

impl StaticRenderJob<SoftwareBackend> for Recorded {
    fn position(&self) -> Position {
        self.position
    }

    fn render(&mut self, frame: &mut Frame<'_, SoftwareBackend>) -> anyhow::Result<()> {
        self.log.borrow_mut().push(self.name);
        self.busy.borrow_mut().push(self.pool.stats().in_use);
        if let Some(hook) = self.on_render.take() {
            hook();
        }
        if self.fail {
            anyhow::bail!("{} has no artwork", self.name);
        }
        frame.context_mut().fill([200, 10, 10, 255]);
        Ok(())
    }
}

fn setup(
    size: usize,
    batch: usize,
) -> (
    LocalPool,
    ResourcePool<SoftwareBackend>,
    StaticRenderScheduler<SoftwareBackend>,
    Log,
) {
    let executor = LocalPool::new();
    let pool = ResourcePool::new(SoftwareBackend::new(), PoolOptions::new(size)).unwrap();
    let scheduler = StaticRenderScheduler::new(pool.clone(), executor.spawner(), batch);
    (executor, pool, scheduler, Rc::default())
}

#[test]
fn renders_top_to_bottom_regardless_of_arrival() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let mut completions = Vec::new();
    for (id, (name, top)) in [("c1", 0.0), ("c2", 100.0), ("c3", 50.0)]
        .into_iter()
        .enumerate()
    {
        completions.push(
            scheduler
                .enqueue(
                    RequesterId(id as u64),
                    Box::new(Recorded::new(name, top, &log, &pool)),
                )
                .unwrap(),
        );
    }

    executor.run_until_stalled();
    assert_eq!(*log.borrow(), vec!["c1", "c3", "c2"]);
    for completion in &mut completions {
        assert!(completion.try_outcome().is_some_and(|o| o.is_rendered()));
    }
    assert_eq!(pool.stats().in_use, 0);
    assert!(!scheduler.is_draining());
}

#[test]
fn left_edge_then_arrival_break_ties() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let mut right = Recorded::new("right", 10.0, &log, &pool);
    right.position.left = 200.0;
    let first = Recorded::new("first", 10.0, &log, &pool);
    let second = Recorded::new("second", 10.0, &log, &pool);

    let _a = scheduler.enqueue(RequesterId(1), Box::new(right)).unwrap();
    let _b = scheduler.enqueue(RequesterId(2), Box::new(first)).unwrap();
    let _c = scheduler.enqueue(RequesterId(3), Box::new(second)).unwrap();
    executor.run_until_stalled();
    assert_eq!(*log.borrow(), vec!["first", "second", "right"]);
}

#[test]
fn late_arrivals_are_sorted_into_the_next_pass() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let mut first = Recorded::new("c1", 0.0, &log, &pool);
    let late = Recorded::new("late", -10.0, &log, &pool);
    let late_slot = Rc::new(RefCell::new(None));
    {
        let scheduler = scheduler.clone();
        let late_slot = Rc::clone(&late_slot);
        first.on_render = Some(Box::new(move || {
            let completion = scheduler.enqueue(RequesterId(9), Box::new(late)).unwrap();
            *late_slot.borrow_mut() = Some(completion);
        }));
    }

    let _c1 = scheduler.enqueue(RequesterId(1), Box::new(first)).unwrap();
    let _c2 = scheduler
        .enqueue(RequesterId(2), Box::new(Recorded::new("c2", 100.0, &log, &pool)))
        .unwrap();
    executor.run_until_stalled();
    assert_eq!(*log.borrow(), vec!["c1", "late", "c2"]);
    assert!(late_slot.borrow().is_some());
}

#[test]
fn batches_never_exceed_the_limit() {
    let (mut executor, pool, scheduler, log) = setup(3, 2);
    assert_eq!(scheduler.batch_limit(), 2);
    let blockers: Vec<_> = (100..103)
        .map(|id| pool.borrow(RequesterId(id)).try_take().unwrap().unwrap())
        .collect();

    let _completions: Vec<_> = (0..5)
        .map(|id| {
            scheduler
                .enqueue(
                    RequesterId(id),
                    Box::new(Recorded::new("job", id as f32, &log, &pool)),
                )
                .unwrap()
        })
        .collect();
    executor.run_until_stalled();
    assert_eq!(pool.stats().queue_length, 2);
    assert_eq!(scheduler.in_flight(), 2);
    assert_eq!(scheduler.pending(), 3);

    drop(blockers);
    executor.run_until_stalled();
    assert_eq!(log.borrow().len(), 5);
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn removed_jobs_resolve_without_rendering() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let blocker = pool.borrow(RequesterId(50)).try_take().unwrap().unwrap();

    let mut in_flight = scheduler
        .enqueue(RequesterId(1), Box::new(Recorded::new("a", 0.0, &log, &pool)))
        .unwrap();
    let mut queued = scheduler
        .enqueue(RequesterId(2), Box::new(Recorded::new("b", 10.0, &log, &pool)))
        .unwrap();
    executor.run_until_stalled();
    assert!(pool.is_pending(RequesterId(1)));

    assert!(scheduler.remove(RequesterId(2)));
    assert!(scheduler.remove(RequesterId(1)));
    assert!(!scheduler.remove(RequesterId(3)));
    assert!(!pool.is_pending(RequesterId(1)));
    executor.run_until_stalled();

    assert_eq!(queued.try_outcome(), Some(StaticRenderOutcome::Removed));
    assert_eq!(in_flight.try_outcome(), Some(StaticRenderOutcome::Removed));
    assert!(log.borrow().is_empty());
    blocker.release();
    assert_eq!(pool.stats().available, 1);
}

#[test]
fn failed_job_reports_and_returns_its_slot() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let mut broken = Recorded::new("broken", 0.0, &log, &pool);
    broken.fail = true;
    let mut failed = scheduler.enqueue(RequesterId(1), Box::new(broken)).unwrap();
    let mut next = scheduler
        .enqueue(RequesterId(2), Box::new(Recorded::new("next", 5.0, &log, &pool)))
        .unwrap();
    executor.run_until_stalled();

    match failed.try_outcome() {
        Some(StaticRenderOutcome::Failed(reason)) => assert!(reason.contains("no artwork")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(next.try_outcome().is_some_and(|o| o.is_rendered()));
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn lost_context_after_hand_off_is_retried_on_a_fresh_slot() {
    let (mut executor, pool, scheduler, log) = setup(1, 1);
    let blocker = pool.borrow(RequesterId(50)).try_take().unwrap().unwrap();
    let mut completion = scheduler
        .enqueue(RequesterId(1), Box::new(Recorded::new("c1", 0.0, &log, &pool)))
        .unwrap();
    executor.run_until_stalled();
    assert_eq!(pool.stats().queue_length, 1);

    blocker.release();
    assert!(pool.backend().lose_context(SlotId(0)));
    executor.run_until_stalled();

    match completion.try_outcome() {
        Some(StaticRenderOutcome::Rendered(image)) => {
            assert_eq!(image.get_pixel(0, 0).0, [200, 10, 10, 255]);
        }
        other => panic!("expected a snapshot, got {other:?}"),
    }
    assert_eq!(*log.borrow(), vec!["c1"]);
    assert_eq!(pool.backend().contexts_created(), 2);
    assert_eq!(pool.stats().invalid, 0);
    assert_eq!(scheduler.in_flight(), 0);
}

struct LosesContext {
    pool: ResourcePool<SoftwareBackend>,
    renders: Rc<RefCell<u32>>,
}

impl StaticRenderJob<SoftwareBackend> for LosesContext {
    fn position(&self) -> Position {
        Position::default()
    }

    fn render(&mut self, frame: &mut Frame<'_, SoftwareBackend>) -> anyhow::Result<()> {
        *self.renders.borrow_mut() += 1;
        self.pool.backend().lose_context(frame.slot());
        Ok(())
    }
}

#[test]
fn repeated_context_loss_eventually_fails() {
    let (mut executor, pool, scheduler, _log) = setup(1, 1);
    let renders = Rc::new(RefCell::new(0));
    let mut completion = scheduler
        .enqueue(
            RequesterId(1),
            Box::new(LosesContext {
                pool: pool.clone(),
                renders: Rc::clone(&renders),
            }),
        )
        .unwrap();
    executor.run_until_stalled();

    assert!(matches!(
        completion.try_outcome(),
        Some(StaticRenderOutcome::Failed(reason)) if reason.contains("lost")
    ));
    assert_eq!(*renders.borrow(), 4);
    assert_eq!(pool.stats().in_use, 0);
    assert!(!scheduler.is_draining());
}
