use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use ctxpool::{
    BackendError, BorrowError, BorrowTicket, BorrowedSlot, PoolError, PoolOptions, ReleaseOutcome,
    RequesterId, ResourcePool, SlotId, SoftwareBackend, SurfaceParams,
};
use futures::executor::{block_on, LocalPool};
use futures::task::LocalSpawnExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Ticket = BorrowTicket<SoftwareBackend>;
type Lease = BorrowedSlot<SoftwareBackend>;

fn options(size: usize) -> PoolOptions {
    PoolOptions {
        size,
        surface: SurfaceParams {
            width: 16,
            height: 16,
            ..SurfaceParams::default()
        },
        borrow_timeout: None,
    }
}

fn pool(size: usize) -> (ResourcePool<SoftwareBackend>, SoftwareBackend) {
    let backend = SoftwareBackend::new();
    let pool = ResourcePool::new(backend.clone(), options(size)).unwrap();
    (pool, backend)
}

fn take_ready(ticket: &mut Ticket) -> Lease {
    match ticket.try_take() {
        Some(Ok(lease)) => lease,
        Some(Err(err)) => panic!("borrow rejected: {err}"),
        None => panic!("borrow still queued"),
    }
}

#[test]
fn queue_is_served_in_arrival_order() {
    let (pool, _) = pool(1);
    let a = take_ready(&mut pool.borrow(RequesterId(1)));
    let mut b = pool.borrow(RequesterId(2));
    let mut c = pool.borrow(RequesterId(3));
    assert!(b.is_queued() && c.is_queued());
    assert_eq!(
        pool.queued_requesters(),
        vec![RequesterId(2), RequesterId(3)]
    );

    assert_eq!(a.release(), ReleaseOutcome::Released);
    let b = take_ready(&mut b);
    assert_eq!(b.slot(), SlotId(0));
    assert!(c.try_take().is_none());
    assert_eq!(pool.owner_of(SlotId(0)), Some(RequesterId(2)));

    drop(b);
    let c = take_ready(&mut c);
    assert_eq!(c.requester(), RequesterId(3));
    assert_eq!(pool.stats().queue_length, 0);
}

#[test]
fn cancelled_request_is_rejected_once_and_never_resolves() {
    let (pool, _) = pool(1);
    let a = take_ready(&mut pool.borrow(RequesterId(1)));
    let mut b = pool.borrow(RequesterId(2));

    assert!(pool.cancel(RequesterId(2)));
    assert!(!pool.cancel(RequesterId(2)));
    assert!(matches!(b.try_take(), Some(Err(BorrowError::Cancelled))));

    a.release();
    assert_eq!(pool.owner_of(SlotId(0)), None);
    assert_eq!(pool.stats().available, 1);
    assert!(b.try_take().is_none());
}

#[test]
fn timed_out_request_leaves_the_queue() {
    let backend = SoftwareBackend::new();
    let pool = ResourcePool::new(
        backend,
        options(1).with_borrow_timeout(Duration::from_secs(1)),
    )
    .unwrap();
    let a = take_ready(&mut pool.borrow(RequesterId(1)));
    let mut b = pool.borrow(RequesterId(2));

    assert_eq!(pool.tick(Instant::now()), 0);
    assert_eq!(pool.tick(Instant::now() + Duration::from_secs(2)), 1);
    match b.try_take() {
        Some(Err(BorrowError::TimedOut { waited })) => assert!(waited >= Duration::from_secs(1)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(!pool.is_pending(RequesterId(2)));

    a.release();
    assert_eq!(pool.stats().available, 1);
}

#[test]
fn degraded_pool_runs_with_the_slots_that_built() {
    let backend = SoftwareBackend::new();
    backend.fail_slot(SlotId(1));
    backend.fail_slot(SlotId(3));
    let pool = ResourcePool::new(backend.clone(), options(5)).unwrap();

    assert_eq!(pool.stats().total, 3);
    assert_eq!(pool.slot_ids(), vec![SlotId(0), SlotId(2), SlotId(4)]);
    assert_eq!(backend.live_contexts(), 3);

    let leases: Vec<Lease> = (0..3)
        .map(|id| take_ready(&mut pool.borrow(RequesterId(id))))
        .collect();
    let mut waiting = pool.borrow(RequesterId(9));
    assert!(waiting.is_queued());
    for lease in leases {
        assert!(lease.release().is_released());
    }
    assert_eq!(take_ready(&mut waiting).slot(), SlotId(0));
    assert_eq!(pool.stats().in_use, 1);
}

#[test]
fn pool_without_any_slot_is_fatal() {
    let backend = SoftwareBackend::new();
    backend.fail_slot(SlotId(0));
    backend.fail_slot(SlotId(1));
    match ResourcePool::new(backend, options(2)) {
        Err(PoolError::NoUsableSlots {
            requested,
            failures,
        }) => {
            assert_eq!(requested, 2);
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected NoUsableSlots, got {other:?}"),
    }
    assert!(matches!(
        ResourcePool::new(SoftwareBackend::new(), options(0)),
        Err(PoolError::InvalidSize)
    ));
}

#[test]
fn context_ceiling_limits_the_pool() {
    let backend = SoftwareBackend::with_context_limit(3);
    let pool = ResourcePool::new(backend.clone(), options(6)).unwrap();
    assert_eq!(pool.capacity(), 3);
    assert_eq!(backend.peak_contexts(), 3);
}

#[test]
fn lost_contexts_are_skipped_then_recovered() {
    let (pool, backend) = pool(2);
    assert!(backend.lose_context(SlotId(0)));
    let stats = pool.stats();
    assert_eq!((stats.available, stats.invalid), (1, 1));

    let lease = take_ready(&mut pool.borrow(RequesterId(1)));
    assert_eq!(lease.slot(), SlotId(1));
    let mut waiting = pool.borrow(RequesterId(2));
    assert!(waiting.is_queued());

    assert_eq!(pool.recover_lost_slots(), 1);
    let recovered = take_ready(&mut waiting);
    assert_eq!(recovered.slot(), SlotId(0));
    assert!(recovered.is_alive());
    assert_eq!(pool.stats().invalid, 0);
    assert_eq!(backend.contexts_created(), 3);
    assert_eq!(backend.live_contexts(), 2);
}

#[test]
fn drawing_on_a_lost_context_reports_loss() {
    let (pool, backend) = pool(1);
    let lease = take_ready(&mut pool.borrow(RequesterId(1)));
    backend.lose_context(lease.slot());

    assert!(!lease.is_alive());
    assert_eq!(
        lease.with_frame(|frame| frame.clear()).unwrap_err(),
        BackendError::ContextLost(SlotId(0))
    );
    lease.release();
    assert_eq!(pool.stats().invalid, 1);
    let mut waiting = pool.borrow(RequesterId(2));
    assert!(waiting.is_queued());
    assert_eq!(pool.recover_lost_slots(), 1);
    assert_eq!(pool.owner_of(SlotId(0)), Some(RequesterId(2)));
    assert!(take_ready(&mut waiting).is_alive());
}

#[test]
fn stale_handle_cannot_release_a_relent_slot() {
    let (pool, _) = pool(1);
    let stale = take_ready(&mut pool.borrow(RequesterId(1)));
    assert_eq!(pool.force_release_for(RequesterId(1)), Some(SlotId(0)));
    assert_eq!(pool.force_release_for(RequesterId(1)), None);
    assert!(!stale.is_current());

    let fresh = take_ready(&mut pool.borrow(RequesterId(2)));
    assert_eq!(stale.release(), ReleaseOutcome::Stale);
    assert_eq!(pool.owner_of(SlotId(0)), Some(RequesterId(2)));
    assert!(fresh.is_current());
}

#[test]
fn misdirected_releases_are_ignored() {
    let (pool, _) = pool(1);
    let lease = take_ready(&mut pool.borrow(RequesterId(1)));
    assert_eq!(
        pool.release(SlotId(7), RequesterId(1)),
        ReleaseOutcome::UnknownSlot
    );
    assert_eq!(
        pool.release(SlotId(0), RequesterId(2)),
        ReleaseOutcome::NotOwner
    );
    assert_eq!(pool.owner_of(SlotId(0)), Some(RequesterId(1)));
    drop(lease);
    assert_eq!(pool.owner_of(SlotId(0)), None);
}

#[test]
fn one_request_and_one_slot_per_requester() {
    let (pool, _) = pool(1);
    let held = take_ready(&mut pool.borrow(RequesterId(1)));
    assert_eq!(
        pool.borrow(RequesterId(1)).try_take().map(|r| r.map(|l| l.slot())),
        Some(Err(BorrowError::AlreadyHolding {
            requester: RequesterId(1),
            slot: SlotId(0),
        }))
    );

    let _queued = pool.borrow(RequesterId(2));
    let mut duplicate = pool.borrow(RequesterId(2));
    assert!(matches!(
        duplicate.try_take(),
        Some(Err(BorrowError::AlreadyPending(RequesterId(2))))
    ));
    assert_eq!(pool.stats().queue_length, 1);
    drop(held);
}

#[test]
fn release_clears_the_surface_but_keeps_the_cache() {
    let (pool, _) = pool(1);
    let first = take_ready(&mut pool.borrow(RequesterId(1)));
    first
        .with_frame(|frame| {
            frame.context_mut().fill([255, 0, 0, 255]);
            *frame.cache().get_or_insert_with("mask", || 0_u32) += 1;
        })
        .unwrap();
    first.release();

    let second = take_ready(&mut pool.borrow(RequesterId(2)));
    let (blank, mask) = second
        .with_frame(|frame| {
            (
                frame.context().is_blank(),
                frame.cache().get::<u32>("mask").copied(),
            )
        })
        .unwrap();
    assert!(blank);
    assert_eq!(mask, Some(1));
}

#[test]
fn shutdown_rejects_waiters_and_frees_every_context() {
    let (pool, backend) = pool(2);
    let a = take_ready(&mut pool.borrow(RequesterId(1)));
    let _b = take_ready(&mut pool.borrow(RequesterId(2)));
    let mut c = pool.borrow(RequesterId(3));

    pool.shutdown();
    assert!(matches!(c.try_take(), Some(Err(BorrowError::PoolClosed))));
    assert_eq!(a.release(), ReleaseOutcome::Closed);
    assert!(matches!(
        block_on(pool.borrow(RequesterId(4))),
        Err(BorrowError::PoolClosed)
    ));
    assert_eq!(backend.live_contexts(), 0);
    assert!(pool.is_closed());
}

#[test]
fn queued_borrows_resume_tasks_in_order() {
    let (pool, _) = pool(1);
    let holder = take_ready(&mut pool.borrow(RequesterId(0)));
    let order = Rc::new(RefCell::new(Vec::new()));

    let mut executor = LocalPool::new();
    let spawner = executor.spawner();
    for id in 1..=3 {
        let ticket = pool.borrow(RequesterId(id));
        let order = Rc::clone(&order);
        spawner
            .spawn_local(async move {
                let lease = ticket.await.unwrap();
                order.borrow_mut().push(lease.requester().0);
                lease.release();
            })
            .unwrap();
    }

    executor.run_until_stalled();
    assert!(order.borrow().is_empty());
    holder.release();
    executor.run_until_stalled();
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
    assert_eq!(pool.stats().available, 1);
}

#[test]
fn random_workload_keeps_capacity_and_balance() {
    let backend = SoftwareBackend::new();
    let pool = ResourcePool::new(backend.clone(), options(4)).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut held: HashMap<u64, Lease> = HashMap::new();
    let mut pending: HashMap<u64, Ticket> = HashMap::new();

    for _ in 0..2_000 {
        let requester = rng.gen_range(0..12_u64);
        if let Some(lease) = held.remove(&requester) {
            if rng.gen_bool(0.5) {
                assert!(lease.release().is_released());
            } else {
                drop(lease);
            }
        } else if pending.contains_key(&requester) {
            if rng.gen_bool(0.3) {
                assert!(pool.cancel(RequesterId(requester)));
                let mut ticket = pending.remove(&requester).unwrap();
                assert!(matches!(ticket.try_take(), Some(Err(BorrowError::Cancelled))));
            }
        } else {
            pending.insert(requester, pool.borrow(RequesterId(requester)));
        }

        let resolved: Vec<u64> = pending
            .iter_mut()
            .filter_map(|(id, ticket)| match ticket.try_take() {
                Some(Ok(lease)) => {
                    held.insert(*id, lease);
                    Some(*id)
                }
                Some(Err(err)) => panic!("unexpected rejection: {err}"),
                None => None,
            })
            .collect();
        for id in resolved {
            pending.remove(&id);
        }

        let stats = pool.stats();
        assert_eq!(stats.in_use, held.len());
        assert!(stats.in_use <= stats.total);
        assert_eq!(stats.in_use + stats.available + stats.invalid, stats.total);
        assert_eq!(stats.queue_length, pending.len());
        let slots: HashSet<SlotId> = held.values().map(|lease| lease.slot()).collect();
        assert_eq!(slots.len(), held.len(), "a slot was lent twice");
        if !pending.is_empty() {
            assert_eq!(stats.available, 0, "waiter left queued beside a free slot");
        }
    }

    for id in pending.keys() {
        pool.cancel(RequesterId(*id));
    }
    held.clear();
    let stats = pool.stats();
    assert_eq!((stats.in_use, stats.available, stats.queue_length), (0, 4, 0));
    assert_eq!(backend.contexts_created(), 4);
    assert_eq!(backend.live_contexts(), 4);
}
