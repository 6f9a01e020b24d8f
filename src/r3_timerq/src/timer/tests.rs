use quickcheck_macros::quickcheck;
use std::cell::{Cell, RefCell};

use super::*;
use crate::{
    error::CreateTimerError,
    test_port::{init_logger, run_in_interrupt, with_cpu_lock, TestTraits},
    tick::{Duration, Instant},
};

thread_local! {
    /// `(param, tick, is_running)` for every callback invocation
    static FIRED: RefCell<Vec<(usize, u64, bool)>> = RefCell::new(Vec::new());
}

fn take_fired() -> Vec<(usize, u64, bool)> {
    FIRED.with(|x| x.take())
}

fn record(timer: TimerRef<'_, TestTraits>, param: usize) {
    let now = timer.supervisor().now().as_ticks();
    let running = timer.is_running().unwrap();
    FIRED.with(|x| x.borrow_mut().push((param, now, running)));
}

fn new_supervisor(pool_len: usize) -> &'static TimerSupervisor<TestTraits> {
    init_logger();
    let pool: Vec<TimerCb<TestTraits>> = (0..pool_len).map(|_| TimerCb::INIT).collect();
    Box::leak(Box::new(TimerSupervisor::new(Box::leak(
        pool.into_boxed_slice(),
    ))))
}

fn tick_n(supervisor: &TimerSupervisor<TestTraits>, n: usize) {
    for _ in 0..n {
        run_in_interrupt(|| supervisor.tick_interrupt_handler());
    }
}

fn armed(supervisor: &TimerSupervisor<TestTraits>) -> Vec<(TimerId, Instant)> {
    let mut lock = lock_cpu::<TestTraits>().unwrap();
    supervisor
        .list()
        .iter_expirations(lock.borrow_mut(), supervisor.pool())
        .collect()
}

#[test]
fn fires_exactly_once() {
    let sv = new_supervisor(2);
    let timer = sv.create_timer(record, 1).unwrap();
    assert!(!timer.is_running().unwrap());

    timer.start_after(Duration::from_ticks(3)).unwrap();
    assert!(timer.is_running().unwrap());
    assert_eq!(timer.expiration().unwrap(), Some(Instant::from_ticks(4)));

    tick_n(sv, 3);
    assert_eq!(take_fired(), []);

    tick_n(sv, 1);
    // The timer is detached before the callback runs
    assert_eq!(take_fired(), [(1, 4, false)]);
    assert!(!timer.is_running().unwrap());
    assert_eq!(timer.expiration().unwrap(), None);

    tick_n(sv, 10);
    assert_eq!(take_fired(), []);
}

#[test]
fn zero_duration_fires_on_next_tick() {
    let sv = new_supervisor(1);
    tick_n(sv, 5);

    let timer = sv.create_timer(record, 7).unwrap();
    timer.start_after(Duration::ZERO).unwrap();
    assert_eq!(timer.expiration().unwrap(), Some(Instant::from_ticks(6)));

    tick_n(sv, 1);
    assert_eq!(take_fired(), [(7, 6, false)]);
}

#[test]
fn start_at_past_fires_on_next_tick() {
    let sv = new_supervisor(1);
    tick_n(sv, 5);

    let timer = sv.create_timer(record, 3).unwrap();
    timer.start_at(Instant::from_ticks(2)).unwrap();
    assert_eq!(sv.next_expiration().unwrap(), Some(Instant::from_ticks(2)));

    tick_n(sv, 1);
    assert_eq!(take_fired(), [(3, 6, false)]);
    assert_eq!(sv.next_expiration().unwrap(), None);
}

#[test]
fn start_after_saturates() {
    let sv = new_supervisor(1);
    let timer = sv.create_timer(record, 0).unwrap();
    timer.start_after(Duration::MAX).unwrap();
    assert_eq!(
        timer.expiration().unwrap(),
        Some(Instant::from_ticks(u64::MAX))
    );
}

#[test]
fn ties_fire_in_insertion_order() {
    let sv = new_supervisor(4);
    let timers: Vec<_> = (0..4)
        .map(|i| sv.create_timer(record, i).unwrap())
        .collect();

    for &i in &[2, 0, 3] {
        timers[i].start_at(Instant::from_ticks(3)).unwrap();
    }
    timers[1].start_at(Instant::from_ticks(2)).unwrap();

    tick_n(sv, 3);
    assert_eq!(
        take_fired(),
        [(1, 2, false), (2, 3, false), (0, 3, false), (3, 3, false)]
    );
}

#[test]
fn stop_prevents_firing_and_is_idempotent() {
    let sv = new_supervisor(2);
    let t0 = sv.create_timer(record, 0).unwrap();
    let t1 = sv.create_timer(record, 1).unwrap();

    t0.start_after(Duration::from_ticks(1)).unwrap();
    t1.start_after(Duration::from_ticks(1)).unwrap();

    t0.stop().unwrap();
    assert!(!t0.is_running().unwrap());
    t0.stop().unwrap();
    assert!(!t0.is_running().unwrap());

    tick_n(sv, 5);
    assert_eq!(take_fired(), [(1, 2, false)]);

    // Stopping an expired timer is a no-op too
    t1.stop().unwrap();
}

#[test]
fn restart_moves_timer() {
    let sv = new_supervisor(2);
    let t0 = sv.create_timer(record, 0).unwrap();
    let t1 = sv.create_timer(record, 1).unwrap();

    t0.start_after(Duration::from_ticks(9)).unwrap();
    t1.start_after(Duration::from_ticks(4)).unwrap();
    assert_eq!(
        armed(sv),
        [
            (t1.id(), Instant::from_ticks(5)),
            (t0.id(), Instant::from_ticks(10))
        ]
    );

    t0.start_after(Duration::from_ticks(1)).unwrap();
    assert_eq!(
        armed(sv),
        [
            (t0.id(), Instant::from_ticks(2)),
            (t1.id(), Instant::from_ticks(5))
        ]
    );

    tick_n(sv, 20);
    assert_eq!(take_fired(), [(0, 2, false), (1, 5, false)]);
}

thread_local! {
    static REARM_COUNT: Cell<usize> = Cell::new(0);
}

fn rearm(timer: TimerRef<'_, TestTraits>, param: usize) {
    record(timer, param);
    let n = REARM_COUNT.with(|x| x.replace(x.get() + 1));
    if n < 2 {
        timer.start_after(Duration::from_ticks(1)).unwrap();
        assert!(timer.is_running().unwrap());
    }
}

#[test]
fn rearm_from_callback() {
    let sv = new_supervisor(1);
    let timer = sv.create_timer(rearm, 5).unwrap();
    timer.start_after(Duration::ZERO).unwrap();

    tick_n(sv, 10);
    // Fired at 1, re-armed for 1 + 1 + 1, and so on
    assert_eq!(take_fired(), [(5, 1, false), (5, 3, false), (5, 5, false)]);
    assert!(!timer.is_running().unwrap());
}

fn stop_other(timer: TimerRef<'_, TestTraits>, param: usize) {
    record(timer, param);
    // Timer 1 is due at the same tick, but it's stopped before it fires
    let sv = timer.supervisor();
    let mut lock = lock_cpu::<TestTraits>().unwrap();
    let other = sv.list().front(lock.borrow_mut(), sv.pool()).map(|i| TimerRef {
        supervisor: sv,
        id: TimerId(i),
        generation: *sv.pool()[i].generation.read(&*lock),
    });
    drop(lock);
    if let Some(other) = other {
        other.stop().unwrap();
    }
}

#[test]
fn callback_can_stop_pending_timer() {
    let sv = new_supervisor(2);
    let t0 = sv.create_timer(stop_other, 0).unwrap();
    let t1 = sv.create_timer(record, 1).unwrap();
    t0.start_at(Instant::from_ticks(1)).unwrap();
    t1.start_at(Instant::from_ticks(1)).unwrap();

    tick_n(sv, 3);
    assert_eq!(take_fired(), [(0, 1, false)]);
    assert!(!t1.is_running().unwrap());
}

#[test]
fn drop_releases_control_block() {
    let sv = new_supervisor(1);
    let timer = sv.create_timer(record, 0).unwrap();
    assert_eq!(
        sv.create_timer(record, 1).unwrap_err(),
        CreateTimerError::AllocationFailure
    );

    timer.start_after(Duration::from_ticks(1)).unwrap();
    drop(timer);
    assert_eq!(sv.next_expiration().unwrap(), None);

    let timer = sv.create_timer(record, 2).unwrap();
    assert!(!timer.is_running().unwrap());

    tick_n(sv, 5);
    assert_eq!(take_fired(), []);
}

thread_local! {
    static SUPERVISOR: Cell<Option<&'static TimerSupervisor<TestTraits>>> = Cell::new(None);
    static OWNED: RefCell<Option<SoftwareTimer<'static, TestTraits>>> = RefCell::new(None);
}

fn release_and_reclaim(timer: TimerRef<'_, TestTraits>, param: usize) {
    record(timer, param);
    let sv = SUPERVISOR.get().unwrap();

    // Release the control block and let a new timer claim it
    drop(OWNED.take());
    let new = sv.create_timer(record, 99).unwrap();
    assert_eq!(new.id(), timer.id());
    new.start_after(Duration::from_ticks(5)).unwrap();
    let expiration = new.expiration().unwrap();

    // `timer` now refers to a previous owner of the slot
    timer.start_after(Duration::ZERO).unwrap();
    assert!(!timer.is_running().unwrap());
    assert_eq!(timer.expiration().unwrap(), None);
    timer.stop().unwrap();

    assert!(new.is_running().unwrap());
    assert_eq!(new.expiration().unwrap(), expiration);
    OWNED.set(Some(new));
}

#[test]
fn stale_ref_does_not_touch_new_owner() {
    let sv = new_supervisor(1);
    SUPERVISOR.set(Some(sv));
    let timer = sv.create_timer(release_and_reclaim, 1).unwrap();
    timer.start_after(Duration::ZERO).unwrap();
    OWNED.set(Some(timer));

    tick_n(sv, 10);
    // Only the new owner's own request makes it fire
    assert_eq!(take_fired(), [(1, 1, false), (99, 7, false)]);

    drop(OWNED.take());
}

#[test]
fn bad_context() {
    let sv = new_supervisor(1);
    let timer = sv.create_timer(record, 0).unwrap();

    with_cpu_lock(|| {
        assert_eq!(
            sv.create_timer(record, 1).unwrap_err(),
            CreateTimerError::BadContext
        );
        assert_eq!(
            timer.start_after(Duration::ZERO),
            Err(StartTimerError::BadContext)
        );
        assert_eq!(
            timer.start_at(Instant::ZERO),
            Err(StartTimerError::BadContext)
        );
        assert_eq!(timer.stop(), Err(StopTimerError::BadContext));
        assert_eq!(timer.is_running(), Err(QueryTimerError::BadContext));
        assert_eq!(timer.expiration(), Err(QueryTimerError::BadContext));
        assert_eq!(sv.next_expiration(), Err(QueryTimerError::BadContext));
    });
}

#[test]
#[should_panic = "CPU Lock is active"]
fn tick_with_cpu_lock_panics() {
    let sv = new_supervisor(1);
    with_cpu_lock(|| sv.tick_interrupt_handler());
}

#[test]
fn timer_operations_in_interrupt_context() {
    let sv = new_supervisor(1);
    let timer = run_in_interrupt(|| sv.create_timer(record, 4)).unwrap();
    run_in_interrupt(|| timer.start_after(Duration::ZERO)).unwrap();
    tick_n(sv, 1);
    assert_eq!(take_fired(), [(4, 1, false)]);
}

#[test]
fn debug_lists_armed_timers() {
    let sv = new_supervisor(2);
    let timer = sv.create_timer(record, 0).unwrap();
    timer.start_at(Instant::from_ticks(42)).unwrap();

    let s = format!("{sv:?}");
    log::debug!("{s}");
    assert!(s.contains("@42"), "{s}");

    let s = format!("{:?}", sv.pool());
    assert!(s.contains("owned: CpuLockCell(true)"), "{s}");
}

/// The active list is sorted by expiration after every operation.
#[quickcheck]
fn list_stays_sorted(ops: Vec<(u8, Option<u8>)>) {
    const POOL_LEN: usize = 8;
    let sv = new_supervisor(POOL_LEN);
    let timers: Vec<_> = (0..POOL_LEN)
        .map(|i| sv.create_timer(record, i).unwrap())
        .collect();

    for (i, op) in ops {
        let timer = &timers[i as usize % POOL_LEN];
        match op {
            Some(d) if d % 16 == 0 => tick_n(sv, 1),
            Some(d) => timer.start_after(Duration::from_ticks(d.into())).unwrap(),
            None => timer.stop().unwrap(),
        }

        let list = armed(sv);
        assert!(
            list.windows(2).all(|w| w[0].1 <= w[1].1),
            "not sorted: {list:?}"
        );

        let running = timers.iter().filter(|t| t.is_running().unwrap()).count();
        assert_eq!(list.len(), running);
    }

    take_fired();
}
