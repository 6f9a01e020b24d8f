//! Blocking queue operations with real threads as tasks
use quickcheck_macros::quickcheck;
use r3_timerq::{
    tick, DynamicFifoQueue, FifoQueue, PopError, PopTimeoutError, PushTimeoutError, TryPopError,
};
use r3_timerq_port_std::{init_logger, run_in_interrupt, TICK_PERIOD};
use std::{
    sync::mpsc,
    thread::{self, sleep},
    time::{Duration, Instant},
};

r3_timerq_port_std::use_port!(unsafe struct SystemTraits);

type Queue = FifoQueue<SystemTraits, u32, [u8; 16]>;

/// Poll `f` until it returns `true`. Panics after a few seconds.
fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out");
        sleep(Duration::from_millis(1));
    }
}

#[test]
fn poppers_are_woken_in_order() {
    init_logger();
    let queue = Queue::new([0; 16], 1).unwrap();
    let (send, recv) = mpsc::channel();

    thread::scope(|s| {
        for (i, name) in ["A", "B"].into_iter().enumerate() {
            let send = send.clone();
            let queue = &queue;
            s.spawn(move || send.send((name, queue.pop().unwrap())).unwrap());
            // Don't start the next task until this one is in the wait queue
            wait_until(|| queue.num_blocked_poppers() == Ok(i + 1));
        }

        queue.push(1).unwrap();
        queue.push(2).unwrap();
    });

    let mut got: Vec<_> = recv.try_iter().collect();
    got.sort();
    assert_eq!(got, [("A", 1), ("B", 2)]);
    assert_eq!(queue.len(), Ok(0));
}

#[test]
fn pushers_are_woken_in_order() {
    init_logger();
    let queue = Queue::new([0; 16], 1).unwrap();
    queue.push(0).unwrap();

    thread::scope(|s| {
        for x in [1, 2] {
            let queue = &queue;
            s.spawn(move || queue.push(x).unwrap());
            wait_until(|| queue.num_blocked_pushers() == Ok(x as usize));
        }
        assert_eq!(queue.len(), Ok(1));

        // Each pop frees a slot that's immediately filled by the earliest
        // blocked pusher
        assert_eq!(queue.pop(), Ok(0));
        assert_eq!(queue.pop(), Ok(1));
        assert_eq!(queue.pop(), Ok(2));
        assert_eq!(queue.num_blocked_pushers(), Ok(0));
    });

    assert_eq!(queue.try_pop(), Err(TryPopError::QueueEmpty));
}

#[test]
fn pop_timeout_elapses() {
    init_logger();
    let queue = Queue::new([0; 16], 4).unwrap();
    let timeout = tick::Duration::from_ticks(50);

    let start = Instant::now();
    assert_eq!(queue.pop_timeout(timeout), Err(PopTimeoutError::Timeout));
    let elapsed = start.elapsed();

    log::debug!("elapsed = {elapsed:?}");
    assert!(elapsed >= timeout.to_time(TICK_PERIOD), "{elapsed:?}");
    assert_eq!(queue.len(), Ok(0));
    assert_eq!(queue.num_blocked_poppers(), Ok(0));

    // A late element goes into the queue instead of the timed-out task
    queue.push(5).unwrap();
    assert_eq!(queue.len(), Ok(1));
}

#[test]
fn push_timeout_elapses() {
    init_logger();
    let queue = Queue::new([0; 16], 2).unwrap();
    queue.push(1).unwrap();
    queue.push(2).unwrap();
    let timeout = tick::Duration::from_ticks(30);

    let start = Instant::now();
    assert_eq!(queue.push_timeout(3, timeout), Err(PushTimeoutError::Timeout));
    assert!(start.elapsed() >= timeout.to_time(TICK_PERIOD));

    // The rejected element never shows up
    assert_eq!(queue.pop(), Ok(1));
    assert_eq!(queue.pop(), Ok(2));
    assert_eq!(queue.try_pop(), Err(TryPopError::QueueEmpty));
}

#[test]
fn pop_timeout_completes_early() {
    init_logger();
    let queue = Queue::new([0; 16], 4).unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let start = Instant::now();
            let got = queue.pop_timeout(tick::Duration::from_ticks(10_000));
            (got, start.elapsed())
        });
        wait_until(|| queue.num_blocked_poppers() == Ok(1));
        queue.try_push(42).unwrap();

        let (got, elapsed) = waiter.join().unwrap();
        assert_eq!(got, Ok(42));
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    });
}

#[test]
fn blocking_from_interrupt() {
    init_logger();
    let queue = Queue::new([0; 16], 1).unwrap();

    run_in_interrupt(|| {
        assert_eq!(queue.pop(), Err(PopError::BadContext));
        assert_eq!(
            queue.pop_timeout(tick::Duration::from_ticks(1)),
            Err(PopTimeoutError::BadContext)
        );
        assert_eq!(queue.try_pop(), Err(TryPopError::QueueEmpty));
    });
}

/// An interrupt handler hands an element to a blocked task.
#[test]
fn interrupt_feeds_task() {
    init_logger();
    let queue = Queue::new([0; 16], 1).unwrap();

    thread::scope(|s| {
        let consumer = s.spawn(|| queue.pop());
        wait_until(|| queue.num_blocked_poppers() == Ok(1));
        run_in_interrupt(|| queue.try_push(7)).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    });
}

/// Every producer's elements arrive in the order in which it pushed them.
#[test]
fn producers_and_consumers() {
    init_logger();
    const NUM_PRODUCERS: u32 = 3;
    const NUM_CONSUMERS: usize = 2;
    const COUNT: u32 = 200;

    let queue = DynamicFifoQueue::<SystemTraits, u32>::new_dynamic(2).unwrap();
    let (send, recv) = mpsc::channel();

    thread::scope(|s| {
        for p in 0..NUM_PRODUCERS {
            let queue = &queue;
            s.spawn(move || {
                for i in 0..COUNT {
                    queue.push((p << 16) | i).unwrap();
                }
            });
        }

        let total = NUM_PRODUCERS * COUNT;
        for c in 0..NUM_CONSUMERS {
            let (queue, send) = (&queue, send.clone());
            let share = total as usize / NUM_CONSUMERS
                + (c < total as usize % NUM_CONSUMERS) as usize;
            s.spawn(move || {
                let got: Vec<u32> = (0..share).map(|_| queue.pop().unwrap()).collect();
                send.send(got).unwrap();
            });
        }
    });
    drop(send);

    let mut counts = [0; NUM_PRODUCERS as usize];
    let mut total = 0;
    for got in recv {
        let mut last = [None; NUM_PRODUCERS as usize];
        for x in got {
            let (p, i) = ((x >> 16) as usize, x & 0xffff);
            // Per-consumer order is a subsequence of the producer's order
            assert!(last[p].map_or(true, |l| l < i), "{x:#x} after {last:?}");
            last[p] = Some(i);
            counts[p] += 1;
            total += 1;
        }
    }

    assert_eq!(counts, [COUNT; NUM_PRODUCERS as usize]);
    assert_eq!(total, NUM_PRODUCERS * COUNT);
    assert_eq!(queue.len(), Ok(0));
}

/// A blocking producer and a blocking consumer transfer any sequence intact.
#[quickcheck]
fn transfer_preserves_order(values: Vec<u32>) {
    init_logger();
    let queue = Queue::new([0; 16], 2).unwrap();

    let got = thread::scope(|s| {
        let consumer = s.spawn(|| {
            (0..values.len())
                .map(|_| queue.pop().unwrap())
                .collect::<Vec<_>>()
        });
        for &x in &values {
            queue.push(x).unwrap();
        }
        consumer.join().unwrap()
    });

    assert_eq!(got, values);
}
