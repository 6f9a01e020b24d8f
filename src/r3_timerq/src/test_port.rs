//! A single-threaded port for unit tests
//!
//! The CPU Lock state and the current context are tracked per thread, and
//! every test thread is a task. Nothing ever wakes a blocked task, so a timed
//! block times out immediately, and an untimed block is a test failure.
//!
//! # Safety
//!
//! CPU Lock is tracked per thread, but [`CpuLockToken`] is a process-wide
//! singleton for `TestTraits`. Tests running in parallel therefore hold
//! several tokens at the same time. This is sound only as long as no two test
//! threads access the same `CpuLockCell`, so every test must create its own
//! kernel objects instead of sharing them through `static` items.
//!
//! [`CpuLockToken`]: crate::klock::CpuLockToken
use std::{cell::Cell, thread};

use crate::{tick, PortScheduler, PortThreading};

pub(crate) struct TestTraits;

thread_local! {
    static CPU_LOCK: Cell<bool> = Cell::new(false);
    static IN_INTERRUPT: Cell<bool> = Cell::new(false);
}

unsafe impl PortThreading for TestTraits {
    unsafe fn try_enter_cpu_lock() -> bool {
        !CPU_LOCK.with(|x| x.replace(true))
    }

    unsafe fn leave_cpu_lock() {
        assert!(CPU_LOCK.with(|x| x.replace(false)));
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.with(Cell::get)
    }

    fn is_task_context() -> bool {
        !IN_INTERRUPT.with(Cell::get)
    }
}

unsafe impl PortScheduler for TestTraits {
    type TaskId = thread::ThreadId;

    fn current_task() -> Option<Self::TaskId> {
        Self::is_task_context().then(|| thread::current().id())
    }

    unsafe fn block_current_task(timeout: Option<tick::Duration>) {
        assert!(Self::is_cpu_lock_active());
        if timeout.is_none() {
            panic!("the test blocked without a timeout; nothing would wake it up");
        }
    }

    unsafe fn wake_task(task: Self::TaskId) {
        panic!("a task {task:?} was woken up, but no task can block in this port");
    }
}

/// Run `f` in a simulated interrupt context.
pub(crate) fn run_in_interrupt<R>(f: impl FnOnce() -> R) -> R {
    struct Guard(bool);
    impl Drop for Guard {
        fn drop(&mut self) {
            IN_INTERRUPT.with(|x| x.set(self.0));
        }
    }

    let _guard = Guard(IN_INTERRUPT.with(|x| x.replace(true)));
    f()
}

/// Run `f` with CPU Lock active.
pub(crate) fn with_cpu_lock<R>(f: impl FnOnce() -> R) -> R {
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            unsafe { TestTraits::leave_cpu_lock() };
        }
    }

    assert!(unsafe { TestTraits::try_enter_cpu_lock() });
    let _guard = Guard;
    f()
}

/// Install a logger for the current test.
pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
