//! Simulation environment for running `r3_timerq` on a hosted environment
//!
//! Every OS thread is a *task* unless it's designated as an interrupt
//! handler. CPU Lock is a global lock held by at most one thread at a time; a
//! thread that wants to enter CPU Lock while another thread holds it spins
//! until the lock is released, which is how a masked interrupt looks from the
//! point of view of the interrupt handler.
//!
//! Blocked tasks are parked threads. A timed block measures its timeout in
//! wall-clock time, converting ticks with [`TICK_PERIOD`].
//!
//! ```rust,ignore
//! r3_timerq_port_std::use_port!(unsafe struct SystemTraits);
//!
//! static POOL: [TimerCb<SystemTraits>; 4] = [TimerCb::INIT; 4];
//! static TIMERS: TimerSupervisor<SystemTraits> = TimerSupervisor::new(&POOL);
//!
//! let ticker = r3_timerq_port_std::Ticker::start(&TIMERS);
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
use r3_timerq::{tick, FatalTimerCallbackFault, PortThreading, TimerSupervisor};
use spin::Mutex as SpinMutex;
use std::{
    cell::Cell,
    fmt, ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate r3_timerq;

/// The length of a tick.
pub const TICK_PERIOD: Duration = Duration::from_millis(1);

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of `Port*`.
#[doc(hidden)]
pub struct State {
    /// The thread currently in the CPU Lock state.
    cpu_lock: SpinMutex<Option<thread::ThreadId>>,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    /// The backing thread for an interrupt context.
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. Threads are tasks until they're told
    /// otherwise by [`run_in_interrupt`].
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Task);

    /// The current thread's task record, created on first use.
    static CURRENT_TASK: TaskRef = TaskRef(Box::leak(Box::new(TaskRecord {
        thread: thread::current(),
        woken: AtomicBool::new(false),
    })));
}

/// The scheduler's view of a task.
struct TaskRecord {
    thread: thread::Thread,
    /// Set by `wake_task`, cleared when the task starts blocking.
    woken: AtomicBool,
}

/// Identifies a task, which is an OS thread.
///
/// A task record is allocated when a thread first acts as a task and is never
/// released.
#[derive(Clone, Copy)]
pub struct TaskRef(&'static TaskRecord);

impl TaskRef {
    /// Get the current thread's task record.
    fn current() -> Self {
        CURRENT_TASK.with(|t| *t)
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let thread = &self.0.thread;
        match thread.name() {
            Some(name) => write!(f, "TaskRef({name:?})"),
            None => write!(f, "TaskRef({:?})", thread.id()),
        }
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            cpu_lock: SpinMutex::new(None),
        }
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        let me = thread::current().id();
        loop {
            let mut owner = self.cpu_lock.lock();
            match *owner {
                None => {
                    *owner = Some(me);
                    log::trace!("enter_cpu_lock");
                    return true;
                }
                Some(thread_id) if thread_id == me => return false,
                // Another thread is in a critical section
                Some(_) => {}
            }
            drop(owner);
            thread::yield_now();
        }
    }

    pub unsafe fn leave_cpu_lock(&self) {
        log::trace!("leave_cpu_lock");
        let mut owner = self.cpu_lock.lock();
        assert_eq!(*owner, Some(thread::current().id()));
        *owner = None;
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        *self.cpu_lock.lock() == Some(thread::current().id())
    }

    pub fn is_task_context(&self) -> bool {
        THREAD_ROLE.with(|role| role.get() == ThreadRole::Task)
    }

    pub fn current_task(&self) -> Option<TaskRef> {
        self.is_task_context().then(TaskRef::current)
    }

    pub unsafe fn block_current_task(&self, timeout: Option<tick::Duration>) {
        assert!(self.is_task_context());
        assert!(self.is_cpu_lock_active());

        let task = TaskRef::current();
        // Nobody can call `wake_task` for us before we release CPU Lock, so
        // any earlier wake-up is stale
        task.0.woken.store(false, Ordering::Relaxed);

        // A deadline beyond the representable range is as good as none
        let deadline = timeout
            .and_then(|timeout| Instant::now().checked_add(timeout.to_time(TICK_PERIOD)));
        log::trace!("block_current_task({task:?}, {timeout:?})");

        unsafe { self.leave_cpu_lock() };

        while !task.0.woken.load(Ordering::Acquire) {
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    log::trace!("{task:?} reached the deadline");
                    break;
                }
                thread::park_timeout(deadline - now);
            } else {
                thread::park();
            }
        }

        let entered = unsafe { self.try_enter_cpu_lock() };
        assert!(entered);
        log::trace!("{task:?} resumed");
    }

    pub unsafe fn wake_task(&self, task: TaskRef) {
        assert!(self.is_cpu_lock_active());
        log::trace!("wake_task({task:?})");
        task.0.woken.store(true, Ordering::Release);
        task.0.thread.unpark();
    }

    /// Report a fault and abort the process.
    pub fn timer_callback_fault(&self, fault: FatalTimerCallbackFault) -> ! {
        log::error!("{fault}");
        eprintln!("{fault}; aborting");
        std::process::abort();
    }
}

/// Run `f` in an interrupt context on the current thread.
///
/// Blocking operations called by `f` fail with `BadContext`.
pub fn run_in_interrupt<R>(f: impl FnOnce() -> R) -> R {
    struct Guard(ThreadRole);

    impl Drop for Guard {
        fn drop(&mut self) {
            THREAD_ROLE.with(|role| role.set(self.0));
        }
    }

    let _guard = Guard(THREAD_ROLE.with(|role| role.replace(ThreadRole::Interrupt)));
    f()
}

/// Process one tick of `supervisor` in an interrupt context on the current
/// thread.
pub fn tick<Traits: PortThreading>(supervisor: &TimerSupervisor<Traits>) {
    run_in_interrupt(|| supervisor.tick_interrupt_handler());
}

/// A background thread that calls the tick handler of a [`TimerSupervisor`]
/// every [`TICK_PERIOD`].
///
/// The thread is stopped when the `Ticker` is dropped. A panic in the tick
/// thread is propagated to the thread that stops it.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    /// Start a tick thread for `supervisor`.
    pub fn start<Traits: PortThreading>(supervisor: &'static TimerSupervisor<Traits>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));

        log::trace!("starting the tick thread");
        let join_handle = thread::Builder::new()
            .name("tick".to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                move || {
                    THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt));

                    let mut next_tick = Instant::now();
                    while !stop.load(Ordering::Relaxed) {
                        next_tick += TICK_PERIOD;
                        if let Some(delay) = next_tick.checked_duration_since(Instant::now()) {
                            thread::sleep(delay);
                        }
                        supervisor.tick_interrupt_handler();
                    }
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn the tick thread: {e}"));

        Self {
            stop,
            join_handle: Some(join_handle),
        }
    }

    /// Stop the tick thread and wait for it to exit.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        log::trace!("stopping the tick thread");
        self.stop.store(true, Ordering::Relaxed);
        let result = join_handle.join();
        log::trace!("stopped the tick thread");

        // Propagate any panic that occured in the tick thread
        if let Err(e) = result {
            if !thread::panicking() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("running", &self.join_handle.is_some())
            .finish()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

/// Install a logger that obeys `RUST_LOG`. Does nothing if a logger is
/// already installed.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Define a system traits type that runs `r3_timerq` on this port.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::r3_timerq::{tick, FatalTimerCallbackFault, PortScheduler, PortThreading};
            use $crate::{State, TaskRef};

            static PORT_STATE: State = State::new();

            unsafe impl PortThreading for $SystemTraits {
                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context()
                }

                fn timer_callback_fault(fault: FatalTimerCallbackFault) -> ! {
                    PORT_STATE.timer_callback_fault(fault)
                }
            }

            unsafe impl PortScheduler for $SystemTraits {
                type TaskId = TaskRef;

                fn current_task() -> Option<TaskRef> {
                    PORT_STATE.current_task()
                }

                unsafe fn block_current_task(timeout: Option<tick::Duration>) {
                    unsafe { PORT_STATE.block_current_task(timeout) }
                }

                unsafe fn wake_task(task: TaskRef) {
                    unsafe { PORT_STATE.wake_task(task) }
                }
            }
        }
    };
}
