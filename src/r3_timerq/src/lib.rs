//! Software timers and blocking FIFO queues for the R3 kernel family.
//!
//! This crate provides the two places where interrupt handlers and tasks
//! mutate the same data structures:
//!
//!  - [`TimerSupervisor`] owns an expiration-ordered list of one-shot
//!    [software timers](SoftwareTimer). Its [tick handler] is called from the
//!    periodic tick interrupt and runs every timer whose expiration has
//!    arrived.
//!
//!  - [`RawFifoQueue`] (and its typed counterpart [`FifoQueue`]) is a
//!    fixed-capacity circular buffer of fixed-size elements. Tasks block in
//!    [`push`] and [`pop`] until space or data becomes available, and are
//!    woken in the order in which they blocked.
//!
//! The crate doesn't include a scheduler. Everything it needs from one is
//! expressed as the [port traits](PortThreading), which a kernel or a
//! simulation environment (such as `r3_timerq_port_std`) implements on a
//! *system traits type*.
//!
//! [tick handler]: TimerSupervisor::tick_interrupt_handler
//! [`push`]: RawFifoQueue::push
//! [`pop`]: RawFifoQueue::pop
//!
//! # Contexts
//!
//! A *context* is a general term that is used to refer to an execution
//! environment. This crate distinguishes two of them:
//!
//!  - A **task context** is the context of a task. This is the only context
//!    in which an operation can block ([`PortThreading::is_task_context`]).
//!
//!  - An **interrupt context** is the context of an interrupt handler. The
//!    tick handler and timer callbacks run in this context. Non-blocking
//!    queue operations ([`try_push`], [`try_pop`]) and all timer operations
//!    are allowed here.
//!
//! [`try_push`]: RawFifoQueue::try_push
//! [`try_pop`]: RawFifoQueue::try_pop
//!
//! # CPU Lock
//!
//! Shared state is protected by *CPU Lock*, a critical section in which
//! interrupts are masked. Every operation acquires CPU Lock for as short a
//! period as possible and releases it on all exit paths. Calling an operation
//! while CPU Lock is already active in the current context is rejected with
//! `BadContext`; the only exception is the tick handler, which has no caller
//! to report to and panics instead.
//!
//! Internally, every piece of shared state lives in a cell that can only be
//! accessed by presenting the token obtained by entering CPU Lock, so the
//! compiler checks that no state is touched outside a critical section.
//!
//! # Time
//!
//! All times are expressed in *ticks*, the period of the tick interrupt.
//! [`tick::Instant`] is an absolute tick count and [`tick::Duration`] is a
//! tick count relative to the current one. Use [`tick::Duration::from_time`]
//! to convert from `core::time::Duration`.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod error;
pub mod fifo;
mod klock;
mod state;
pub mod supervisor;
pub mod tick;
pub mod timer;
pub mod utils;
mod wait;

#[cfg(test)]
mod test_port;

pub use self::{
    error::*,
    fifo::{FifoQueue, RawFifoQueue},
    supervisor::TimerSupervisor,
    tick::TickClock,
    timer::{SoftwareTimer, TimerCb, TimerId, TimerRef},
};

#[cfg(feature = "alloc")]
pub use self::fifo::{DynamicFifoQueue, DynamicRawFifoQueue};

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// masking interrupts on the target. The CPU Lock state must be tracked per
/// context: `try_enter_cpu_lock` must fail if and only if CPU Lock is
/// already active in the calling context, and no two contexts may be in the
/// CPU Lock state at the same time.
///
/// These methods are only meant to be called by this crate.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Attempt to enter a CPU Lock state. Returns `false` (and does nothing)
    /// if CPU Lock is already active in the current context.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is
    /// [a task context].
    ///
    /// [a task context]: crate#contexts
    fn is_task_context() -> bool;

    /// Called by [`TimerSupervisor::tick_interrupt_handler`] when a timer
    /// callback unwinds instead of returning normally.
    ///
    /// There's no safe continuation at this point, so this method must not
    /// return. The default implementation panics, which halts the system on a
    /// `panic = "abort"` target.
    ///
    /// CPU Lock is inactive when this method is called.
    fn timer_callback_fault(fault: FatalTimerCallbackFault) -> ! {
        panic!("fatal timer callback fault: {fault}");
    }
}

/// Implemented by a port. This trait contains the two scheduler operations
/// that blocking queue operations are built on.
///
/// The wait lists themselves are maintained by this crate. The scheduler only
/// needs to suspend the current task and to resume a given task.
///
/// # Safety
///
/// `block_current_task` must not return before `wake_task` was called for the
/// current task or (for a timed block) the timeout has elapsed, except that a
/// spurious return from an untimed block is tolerated.
///
/// These methods are only meant to be called by this crate.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortScheduler: PortThreading {
    /// Identifies a task.
    type TaskId: Copy + Eq + core::fmt::Debug + Send + Sync + 'static;

    /// Get the currently running task. Returns `None` if the current context
    /// is not a task context.
    fn current_task() -> Option<Self::TaskId>;

    /// Suspend the current task until [`wake_task`] is called for it or
    /// `timeout` elapses (if specified).
    ///
    /// CPU Lock is released while the task is suspended and re-acquired
    /// before returning.
    ///
    /// Precondition: CPU Lock active, task context
    ///
    /// [`wake_task`]: Self::wake_task
    unsafe fn block_current_task(timeout: Option<tick::Duration>);

    /// Resume a task suspended by [`block_current_task`]. If the task hasn't
    /// suspended yet, its next call to `block_current_task` returns
    /// immediately.
    ///
    /// Precondition: CPU Lock active
    ///
    /// [`block_current_task`]: Self::block_current_task
    unsafe fn wake_task(task: Self::TaskId);
}
