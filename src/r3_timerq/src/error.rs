//! Error types
//!
//! Every fallible operation has its own error type listing exactly the
//! conditions it can report. All of them share their discriminants with
//! [`ResultCode`], so converting to it is free.
use core::{fmt, mem::transmute};

use crate::timer::TimerId;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use r3_timerq::ResultCode;
            /// assert_eq!(ResultCode::QueueFull.as_str(), "QueueFull");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that the operations of this crate
    /// can produce.
    ///
    /// The values are matched to their closest equivalents in μITRON4.0 where
    /// one exists.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is malformed, e.g., a zero element size or capacity, a
        /// storage region too small for the requested geometry, or an element
        /// buffer whose length doesn't match the queue's element size.
        InvalidArgument = -17,
        /// The current context disallows the operation. CPU Lock is already
        /// active, or a blocking operation was attempted from a non-task
        /// context.
        BadContext = -25,
        /// Memory couldn't be obtained for a new object, or no free control
        /// block is left in a fixed pool.
        AllocationFailure = -33,
        /// The queue has no free slot.
        QueueFull = -43,
        /// The operation timed out.
        Timeout = -50,
        /// The queue holds no element.
        QueueEmpty = -51,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    ///
    /// Success codes have non-negative values.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod new_queue_error {}
    /// Error type for [`RawFifoQueue::new`].
    ///
    /// [`RawFifoQueue::new`]: crate::fifo::RawFifoQueue::new
    pub enum NewQueueError {
        /// The element size or the capacity is zero, or the supplied storage
        /// is smaller than `element_size * capacity` bytes.
        InvalidArgument,
    }
}

define_error! {
    mod new_dynamic_queue_error {}
    /// Error type for [`RawFifoQueue::new_dynamic`].
    ///
    /// [`RawFifoQueue::new_dynamic`]: crate::fifo::RawFifoQueue::new_dynamic
    pub enum NewDynamicQueueError {
        /// The element size or the capacity is zero.
        InvalidArgument,
        /// The storage couldn't be allocated.
        AllocationFailure,
    }
}

define_error! {
    mod try_push_error {}
    /// Error type for [`RawFifoQueue::try_push`].
    ///
    /// [`RawFifoQueue::try_push`]: crate::fifo::RawFifoQueue::try_push
    pub enum TryPushError {
        /// CPU Lock is active.
        BadContext,
        /// The element's length is not the queue's element size.
        InvalidArgument,
        /// The queue is full.
        QueueFull,
    }
}

define_error! {
    mod push_error {}
    /// Error type for [`RawFifoQueue::push`].
    ///
    /// [`RawFifoQueue::push`]: crate::fifo::RawFifoQueue::push
    pub enum PushError {
        /// CPU Lock is active, or the queue is full and the current context
        /// is not waitable.
        BadContext,
        /// The element's length is not the queue's element size.
        InvalidArgument,
    }
}

define_error! {
    mod push_timeout_error {}
    /// Error type for [`RawFifoQueue::push_timeout`].
    ///
    /// [`RawFifoQueue::push_timeout`]: crate::fifo::RawFifoQueue::push_timeout
    pub enum PushTimeoutError {
        /// CPU Lock is active, or the queue is full and the current context
        /// is not waitable.
        BadContext,
        /// The element's length is not the queue's element size.
        InvalidArgument,
        /// No slot became free before the timeout elapsed.
        Timeout,
    }
}

define_error! {
    mod try_pop_error {}
    /// Error type for [`RawFifoQueue::try_pop`].
    ///
    /// [`RawFifoQueue::try_pop`]: crate::fifo::RawFifoQueue::try_pop
    pub enum TryPopError {
        /// CPU Lock is active.
        BadContext,
        /// The buffer's length is not the queue's element size.
        InvalidArgument,
        /// The queue is empty.
        QueueEmpty,
    }
}

define_error! {
    mod pop_error {}
    /// Error type for [`RawFifoQueue::pop`].
    ///
    /// [`RawFifoQueue::pop`]: crate::fifo::RawFifoQueue::pop
    pub enum PopError {
        /// CPU Lock is active, or the queue is empty and the current context
        /// is not waitable.
        BadContext,
        /// The buffer's length is not the queue's element size.
        InvalidArgument,
    }
}

define_error! {
    mod pop_timeout_error {}
    /// Error type for [`RawFifoQueue::pop_timeout`].
    ///
    /// [`RawFifoQueue::pop_timeout`]: crate::fifo::RawFifoQueue::pop_timeout
    pub enum PopTimeoutError {
        /// CPU Lock is active, or the queue is empty and the current context
        /// is not waitable.
        BadContext,
        /// The buffer's length is not the queue's element size.
        InvalidArgument,
        /// No element arrived before the timeout elapsed.
        Timeout,
    }
}

define_error! {
    mod query_queue_error {}
    /// Error type for [`RawFifoQueue::len`] and other queue observers.
    ///
    /// [`RawFifoQueue::len`]: crate::fifo::RawFifoQueue::len
    pub enum QueryQueueError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod create_timer_error {}
    /// Error type for [`TimerSupervisor::create_timer`].
    ///
    /// [`TimerSupervisor::create_timer`]: crate::supervisor::TimerSupervisor::create_timer
    pub enum CreateTimerError {
        /// CPU Lock is active.
        BadContext,
        /// Every control block in the pool is owned by a timer.
        AllocationFailure,
    }
}

define_error! {
    mod start_timer_error {}
    /// Error type for [`TimerRef::start_after`] and [`TimerRef::start_at`].
    ///
    /// [`TimerRef::start_after`]: crate::timer::TimerRef::start_after
    /// [`TimerRef::start_at`]: crate::timer::TimerRef::start_at
    pub enum StartTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod stop_timer_error {}
    /// Error type for [`TimerRef::stop`].
    ///
    /// [`TimerRef::stop`]: crate::timer::TimerRef::stop
    pub enum StopTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

define_error! {
    mod query_timer_error {}
    /// Error type for [`TimerRef::is_running`] and other timer observers.
    ///
    /// [`TimerRef::is_running`]: crate::timer::TimerRef::is_running
    pub enum QueryTimerError {
        /// CPU Lock is active.
        BadContext,
    }
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as _ ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        define_suberror! {
            @into
            #[into(ResultCode)]
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// `BadContext`
    #[into(TryPushError)]
    #[into(PushError)]
    #[into(PushTimeoutError)]
    #[into(TryPopError)]
    #[into(PopError)]
    #[into(PopTimeoutError)]
    #[into(QueryQueueError)]
    #[into(CreateTimerError)]
    #[into(StartTimerError)]
    #[into(StopTimerError)]
    #[into(QueryTimerError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `InvalidArgument`
    #[into(NewQueueError)]
    #[into(NewDynamicQueueError)]
    #[into(TryPushError)]
    #[into(PushError)]
    #[into(PushTimeoutError)]
    #[into(TryPopError)]
    #[into(PopError)]
    #[into(PopTimeoutError)]
    pub(crate) enum InvalidArgumentError {
        InvalidArgument,
    }
}

define_suberror! {
    /// `Timeout`
    #[into(PushTimeoutError)]
    #[into(PopTimeoutError)]
    pub(crate) enum TimeoutError {
        Timeout,
    }
}

/// Describes a timer callback that did not return normally.
///
/// Timer callbacks run in interrupt context, where no caller exists to
/// receive an error. This value is therefore never returned. The tick
/// handler hands it to [`PortThreading::timer_callback_fault`], which must
/// not return.
///
/// [`PortThreading::timer_callback_fault`]: crate::PortThreading::timer_callback_fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalTimerCallbackFault {
    /// The timer whose callback faulted.
    pub timer: TimerId,
}

impl fmt::Display for FatalTimerCallbackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback of timer {:?} did not return", self.timer)
    }
}
