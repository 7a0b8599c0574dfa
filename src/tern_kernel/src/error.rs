//! Error types returned by kernel operations
//!
//! Every fallible operation returns a dedicated error enum whose variants are
//! drawn from [`ResultCode`]. The enums are `#[repr(i8)]` with discriminants
//! matching `ResultCode`, so converting an error to its raw code is free.
use core::fmt;

/// Raw result codes distinguished by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ResultCode {
    /// The operation completed successfully.
    Success = 0,
    /// The operation is not allowed in the current context (e.g., a blocking
    /// operation in an interrupt context, or CPU Lock already being active).
    BadContext = -1,
    /// The object is not in a state that allows the operation (e.g., starting
    /// a thread that is already running).
    BadObjectState = -2,
    /// A non-blocking acquisition failed because the resource is held.
    Busy = -3,
    /// A timed wait elapsed before the operation could complete.
    Timeout = -4,
    /// A blocking operation was terminated by signal delivery.
    Interrupted = -5,
    /// The supplied buffer size does not match the queue's element size.
    MessageSize = -6,
    /// A parameter has an invalid value (e.g., a signal number out of range or
    /// a priority above a mutex's ceiling).
    InvalidArgument = -7,
    /// Nothing is pending; retry later.
    Again = -8,
    /// No resources are available to complete the operation.
    AgainNoResources = -9,
    /// The operation requires a facility the object was constructed without.
    NotSupported = -10,
    /// A deadlock condition was detected.
    Deadlock = -11,
    /// The mutex has no owner.
    OwnerDead = -12,
    /// A bounded semaphore would be incremented past its maximum.
    Overflow = -13,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
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

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

/// Generate `From` impls lifting a single-variant suberror into the error
/// enums that contain the corresponding variant.
macro_rules! lift_suberror {
    ( $Sub:ty => $Variant:ident : $( $Name:ty ),* $(,)? ) => {
        $(
            impl From<$Sub> for $Name {
                #[inline]
                fn from(_: $Sub) -> Self {
                    Self::$Variant
                }
            }
        )*
    };
}

define_error! {
    /// `BadContext`
    pub(super) enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// `BadObjectState`
    pub(super) enum BadObjectStateError {
        BadObjectState,
    }
}

define_error! {
    /// The outcome of a wait operation, recorded in the waiting thread's
    /// control block by the waker.
    pub enum WaitTimeoutError {
        Interrupted,
        Timeout,
    }
}

define_error! {
    /// The outcome of an untimed wait operation.
    pub enum WaitError {
        Interrupted,
    }
}

define_error! {
    /// Error type for [`SemaphoreCb::try_wait`](crate::SemaphoreCb::try_wait).
    pub enum PollSemaphoreError {
        BadContext,
        Busy,
    }
}

define_error! {
    /// Error type for [`SemaphoreCb::wait`](crate::SemaphoreCb::wait).
    pub enum WaitSemaphoreError {
        BadContext,
        Interrupted,
    }
}

define_error! {
    /// Error type for the timed semaphore wait operations.
    pub enum WaitSemaphoreTimeoutError {
        BadContext,
        Interrupted,
        Timeout,
    }
}

define_error! {
    /// Error type for [`SemaphoreCb::post`](crate::SemaphoreCb::post).
    pub enum PostSemaphoreError {
        BadContext,
        Overflow,
    }
}

define_error! {
    /// Error type for [`MutexCb::lock`](crate::MutexCb::lock).
    pub enum LockMutexError {
        BadContext,
        Deadlock,
        InvalidArgument,
    }
}

define_error! {
    /// Error type for [`MutexCb::try_lock`](crate::MutexCb::try_lock).
    pub enum TryLockMutexError {
        BadContext,
        Busy,
        Deadlock,
        InvalidArgument,
    }
}

define_error! {
    /// Error type for the timed mutex lock operations.
    pub enum LockMutexTimeoutError {
        BadContext,
        Deadlock,
        InvalidArgument,
        Timeout,
    }
}

define_error! {
    /// Error type for [`MutexCb::unlock`](crate::MutexCb::unlock).
    pub enum UnlockMutexError {
        BadContext,
        InvalidArgument,
        OwnerDead,
    }
}

define_error! {
    /// Error type for
    /// [`ConditionVariableCb::wait`](crate::ConditionVariableCb::wait).
    pub enum WaitConditionVariableError {
        BadContext,
        InvalidArgument,
    }
}

define_error! {
    /// Error type for the timed condition variable wait operations.
    pub enum WaitConditionVariableTimeoutError {
        BadContext,
        InvalidArgument,
        Timeout,
    }
}

define_error! {
    /// Error type for the condition variable notification operations.
    pub enum NotifyConditionVariableError {
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking queue operations.
    pub enum QueueError {
        BadContext,
        MessageSize,
    }
}

define_error! {
    /// Error type for the non-blocking queue operations.
    pub enum TryQueueError {
        BadContext,
        Busy,
        MessageSize,
    }
}

define_error! {
    /// Error type for the timed queue operations.
    pub enum QueueTimeoutError {
        BadContext,
        MessageSize,
        Timeout,
    }
}

define_error! {
    /// Error type for [`generate_signal`](crate::generate_signal).
    pub enum GenerateSignalError {
        BadContext,
        InvalidArgument,
        NotSupported,
    }
}

define_error! {
    /// Error type for [`queue_signal`](crate::queue_signal).
    pub enum QueueSignalError {
        BadContext,
        InvalidArgument,
        AgainNoResources,
        NotSupported,
    }
}

define_error! {
    /// Error type for the non-blocking signal acceptance operations.
    pub enum PollSignalsError {
        BadContext,
        InvalidArgument,
        Again,
        NotSupported,
    }
}

define_error! {
    /// Error type for [`wait_signals`](crate::wait_signals).
    pub enum WaitSignalsError {
        BadContext,
        InvalidArgument,
        NotSupported,
    }
}

define_error! {
    /// Error type for the timed signal wait operations.
    pub enum WaitSignalsTimeoutError {
        BadContext,
        InvalidArgument,
        NotSupported,
        Timeout,
    }
}

define_error! {
    /// Error type for the signal mask accessors.
    pub enum SignalMaskError {
        BadContext,
        NotSupported,
    }
}

define_error! {
    /// Error type for the signal action accessors.
    pub enum SignalActionError {
        BadContext,
        InvalidArgument,
        AgainNoResources,
        NotSupported,
    }
}

define_error! {
    /// Error type for [`ThreadCb::start`](crate::ThreadCb::start).
    pub enum StartThreadError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`ThreadCb::join`](crate::ThreadCb::join).
    pub enum JoinThreadError {
        BadContext,
        Deadlock,
        BadObjectState,
    }
}

define_error! {
    /// Error type for the thread priority accessors.
    pub enum GetThreadPriorityError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for
    /// [`ThreadCb::set_priority`](crate::ThreadCb::set_priority).
    pub enum SetThreadPriorityError {
        BadContext,
        InvalidArgument,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`sleep_for`](crate::sleep_for) and
    /// [`sleep_until`](crate::sleep_until).
    pub enum SleepError {
        BadContext,
    }
}

define_error! {
    /// Some of the error codes shared by [`TryLockMutexError`],
    /// [`LockMutexError`], and [`LockMutexTimeoutError`]. Used internally
    /// by the mutex implementation.
    pub(super) enum LockMutexPrecheckError {
        Deadlock,
        InvalidArgument,
    }
}

lift_suberror! {
    BadContextError => BadContext :
        PollSemaphoreError,
        WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
        PostSemaphoreError,
        LockMutexError,
        TryLockMutexError,
        LockMutexTimeoutError,
        UnlockMutexError,
        WaitConditionVariableError,
        WaitConditionVariableTimeoutError,
        NotifyConditionVariableError,
        QueueError,
        TryQueueError,
        QueueTimeoutError,
        GenerateSignalError,
        QueueSignalError,
        PollSignalsError,
        WaitSignalsError,
        WaitSignalsTimeoutError,
        SignalMaskError,
        SignalActionError,
        StartThreadError,
        JoinThreadError,
        GetThreadPriorityError,
        SetThreadPriorityError,
        SleepError,
}

lift_suberror! {
    BadObjectStateError => BadObjectState :
        StartThreadError,
        JoinThreadError,
        GetThreadPriorityError,
        SetThreadPriorityError,
}

macro_rules! lift_precheck_error {
    ( $( $Name:ty ),* $(,)? ) => {
        $(
            impl From<LockMutexPrecheckError> for $Name {
                #[inline]
                fn from(x: LockMutexPrecheckError) -> Self {
                    match x {
                        LockMutexPrecheckError::Deadlock => Self::Deadlock,
                        LockMutexPrecheckError::InvalidArgument => Self::InvalidArgument,
                    }
                }
            }
        )*
    };
}

lift_precheck_error! {
    LockMutexError,
    TryLockMutexError,
    LockMutexTimeoutError,
}

impl From<WaitError> for WaitSemaphoreError {
    #[inline]
    fn from(_: WaitError) -> Self {
        Self::Interrupted
    }
}

impl From<WaitTimeoutError> for WaitSemaphoreTimeoutError {
    #[inline]
    fn from(x: WaitTimeoutError) -> Self {
        match x {
            WaitTimeoutError::Interrupted => Self::Interrupted,
            WaitTimeoutError::Timeout => Self::Timeout,
        }
    }
}

/// Convert `self` to `WaitError`, panicking if `self == Self::Timeout`.
#[inline]
pub(super) fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::Timeout => {
            unreachable!("got timeout result for a non-timeout wait")
        }
    }
}
