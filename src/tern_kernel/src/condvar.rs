//! Condition variables
//!
//! `wait` atomically releases the associated mutex and joins the condition
//! variable's wait list; both halves happen under the same critical section,
//! so a notification can never slip between them. The mutex is reacquired
//! (blocking if necessary) before `wait` returns, including when the wait
//! timed out.
use core::fmt;

use crate::{
    error::{
        LockMutexError, NotifyConditionVariableError, UnlockMutexError,
        WaitConditionVariableError, WaitConditionVariableTimeoutError, WaitError,
        WaitTimeoutError,
    },
    klock, mutex, state, thread,
    thread::{list::ThreadList, ThreadSt},
    time::{TickDuration, TickInstant},
    timeout,
    wait::{self, WaitPayload},
    KernelTraits, Port,
};

/// *Condition variable control block* - the state data of a condition
/// variable.
pub struct ConditionVariableCb<Traits: Port> {
    pub(super) wait_queue: ThreadList<Traits>,
}

impl<Traits: Port> ConditionVariableCb<Traits> {
    pub const fn new() -> Self {
        Self {
            wait_queue: ThreadList::new(ThreadSt::BlockedOnConditionVariable),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ConditionVariableCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConditionVariableCb")
            .field("self", &(self as *const _))
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> ConditionVariableCb<Traits> {
    /// Release `mutex_cb` and block until notified, then reacquire
    /// `mutex_cb`.
    ///
    /// The calling thread must own `mutex_cb`; otherwise the call fails with
    /// `InvalidArgument`.
    pub fn wait(
        &'static self,
        mutex_cb: &'static mutex::MutexCb<Traits>,
    ) -> Result<(), WaitConditionVariableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        release_mutex::<Traits, WaitConditionVariableError>(lock.borrow_mut(), mutex_cb)?;

        let wait_result = wait::wait_in_list(
            lock.borrow_mut(),
            &self.wait_queue,
            WaitPayload::ConditionVariable,
        );

        // Reacquire the mutex before reporting the outcome
        let relock_result = mutex::lock_mutex(mutex_cb, lock);

        match wait_result {
            Ok(()) => {}
            Err(WaitError::Interrupted) => {
                unreachable!("condition variable waits are not interruptible")
            }
        }

        map_relock_result(relock_result)
    }

    /// As [`wait`](Self::wait), but give up waiting for a notification with
    /// `Timeout` after the specified duration. The mutex is reacquired even
    /// when the wait times out.
    pub fn wait_for(
        &'static self,
        mutex_cb: &'static mutex::MutexCb<Traits>,
        duration: TickDuration,
    ) -> Result<(), WaitConditionVariableTimeoutError> {
        self.wait_timeout_inner(mutex_cb, timeout::Expiry::After(duration.as_ticks()))
    }

    /// As [`wait`](Self::wait), but give up waiting for a notification with
    /// `Timeout` at the specified time point.
    pub fn wait_until(
        &'static self,
        mutex_cb: &'static mutex::MutexCb<Traits>,
        time_point: TickInstant,
    ) -> Result<(), WaitConditionVariableTimeoutError> {
        self.wait_timeout_inner(mutex_cb, timeout::Expiry::At(time_point.as_ticks()))
    }

    fn wait_timeout_inner(
        &'static self,
        mutex_cb: &'static mutex::MutexCb<Traits>,
        expiry: timeout::Expiry,
    ) -> Result<(), WaitConditionVariableTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        release_mutex::<Traits, WaitConditionVariableTimeoutError>(lock.borrow_mut(), mutex_cb)?;

        let wait_result = wait::wait_in_list_timeout(
            lock.borrow_mut(),
            &self.wait_queue,
            WaitPayload::ConditionVariable,
            expiry,
        );

        // Reacquire the mutex before reporting the outcome
        let relock_result = mutex::lock_mutex(mutex_cb, lock);

        match wait_result {
            Ok(()) => {}
            Err(WaitTimeoutError::Timeout) => {
                map_relock_result::<WaitConditionVariableTimeoutError>(relock_result)?;
                return Err(WaitConditionVariableTimeoutError::Timeout);
            }
            Err(WaitTimeoutError::Interrupted) => {
                unreachable!("condition variable waits are not interruptible")
            }
        }

        map_relock_result(relock_result)
    }

    /// Wake up the highest-priority thread waiting on the condition variable,
    /// if any.
    pub fn notify_one(&'static self) -> Result<(), NotifyConditionVariableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if let Some(waiter) = self.wait_queue.first(lock.borrow_mut()) {
            wait::complete_wait(lock.borrow_mut(), waiter, Ok(()));
            thread::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Wake up all threads waiting on the condition variable.
    pub fn notify_all(&'static self) -> Result<(), NotifyConditionVariableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let mut woken_any = false;
        while let Some(waiter) = self.wait_queue.first(lock.borrow_mut()) {
            wait::complete_wait(lock.borrow_mut(), waiter, Ok(()));
            woken_any = true;
        }

        if woken_any {
            thread::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }
}

/// Release the mutex on behalf of a condition-variable wait, mapping the
/// error into "the calling thread does not own the mutex".
fn release_mutex<Traits: KernelTraits, E: InvalidArgumentError>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static mutex::MutexCb<Traits>,
) -> Result<(), E> {
    match mutex::unlock_mutex_inner(lock, mutex_cb) {
        Ok(()) => Ok(()),
        Err(UnlockMutexError::OwnerDead | UnlockMutexError::InvalidArgument) => {
            Err(E::invalid_argument())
        }
        Err(UnlockMutexError::BadContext) => unreachable!(),
    }
}

/// Map the result of the mutex reacquisition. The relock cannot actually
/// fail: the waiter owned the mutex before the wait, so the locking-protocol
/// preconditions are known to hold.
fn map_relock_result<E: InvalidArgumentError>(
    result: Result<(), LockMutexError>,
) -> Result<(), E> {
    match result {
        Ok(()) => Ok(()),
        Err(LockMutexError::Deadlock | LockMutexError::InvalidArgument) => {
            Err(E::invalid_argument())
        }
        Err(LockMutexError::BadContext) => unreachable!(),
    }
}

/// Internal helper for constructing the `InvalidArgument` variant of the
/// condition-variable error types.
trait InvalidArgumentError {
    fn invalid_argument() -> Self;
}

impl InvalidArgumentError for WaitConditionVariableError {
    fn invalid_argument() -> Self {
        Self::InvalidArgument
    }
}

impl InvalidArgumentError for WaitConditionVariableTimeoutError {
    fn invalid_argument() -> Self {
        Self::InvalidArgument
    }
}
