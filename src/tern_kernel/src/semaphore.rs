//! Semaphores
//!
//! The counting semaphore is the kernel's universal blocking primitive. The
//! value is a signed count: a negative value means the semaphore is depleted
//! and `-value` threads are blocked in its wait list. A waiter decrements the
//! value on entry; a poster increments it and, if the pre-increment value was
//! negative, hands the new permit to the highest-priority waiter.
//!
//! When a timed wait is cancelled, the cancelling side restores the value the
//! waiter subtracted, so a timed-out wait leaves no side effect.
use core::fmt;

use crate::{
    error::{
        PollSemaphoreError, PostSemaphoreError, ResultCode, WaitSemaphoreError,
        WaitSemaphoreTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    state, thread,
    thread::{list::ThreadList, ThreadSt},
    time::{TickDuration, TickInstant},
    timeout,
    wait::{self, WaitPayload},
    KernelTraits, Port,
};

/// The value type of semaphores.
///
/// Negative values are an implementation detail observable through
/// [`SemaphoreCb::get_value`]: when the value is negative, its magnitude is
/// the number of blocked waiters.
pub type SemaphoreValue = i32;

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: Port> {
    pub(super) value: CpuLockCell<Traits, SemaphoreValue>,
    pub(super) max_value: SemaphoreValue,

    pub(super) wait_queue: ThreadList<Traits>,
}

impl<Traits: Port> SemaphoreCb<Traits> {
    /// Construct a `SemaphoreCb` with the specified initial value and no
    /// practical upper bound.
    pub const fn new(initial_value: SemaphoreValue) -> Self {
        Self::with_max(initial_value, SemaphoreValue::MAX)
    }

    /// Construct a bounded `SemaphoreCb`. [`post`](Self::post) fails with
    /// `Overflow` when the value would exceed `max_value`.
    pub const fn with_max(initial_value: SemaphoreValue, max_value: SemaphoreValue) -> Self {
        assert!(initial_value >= 0, "initial value must be non-negative");
        assert!(initial_value <= max_value, "initial value above maximum");
        Self {
            value: CpuLockCell::new(initial_value),
            max_value,
            wait_queue: ThreadList::new(ThreadSt::BlockedOnSemaphore),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("max_value", &self.max_value)
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Increment the semaphore value, waking up the highest-priority waiter
    /// if there is one.
    ///
    /// This operation never blocks and is safe to call from an interrupt
    /// context; a context switch made necessary by the wakeup is deferred to
    /// the interrupt epilogue by the port.
    pub fn post(&'static self) -> Result<(), PostSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let value = self.value.get(&*lock);
        if value >= self.max_value {
            return Err(PostSemaphoreError::Overflow);
        }
        self.value.replace(&mut *lock, value + 1);

        if value < 0 {
            // The pre-increment value was negative, so there's at least one
            // waiter. Hand the new permit to the first one.
            let waiter = self.wait_queue.first(lock.borrow_mut()).unwrap();
            wait::complete_wait(lock.borrow_mut(), waiter, Ok(()));

            // The woken thread may preempt the current one
            thread::unlock_cpu_and_check_preemption(lock);
        }

        Ok(())
    }

    /// Decrement the semaphore value, blocking until a permit is available.
    pub fn wait(&'static self) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if !poll_core(self.value.write(&mut *lock)) {
            wait::wait_in_list(
                lock.borrow_mut(),
                &self.wait_queue,
                WaitPayload::Semaphore(self),
            )?;
        }

        Ok(())
    }

    /// Decrement the semaphore value if it is positive; fail with `Busy`
    /// otherwise.
    pub fn try_wait(&'static self) -> Result<(), PollSemaphoreError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if self.value.get(&*lock) > 0 {
            let value = self.value.write(&mut *lock);
            *value -= 1;
            Ok(())
        } else {
            Err(PollSemaphoreError::Busy)
        }
    }

    /// As [`wait`](Self::wait), but give up with `Timeout` after the
    /// specified duration. The semaphore value is restored when the wait
    /// times out.
    pub fn try_wait_for(
        &'static self,
        duration: TickDuration,
    ) -> Result<(), WaitSemaphoreTimeoutError> {
        self.wait_timeout_inner(timeout::Expiry::After(duration.as_ticks()))
    }

    /// As [`wait`](Self::wait), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_wait_until(
        &'static self,
        time_point: TickInstant,
    ) -> Result<(), WaitSemaphoreTimeoutError> {
        self.wait_timeout_inner(timeout::Expiry::At(time_point.as_ticks()))
    }

    fn wait_timeout_inner(
        &'static self,
        expiry: timeout::Expiry,
    ) -> Result<(), WaitSemaphoreTimeoutError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        if !poll_core(self.value.write(&mut *lock)) {
            wait::wait_in_list_timeout(
                lock.borrow_mut(),
                &self.wait_queue,
                WaitPayload::Semaphore(self),
                expiry,
            )?;
        }

        Ok(())
    }

    /// Read the semaphore value.
    pub fn get_value(&'static self) -> Result<SemaphoreValue, ResultCode> {
        let lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
        Ok(self.value.get(&*lock))
    }
}

/// A selector for the semaphore wait flavors, used by composite primitives
/// (queues) that are parameterized over how they acquire their semaphores.
/// Modeled as a plain enum dispatched in [`SemaphoreCb::wait_by`] to keep
/// indirect calls out of the critical path.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SemaphoreWait {
    Wait,
    TryWait,
    TryWaitFor(TickDuration),
    TryWaitUntil(TickInstant),
}

impl<Traits: KernelTraits> SemaphoreCb<Traits> {
    /// Perform the wait flavor selected by `wait_kind`, flattening the error
    /// into a [`ResultCode`].
    pub(crate) fn wait_by(&'static self, wait_kind: SemaphoreWait) -> Result<(), ResultCode> {
        match wait_kind {
            SemaphoreWait::Wait => self.wait().map_err(ResultCode::from),
            SemaphoreWait::TryWait => self.try_wait().map_err(ResultCode::from),
            SemaphoreWait::TryWaitFor(duration) => {
                self.try_wait_for(duration).map_err(ResultCode::from)
            }
            SemaphoreWait::TryWaitUntil(time_point) => {
                self.try_wait_until(time_point).map_err(ResultCode::from)
            }
        }
    }
}

/// Decrement `value` on behalf of a wait operation. Returns `true` iff the
/// caller acquired a permit without needing to block.
#[inline]
fn poll_core(value: &mut SemaphoreValue) -> bool {
    *value -= 1;
    *value >= 0
}

/// Give back the permit a cancelled waiter subtracted from the semaphore.
/// Called by the wait machinery when a timed wait expires.
pub(crate) fn restore_value<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    semaphore_cb: &SemaphoreCb<Traits>,
) {
    let value = semaphore_cb.value.write(&mut *lock);
    debug_assert!(*value < 0);
    *value += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, thread::SchedulingPolicy, wait};

    /// Put an inert thread into `semaphore_cb`'s wait list, performing the
    /// same state changes its own `wait` call would.
    fn block_thread_on_semaphore<Traits: KernelTraits>(
        semaphore_cb: &'static SemaphoreCb<Traits>,
        thread: &'static crate::ThreadCb<Traits>,
    ) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        {
            let value = semaphore_cb.value.write(&mut *lock);
            *value -= 1;
            assert!(*value < 0);
        }
        wait::start_wait_for_test(
            lock.borrow_mut(),
            thread,
            Some(&semaphore_cb.wait_queue),
            ThreadSt::BlockedOnSemaphore,
            WaitPayload::Semaphore(semaphore_cb),
        );
    }

    #[test]
    fn post_and_try_wait() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(1);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        assert_eq!(SEMAPHORE.get_value(), Ok(1));
        SEMAPHORE.try_wait().unwrap();
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
        assert_eq!(SEMAPHORE.try_wait(), Err(PollSemaphoreError::Busy));

        SEMAPHORE.post().unwrap();
        SEMAPHORE.post().unwrap();
        assert_eq!(SEMAPHORE.get_value(), Ok(2));
    }

    #[test]
    fn bounded_post_overflows() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::with_max(1, 2);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        SEMAPHORE.post().unwrap();
        assert_eq!(SEMAPHORE.post(), Err(PostSemaphoreError::Overflow));
        assert_eq!(SEMAPHORE.get_value(), Ok(2));
    }

    #[test]
    fn wait_does_not_block_with_permit() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(2);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        SEMAPHORE.wait().unwrap();
        SEMAPHORE.wait().unwrap();
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
    }

    #[test]
    fn post_from_interrupt_wakes_blocked_waiter() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        // The "ISR" fires at the preemption point inside `wait`
        SystemTraits::queue_interrupt(|| SEMAPHORE.post().unwrap());

        SEMAPHORE.wait().unwrap();
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
    }

    #[test]
    fn waiters_wake_in_priority_order() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let low = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        let high = test_support::leak_thread(20, SchedulingPolicy::Fifo);
        block_thread_on_semaphore(&SEMAPHORE, low);
        block_thread_on_semaphore(&SEMAPHORE, high);
        assert_eq!(SEMAPHORE.get_value(), Ok(-2));

        SEMAPHORE.post().unwrap();
        {
            let lock = klock::lock_cpu::<SystemTraits>().unwrap();
            assert_eq!(*high.st.read(&*lock), ThreadSt::Runnable);
            assert_eq!(*low.st.read(&*lock), ThreadSt::BlockedOnSemaphore);
        }
        assert_eq!(SEMAPHORE.get_value(), Ok(-1));

        SEMAPHORE.post().unwrap();
        {
            let lock = klock::lock_cpu::<SystemTraits>().unwrap();
            assert_eq!(*low.st.read(&*lock), ThreadSt::Runnable);
        }
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
    }

    #[test]
    fn timed_wait_times_out_and_restores_value() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let start = <SystemTraits as crate::Kernel>::now().unwrap();

        // `try_wait_for(3)` started at tick T completes at T + 3 + 1
        for _ in 0..4 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        assert_eq!(
            SEMAPHORE.try_wait_for(TickDuration::from_ticks(3)),
            Err(WaitSemaphoreTimeoutError::Timeout)
        );

        let end = <SystemTraits as crate::Kernel>::now().unwrap();
        assert_eq!(end.saturating_duration_since(start).as_ticks(), 4);

        // No side effect beyond clock advance
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
    }

    #[test]
    fn timed_wait_succeeds_before_timeout() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        SystemTraits::queue_interrupt(|| SystemTraits::tick());
        SystemTraits::queue_interrupt(|| SEMAPHORE.post().unwrap());

        SEMAPHORE.try_wait_for(TickDuration::from_ticks(10)).unwrap();
        assert_eq!(SEMAPHORE.get_value(), Ok(0));
    }

    #[test]
    fn timeout_of_one_waiter_leaves_the_other() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let other = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        block_thread_on_semaphore(&SEMAPHORE, other);

        for _ in 0..4 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        assert_eq!(
            SEMAPHORE.try_wait_for(TickDuration::from_ticks(3)),
            Err(WaitSemaphoreTimeoutError::Timeout)
        );

        // Our permit was restored; `other`'s is still accounted for
        assert_eq!(SEMAPHORE.get_value(), Ok(-1));
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert_eq!(*other.st.read(&*lock.borrow_mut()), ThreadSt::BlockedOnSemaphore);
    }

    #[test]
    fn wait_result_is_recorded_for_inert_waiters() {
        define_test_kernel!(SystemTraits);
        static SEMAPHORE: SemaphoreCb<SystemTraits> = SemaphoreCb::new(0);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let other = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        block_thread_on_semaphore(&SEMAPHORE, other);

        SEMAPHORE.post().unwrap();

        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert_eq!(
            wait::wait_result_for_test(lock.borrow_mut(), other),
            Ok(())
        );
    }
}
