//! Software timers
//!
//! A software timer invokes an application callback after a delay and,
//! optionally, periodically thereafter. Timers are driven by the timeout
//! engine: an active timer with a delay owns a linked [`timeout::Timeout`];
//! the timeout handler re-arms periodic timers by advancing the expiration by
//! the period (relative to the previous expiration, so periods don't drift)
//! before invoking the callback outside CPU Lock.
use core::fmt;

use crate::{
    error::ResultCode,
    klock::{assume_cpu_lock, lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    time::TickDuration,
    timeout,
    utils::pin::static_pin,
    KernelTraits,
};

/// The static properties of a software timer.
pub struct TimerAttr {
    /// The callback invoked when the timer fires. Called in an interrupt
    /// context with CPU Lock inactive; it must not block.
    pub callback: fn(usize),

    /// The parameter supplied for `callback`.
    pub param: usize,
}

impl fmt::Debug for TimerAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerAttr")
            .field("callback", &self.callback)
            .field("param", &self.param)
            .finish()
    }
}

/// *Timer control block* - the state data of a software timer.
pub struct TimerCb<Traits: KernelTraits> {
    /// The static properties of the timer.
    pub attr: &'static TimerAttr,

    /// The timeout object for the timer. Linked iff the timer is Active and
    /// has a delay.
    pub(super) timeout: timeout::Timeout<Traits>,

    /// `true` iff the timer is in the Active state.
    pub(super) active: CpuLockCell<Traits, bool>,

    /// The delay before the next (first) firing, in ticks. `None` if the
    /// timer has no pending firing.
    pub(super) delay: CpuLockCell<Traits, Option<u32>>,

    /// The firing period, in ticks. `None` makes the timer one-shot.
    pub(super) period: CpuLockCell<Traits, Option<u32>>,
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Construct a `TimerCb` in the Dormant (stopped) state.
    pub const fn new(attr: &'static TimerAttr) -> Self {
        Self {
            attr,
            timeout: timeout::Timeout::new(timer_timeout_handler::<Traits>, 0),
            active: CpuLockCell::new(false),
            delay: CpuLockCell::new(None),
            period: CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("attr", &self.attr)
            .field("timeout", &self.timeout)
            .field("active", &self.active)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .finish()
    }
}

impl<Traits: KernelTraits> TimerCb<Traits> {
    /// Start the timer: it will fire after the configured delay.
    pub fn start(&'static self) -> Result<(), ResultCode> {
        let mut lock = lock_cpu::<Traits>().map_err(ResultCode::from)?;
        start_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Stop the timer, preserving the remaining delay for a later
    /// [`start`](Self::start).
    pub fn stop(&'static self) -> Result<(), ResultCode> {
        let mut lock = lock_cpu::<Traits>().map_err(ResultCode::from)?;
        stop_timer(lock.borrow_mut(), self);
        Ok(())
    }

    /// Set the delay before the next firing. `None` suspends firing until a
    /// new delay is set.
    pub fn set_delay(&'static self, delay: Option<TickDuration>) -> Result<(), ResultCode> {
        let mut lock = lock_cpu::<Traits>().map_err(ResultCode::from)?;
        set_timer_delay(lock.borrow_mut(), self, delay.map(TickDuration::as_ticks));
        Ok(())
    }

    /// Set the firing period. `None` makes the timer one-shot.
    pub fn set_period(&'static self, period: Option<TickDuration>) -> Result<(), ResultCode> {
        let mut lock = lock_cpu::<Traits>().map_err(ResultCode::from)?;
        self.period
            .replace(&mut *lock, period.map(TickDuration::as_ticks));
        Ok(())
    }

    /// Get a flag indicating whether the timer is in the Active state.
    pub fn is_active(&'static self) -> Result<bool, ResultCode> {
        let lock = lock_cpu::<Traits>().map_err(ResultCode::from)?;
        Ok(self.active.get(&*lock))
    }
}

/// The core portion of [`TimerCb::start`].
fn start_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.active.get(&*lock) {
        return;
    }

    if let Some(delay) = timer_cb.delay.get(&*lock) {
        // Schedule the first firing
        timer_cb
            .timeout
            .set_callback_param(lock.borrow_mut(), timer_cb as *const _ as usize);
        timer_cb
            .timeout
            .set_expiry(lock.borrow_mut(), timeout::Expiry::After(delay));
        timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
    }

    timer_cb.active.replace(&mut *lock, true);
}

/// The core portion of [`TimerCb::stop`].
fn stop_timer<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        debug_assert!(timer_cb.active.get(&*lock));

        // Capture the remaining delay so a later `start` resumes from here
        let remaining = timer_cb
            .timeout
            .saturating_ticks_until_expiry(lock.borrow_mut());
        timer_cb.delay.replace(&mut *lock, Some(remaining));

        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    timer_cb.active.replace(&mut *lock, false);
}

/// The core portion of [`TimerCb::set_delay`].
fn set_timer_delay<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer_cb: &'static TimerCb<Traits>,
    delay: Option<u32>,
) {
    if timer_cb.timeout.is_linked(lock.borrow_mut()) {
        timeout::remove_timeout(lock.borrow_mut(), &timer_cb.timeout);
    }

    timer_cb.delay.replace(&mut *lock, delay);

    if timer_cb.active.get(&*lock) {
        if let Some(delay) = delay {
            timer_cb
                .timeout
                .set_callback_param(lock.borrow_mut(), timer_cb as *const _ as usize);
            timer_cb
                .timeout
                .set_expiry(lock.borrow_mut(), timeout::Expiry::After(delay));
            timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
        }
    }
}

/// The timeout callback function for a timer, registered when the timer's
/// [`timeout::Timeout`] is armed. `param` is the `TimerCb`'s address.
fn timer_timeout_handler<Traits: KernelTraits>(
    param: usize,
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    // Safety: We are just converting `param` back to the original form
    let timer_cb = unsafe { &*(param as *const TimerCb<Traits>) };

    debug_assert!(!timer_cb.timeout.is_linked(lock.borrow_mut()));
    debug_assert!(timer_cb.active.get(&*lock));

    // Schedule the next firing
    match timer_cb.period.get(&*lock) {
        Some(period) => {
            // Advance relative to the previous expiration so periodic timers
            // don't accumulate drift
            timer_cb.timeout.adjust_expiration(lock.borrow_mut(), period);
            timeout::insert_timeout(lock.borrow_mut(), static_pin(&timer_cb.timeout));
        }
        None => {
            // One-shot: stay Active but don't fire again
            timer_cb.delay.replace(&mut *lock, None);
        }
    }

    // Release CPU Lock before calling the application-provided callback
    // function
    drop(lock);

    let TimerAttr { callback, param } = timer_cb.attr;
    callback(*param);

    // Re-acquire CPU Lock
    lock_cpu().unwrap_or_else(|_| unsafe { assume_cpu_lock() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, thread::SchedulingPolicy, Kernel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_timer_fires_once() {
        define_test_kernel!(SystemTraits);

        static FIRED: AtomicUsize = AtomicUsize::new(0);
        static ATTR: TimerAttr = TimerAttr {
            callback: |_| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            },
            param: 0,
        };
        static TIMER: TimerCb<SystemTraits> = TimerCb::new(&ATTR);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        TIMER.set_delay(Some(TickDuration::from_ticks(2))).unwrap();
        TIMER.start().unwrap();

        // Armed at T + 2 + 1
        SystemTraits::tick();
        SystemTraits::tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        SystemTraits::tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        for _ in 0..5 {
            SystemTraits::tick();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(TIMER.is_active(), Ok(true));
    }

    #[test]
    fn periodic_timer_rearms_without_drift() {
        define_test_kernel!(SystemTraits);

        static FIRED: AtomicUsize = AtomicUsize::new(0);
        static ATTR: TimerAttr = TimerAttr {
            callback: |_| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            },
            param: 0,
        };
        static TIMER: TimerCb<SystemTraits> = TimerCb::new(&ATTR);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        TIMER.set_delay(Some(TickDuration::from_ticks(0))).unwrap();
        TIMER.set_period(Some(TickDuration::from_ticks(3))).unwrap();
        TIMER.start().unwrap();

        // First firing at tick 1, then every 3 ticks: 1, 4, 7, 10
        for _ in 0..10 {
            SystemTraits::tick();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn stop_preserves_remaining_delay() {
        define_test_kernel!(SystemTraits);

        static FIRED: AtomicUsize = AtomicUsize::new(0);
        static ATTR: TimerAttr = TimerAttr {
            callback: |_| {
                FIRED.fetch_add(1, Ordering::SeqCst);
            },
            param: 0,
        };
        static TIMER: TimerCb<SystemTraits> = TimerCb::new(&ATTR);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        TIMER.set_delay(Some(TickDuration::from_ticks(5))).unwrap();
        TIMER.start().unwrap();

        SystemTraits::tick();
        SystemTraits::tick();
        TIMER.stop().unwrap();
        assert_eq!(TIMER.is_active(), Ok(false));

        // While stopped, time passes without firing
        for _ in 0..10 {
            SystemTraits::tick();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        // Restarting resumes from the remaining delay (4 ticks, re-armed
        // with the usual extra tick)
        TIMER.start().unwrap();
        for _ in 0..4 {
            SystemTraits::tick();
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
        SystemTraits::tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_runs_outside_cpu_lock_and_sees_time() {
        define_test_kernel!(SystemTraits);

        static OBSERVED_TICK: AtomicUsize = AtomicUsize::new(usize::MAX);
        static ATTR: TimerAttr = TimerAttr {
            callback: |_| {
                // The callback runs with CPU Lock released, so kernel
                // services are available
                let now = SystemTraits::now().unwrap();
                OBSERVED_TICK.store(now.as_ticks() as usize, Ordering::SeqCst);
            },
            param: 0,
        };
        static TIMER: TimerCb<SystemTraits> = TimerCb::new(&ATTR);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        TIMER.set_delay(Some(TickDuration::from_ticks(0))).unwrap();
        TIMER.start().unwrap();

        SystemTraits::tick();
        assert_eq!(OBSERVED_TICK.load(Ordering::SeqCst), 1);
    }
}
