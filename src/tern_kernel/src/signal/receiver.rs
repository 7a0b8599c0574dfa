//! Signal generation, queuing, acceptance, and synchronous waits
use core::{fmt, ptr::NonNull};

use crate::{
    error::{
        GenerateSignalError, PollSignalsError, QueueSignalError, SignalActionError,
        SignalMaskError, WaitError, WaitSignalsError, WaitSignalsTimeoutError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    signal::{
        SignalAction, SignalInformation, SignalInformationCode, SignalInformationQueueCb,
        SignalSet, SignalsCatcherCb, SIGNAL_COUNT,
    },
    state, thread,
    thread::{list::ThreadList, ThreadCb, ThreadSt},
    time::{TickDuration, TickInstant},
    timeout,
    wait::{self, WaitPayload},
    KernelTraits, Port,
};

/// A pointer to the waiting-signal set living in the waiting thread's stack
/// frame.
struct WaitingSetPtr(NonNull<SignalSet>);

// Safety: The pointee lives in the stack frame of a thread that stays blocked
// for as long as the pointer is installed, and is only accessed under CPU
// Lock
unsafe impl Send for WaitingSetPtr {}
unsafe impl Sync for WaitingSetPtr {}

impl Clone for WaitingSetPtr {
    fn clone(&self) -> Self {
        *self
    }
}

impl Copy for WaitingSetPtr {}

/// *Signals receiver control block* - the per-thread state required for
/// receiving signals.
///
/// A receiver is constructed with optional references to a
/// [`SignalsCatcherCb`] (enabling signal actions, the signal mask, and
/// asynchronous delivery) and a [`SignalInformationQueueCb`] (enabling queued
/// signals). Facilities the receiver was constructed without report
/// `NotSupported`.
pub struct SignalsReceiverCb<Traits: Port> {
    /// The set of pending generated signals (at most one instance per signal
    /// number).
    pending_signal_set: CpuLockCell<Traits, SignalSet>,

    /// Points to the set of signals the owning thread is synchronously
    /// waiting for. `None` iff the thread is not in a synchronous signal
    /// wait.
    waiting_signal_set: CpuLockCell<Traits, Option<WaitingSetPtr>>,

    /// The catcher for this receiver, `None` if this receiver cannot
    /// catch/handle signals.
    catcher: Option<&'static SignalsCatcherCb<Traits>>,

    /// The queued-signal pool, `None` if this receiver cannot queue signals.
    queue: Option<&'static SignalInformationQueueCb<Traits>>,

    /// The thread owning this receiver. Established by `ThreadCb::start`.
    owner: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The wait list for the owning thread's synchronous signal waits. Holds
    /// at most one thread.
    wait_queue: ThreadList<Traits>,
}

impl<Traits: Port> SignalsReceiverCb<Traits> {
    /// Construct a `SignalsReceiverCb`.
    ///
    /// Passing `None` for `catcher` disables catching/handling of signals for
    /// this receiver; passing `None` for `queue` disables queuing.
    pub const fn new(
        catcher: Option<&'static SignalsCatcherCb<Traits>>,
        queue: Option<&'static SignalInformationQueueCb<Traits>>,
    ) -> Self {
        Self {
            pending_signal_set: CpuLockCell::new(SignalSet::EMPTY),
            waiting_signal_set: CpuLockCell::new(None),
            catcher,
            queue,
            owner: CpuLockCell::new(None),
            wait_queue: ThreadList::new(ThreadSt::BlockedOnSignalWait),
        }
    }

    pub(crate) fn catcher(&self) -> Option<&'static SignalsCatcherCb<Traits>> {
        self.catcher
    }
}

impl<Traits: KernelTraits> fmt::Debug for SignalsReceiverCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalsReceiverCb")
            .field("self", &(self as *const _))
            .field("pending_signal_set", &self.pending_signal_set)
            .field(
                "waiting",
                &self
                    .waiting_signal_set
                    .debug_fmt_with(|x, f| x.is_some().fmt(f)),
            )
            .field("catcher", &self.catcher.map(|x| x as *const _))
            .field("queue", &self.queue.map(|x| x as *const _))
            .finish()
    }
}

impl<Traits: KernelTraits> SignalsReceiverCb<Traits> {
    /// Associate this receiver with the thread it belongs to.
    pub(crate) fn set_owner(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        self.owner.replace(&mut *lock, Some(thread));
    }

    /// Get the set of currently pending signals: the pending bits plus every
    /// signal with a queued instance.
    pub(super) fn pending_signal_set_inner(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> SignalSet {
        let pending_signal_set = self.pending_signal_set.get(&*lock);
        match self.queue {
            Some(queue) => pending_signal_set | queue.queued_signal_set(lock.borrow_mut()),
            None => pending_signal_set,
        }
    }

    /// Accept (remove) one instance of `signal_number`: the oldest queued
    /// instance if there is one, the pending bit otherwise. Returns `None`
    /// if no instance is pending.
    pub(super) fn accept_pending_signal_inner(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
    ) -> Option<SignalInformation> {
        if let Some(queue) = self.queue {
            if let Some(information) =
                queue.accept_queued_signal(lock.borrow_mut(), signal_number)
            {
                return Some(information);
            }
        }

        if self.pending_signal_set.get(&*lock).contains(signal_number) {
            let pending_signal_set = self.pending_signal_set.write(&mut *lock);
            let mut new_set = *pending_signal_set;
            // The signal number was validated by the caller
            new_set.remove(signal_number).unwrap();
            *pending_signal_set = new_set;
            return Some(SignalInformation::new(
                signal_number,
                SignalInformationCode::Generated,
                0,
            ));
        }

        None
    }

    /// Actions executed after a signal is generated or queued: arrange for
    /// asynchronous delivery (unmasked caught signals), or wake the owning
    /// thread from a matching synchronous wait.
    fn post_generate(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, signal_number: u8) {
        if let Some(catcher) = self.catcher {
            if !catcher
                .signal_mask(lock.borrow_mut())
                .contains(signal_number)
            {
                // The signal is not masked: asynchronous delivery (or the
                // default action) takes precedence over synchronous waits
                if let Some(owner) = self.owner.get(&*lock) {
                    catcher.post_generate(lock.borrow_mut(), signal_number, owner);
                }
                return;
            }
        }

        let Some(waiting_set_ptr) = self.waiting_signal_set.get(&*lock) else {
            return;
        };

        // Safety: The pointee lives in the blocked owner's stack frame, which
        // stays valid while `waiting_signal_set` is installed
        let waiting_set = unsafe { *waiting_set_ptr.0.as_ref() };

        if waiting_set.contains(signal_number) {
            // The owner is blocked in a matching synchronous wait; wake it up
            let waiter = self.wait_queue.first(lock.borrow_mut()).unwrap();
            wait::complete_wait(lock.borrow_mut(), waiter, Ok(()));
        }
    }

    fn generate(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
    ) -> Result<(), GenerateSignalError> {
        if signal_number >= SIGNAL_COUNT {
            return Err(GenerateSignalError::InvalidArgument);
        }

        let pending_signal_set = self.pending_signal_set.write(&mut *lock);
        let mut new_set = *pending_signal_set;
        new_set.add(signal_number).unwrap();
        *pending_signal_set = new_set;

        self.post_generate(lock, signal_number);
        Ok(())
    }

    fn queue(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
        value: u32,
    ) -> Result<(), QueueSignalError> {
        if signal_number >= SIGNAL_COUNT {
            return Err(QueueSignalError::InvalidArgument);
        }

        let Some(queue) = self.queue else {
            return Err(QueueSignalError::NotSupported);
        };

        if !queue.queue_signal(lock.borrow_mut(), signal_number, value) {
            return Err(QueueSignalError::AgainNoResources);
        }

        self.post_generate(lock, signal_number);
        Ok(())
    }
}

/// Generate a signal for the specified thread, as if by `pthread_kill`.
///
/// The signal's pending bit is set (at most one generated instance per signal
/// number is tracked). If the thread is blocked in a matching synchronous
/// signal wait, it is woken up; if the signal is caught and unmasked, its
/// handler is delivered asynchronously instead.
///
/// This operation never blocks and is safe to call from an interrupt context.
pub fn generate_signal<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    signal_number: u8,
) -> Result<(), GenerateSignalError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    let Some(receiver) = thread.attr.signals_receiver else {
        return Err(GenerateSignalError::NotSupported);
    };

    receiver.generate(lock.borrow_mut(), signal_number)?;

    // The receiver may have woken up its owner
    thread::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Queue a signal with an attached value for the specified thread, as if by
/// `sigqueue`.
///
/// Unlike [`generate_signal`], each call queues a distinct instance; the
/// instances are accepted in FIFO order per signal number.
///
/// This operation never blocks and is safe to call from an interrupt context.
pub fn queue_signal<Traits: KernelTraits>(
    thread: &'static ThreadCb<Traits>,
    signal_number: u8,
    value: u32,
) -> Result<(), QueueSignalError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    let Some(receiver) = thread.attr.signals_receiver else {
        return Err(QueueSignalError::NotSupported);
    };

    receiver.queue(lock.borrow_mut(), signal_number, value)?;

    // The receiver may have woken up its owner
    thread::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// Accept one pending instance of `signal_number` on the current thread:
/// the oldest queued instance if there is one, the pending bit otherwise.
/// Fails with `Again` if no instance is pending.
pub fn accept_pending_signal<Traits: KernelTraits>(
    signal_number: u8,
) -> Result<SignalInformation, PollSignalsError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    if signal_number >= SIGNAL_COUNT {
        return Err(PollSignalsError::InvalidArgument);
    }

    let receiver = current_receiver::<Traits, PollSignalsError>(lock.borrow_mut())?;

    receiver
        .accept_pending_signal_inner(lock.borrow_mut(), signal_number)
        .ok_or(PollSignalsError::Again)
}

/// Get the set of signals pending for the current thread.
pub fn pending_signal_set<Traits: KernelTraits>() -> Result<SignalSet, PollSignalsError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    let receiver = current_receiver::<Traits, PollSignalsError>(lock.borrow_mut())?;
    Ok(receiver.pending_signal_set_inner(lock.borrow_mut()))
}

/// Wait for one of the signals in `signal_set` to become pending for the
/// current thread, then accept and return it. If a matching signal is
/// already pending, it is accepted immediately.
pub fn wait_signals<Traits: KernelTraits>(
    signal_set: SignalSet,
) -> Result<SignalInformation, WaitSignalsError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    match wait_signals_inner(lock.borrow_mut(), signal_set, Some(None)) {
        Ok(information) => Ok(information),
        Err(SignalWaitFailure::NotSupported) => Err(WaitSignalsError::NotSupported),
        Err(SignalWaitFailure::Again | SignalWaitFailure::Timeout) => {
            unreachable!("an untimed signal wait can only end by acceptance")
        }
    }
}

/// As [`wait_signals`], but fail with `Again` instead of blocking.
pub fn try_wait_signals<Traits: KernelTraits>(
    signal_set: SignalSet,
) -> Result<SignalInformation, PollSignalsError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    match wait_signals_inner(lock.borrow_mut(), signal_set, None) {
        Ok(information) => Ok(information),
        Err(SignalWaitFailure::NotSupported) => Err(PollSignalsError::NotSupported),
        Err(SignalWaitFailure::Again) => Err(PollSignalsError::Again),
        Err(SignalWaitFailure::Timeout) => {
            unreachable!("a non-blocking signal wait cannot time out")
        }
    }
}

/// As [`wait_signals`], but give up with `Timeout` after the specified
/// duration.
pub fn try_wait_signals_for<Traits: KernelTraits>(
    signal_set: SignalSet,
    duration: TickDuration,
) -> Result<SignalInformation, WaitSignalsTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    match wait_signals_inner(
        lock.borrow_mut(),
        signal_set,
        Some(Some(timeout::Expiry::After(duration.as_ticks()))),
    ) {
        Ok(information) => Ok(information),
        Err(SignalWaitFailure::NotSupported) => Err(WaitSignalsTimeoutError::NotSupported),
        Err(SignalWaitFailure::Timeout) => Err(WaitSignalsTimeoutError::Timeout),
        Err(SignalWaitFailure::Again) => {
            unreachable!("a blocking signal wait does not report `Again`")
        }
    }
}

/// As [`wait_signals`], but give up with `Timeout` at the specified time
/// point.
pub fn try_wait_signals_until<Traits: KernelTraits>(
    signal_set: SignalSet,
    time_point: TickInstant,
) -> Result<SignalInformation, WaitSignalsTimeoutError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    match wait_signals_inner(
        lock.borrow_mut(),
        signal_set,
        Some(Some(timeout::Expiry::At(time_point.as_ticks()))),
    ) {
        Ok(information) => Ok(information),
        Err(SignalWaitFailure::NotSupported) => Err(WaitSignalsTimeoutError::NotSupported),
        Err(SignalWaitFailure::Timeout) => Err(WaitSignalsTimeoutError::Timeout),
        Err(SignalWaitFailure::Again) => {
            unreachable!("a blocking signal wait does not report `Again`")
        }
    }
}

/// Failure modes of the synchronous wait core.
enum SignalWaitFailure {
    NotSupported,
    Again,
    Timeout,
}

/// The core of the synchronous signal wait operations.
///
/// `blocking` selects the flavor: `None` polls without blocking, `Some(None)`
/// waits indefinitely, and `Some(Some(expiry))` waits with a timeout.
fn wait_signals_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    signal_set: SignalSet,
    blocking: Option<Option<timeout::Expiry>>,
) -> Result<SignalInformation, SignalWaitFailure> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    let Some(receiver) = thread.attr.signals_receiver else {
        return Err(SignalWaitFailure::NotSupported);
    };

    // Check for an already-pending match
    let matching = receiver.pending_signal_set_inner(lock.borrow_mut()) & signal_set;
    if let Some(signal_number) = matching.lowest_set() {
        let information = receiver
            .accept_pending_signal_inner(lock.borrow_mut(), signal_number)
            .unwrap();
        return Ok(information);
    }

    let Some(expiry) = blocking else {
        return Err(SignalWaitFailure::Again);
    };

    // Install the waiting-signal set and block. The set lives in this stack
    // frame; it stays valid because this thread remains blocked while the
    // pointer is installed, and the pointer is cleared on every exit path
    // below.
    let waiting_set = signal_set;
    receiver
        .waiting_signal_set
        .replace(&mut *lock, Some(WaitingSetPtr(NonNull::from(&waiting_set))));

    let wait_result = match expiry {
        None => wait::wait_in_list(
            lock.borrow_mut(),
            &receiver.wait_queue,
            WaitPayload::SignalWait,
        )
        .map_err(|_: WaitError| WaitTimeoutError::Interrupted),
        Some(expiry) => wait::wait_in_list_timeout(
            lock.borrow_mut(),
            &receiver.wait_queue,
            WaitPayload::SignalWait,
            expiry,
        ),
    };

    receiver.waiting_signal_set.replace(&mut *lock, None);

    match wait_result {
        Ok(()) => {
            // A matching signal was generated while we were blocked; accept
            // the lowest-numbered match
            let matching = receiver.pending_signal_set_inner(lock.borrow_mut()) & signal_set;
            let signal_number = matching.lowest_set().unwrap();
            let information = receiver
                .accept_pending_signal_inner(lock.borrow_mut(), signal_number)
                .unwrap();
            Ok(information)
        }
        Err(WaitTimeoutError::Timeout) => Err(SignalWaitFailure::Timeout),
        Err(WaitTimeoutError::Interrupted) => {
            unreachable!("signal waits are not interrupted; they complete by acceptance")
        }
    }
}

/// Get the signal mask of the current thread.
pub fn signal_mask<Traits: KernelTraits>() -> Result<SignalSet, SignalMaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    let receiver = current_receiver::<Traits, SignalMaskError>(lock.borrow_mut())?;
    let Some(catcher) = receiver.catcher else {
        return Err(SignalMaskError::NotSupported);
    };

    Ok(catcher.signal_mask(lock.borrow_mut()))
}

/// Set the signal mask of the current thread.
///
/// If the update unmasks a signal that is already pending and caught, a new
/// asynchronous delivery is requested so that the queued work is not lost.
pub fn set_signal_mask<Traits: KernelTraits>(
    signal_mask: SignalSet,
) -> Result<(), SignalMaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    let receiver = current_receiver::<Traits, SignalMaskError>(lock.borrow_mut())?;
    let Some(catcher) = receiver.catcher else {
        return Err(SignalMaskError::NotSupported);
    };

    let old_signal_mask = catcher.signal_mask(lock.borrow_mut());
    catcher.set_signal_mask_raw(lock.borrow_mut(), signal_mask);

    // Request a delivery for signals that are pending and were just unmasked
    // (unless the delivery loop itself is doing the update, in which case it
    // will pick them up on its own)
    let unmasked_pending = receiver.pending_signal_set_inner(lock.borrow_mut())
        & old_signal_mask
        & !signal_mask;
    if !unmasked_pending.is_empty() && !catcher.is_delivery_in_progress(lock.borrow_mut()) {
        catcher.request_delivery(lock.borrow_mut(), thread);
    }

    Ok(())
}

/// Get the action associated with `signal_number` for the current thread.
pub fn signal_action<Traits: KernelTraits>(
    signal_number: u8,
) -> Result<SignalAction, SignalActionError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    if signal_number >= SIGNAL_COUNT {
        return Err(SignalActionError::InvalidArgument);
    }

    let receiver = current_receiver::<Traits, SignalActionError>(lock.borrow_mut())?;
    let Some(catcher) = receiver.catcher else {
        return Err(SignalActionError::NotSupported);
    };

    Ok(catcher.association(lock.borrow_mut(), signal_number))
}

/// Set the action associated with `signal_number` for the current thread,
/// returning the previous one.
pub fn set_signal_action<Traits: KernelTraits>(
    signal_number: u8,
    action: SignalAction,
) -> Result<SignalAction, SignalActionError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_thread_context::<Traits>()?;

    if signal_number >= SIGNAL_COUNT {
        return Err(SignalActionError::InvalidArgument);
    }

    let receiver = current_receiver::<Traits, SignalActionError>(lock.borrow_mut())?;
    let Some(catcher) = receiver.catcher else {
        return Err(SignalActionError::NotSupported);
    };

    catcher
        .set_association(lock.borrow_mut(), signal_number, action)
        .map_err(|()| SignalActionError::AgainNoResources)
}

/// Internal helper for constructing the `NotSupported` variant of the signal
/// error types.
trait NotSupportedError {
    fn not_supported() -> Self;
}

macro_rules! impl_not_supported {
    ( $( $Name:ty ),* $(,)? ) => {
        $(
            impl NotSupportedError for $Name {
                fn not_supported() -> Self {
                    Self::NotSupported
                }
            }
        )*
    };
}

impl_not_supported! {
    PollSignalsError,
    SignalMaskError,
    SignalActionError,
}

/// Get the current thread's signals receiver, or `NotSupported` if the
/// thread was constructed without one.
fn current_receiver<Traits: KernelTraits, E: NotSupportedError>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static SignalsReceiverCb<Traits>, E> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    thread
        .attr
        .signals_receiver
        .ok_or_else(|| E::not_supported())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signal::SignalInformationCode,
        test_support,
        thread::{SchedulingPolicy, StackStorage, ThreadAttr, ThreadStack},
    };

    /// Build the full static object graph for a signal-receiving main thread.
    macro_rules! define_signal_main {
        ($Traits:ident, $MAIN:ident, catcher: $catcher:expr, queue: $queue:expr) => {
            static STACK: StackStorage<256> = StackStorage::new();
            static RECEIVER: SignalsReceiverCb<$Traits> = SignalsReceiverCb::new($catcher, $queue);
            fn main_entry(_: usize) {}
            static ATTR: ThreadAttr<$Traits> = ThreadAttr {
                entry_point: main_entry,
                entry_param: 0,
                stack: ThreadStack::new(&STACK),
                priority: 200,
                policy: SchedulingPolicy::Fifo,
                signals_receiver: Some(&RECEIVER),
            };
            static $MAIN: ThreadCb<$Traits> = ThreadCb::new(&ATTR);

            test_support::adopt_main::<$Traits>(&$MAIN);
        };
    }

    #[test]
    fn generated_signal_is_pending_once() {
        define_test_kernel!(SystemTraits);
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: None);

        generate_signal(&MAIN, 5).unwrap();
        generate_signal(&MAIN, 5).unwrap();

        let pending = pending_signal_set::<SystemTraits>().unwrap();
        assert!(pending.test(5).unwrap());

        // Two generations collapse into a single pending instance
        let information = accept_pending_signal::<SystemTraits>(5).unwrap();
        assert_eq!(information.signal_number(), 5);
        assert_eq!(information.code(), SignalInformationCode::Generated);
        assert_eq!(information.value(), 0);

        assert_eq!(
            accept_pending_signal::<SystemTraits>(5),
            Err(PollSignalsError::Again)
        );
    }

    #[test]
    fn queued_signals_are_fifo_per_signal() {
        define_test_kernel!(SystemTraits);
        static QUEUE: SignalInformationQueueCb<SystemTraits> = SignalInformationQueueCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: Some(&QUEUE));

        queue_signal(&MAIN, 3, 100).unwrap();
        queue_signal(&MAIN, 3, 200).unwrap();
        queue_signal(&MAIN, 3, 300).unwrap();

        for expected in [100, 200, 300] {
            let information = accept_pending_signal::<SystemTraits>(3).unwrap();
            assert_eq!(information.signal_number(), 3);
            assert_eq!(information.code(), SignalInformationCode::Queued);
            assert_eq!(information.value(), expected);
        }

        assert_eq!(
            accept_pending_signal::<SystemTraits>(3),
            Err(PollSignalsError::Again)
        );
    }

    #[test]
    fn queued_pool_exhaustion_and_missing_facilities() {
        define_test_kernel!(SystemTraits);
        static QUEUE: SignalInformationQueueCb<SystemTraits> = SignalInformationQueueCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: Some(&QUEUE));

        for i in 0..crate::cfg::SIGNAL_QUEUE_LEN {
            queue_signal(&MAIN, 1, i as u32).unwrap();
        }
        assert_eq!(
            queue_signal(&MAIN, 1, 999),
            Err(QueueSignalError::AgainNoResources)
        );

        // No catcher: mask and action accessors are unavailable
        assert_eq!(
            signal_mask::<SystemTraits>(),
            Err(SignalMaskError::NotSupported)
        );
        assert_eq!(
            signal_action::<SystemTraits>(1),
            Err(SignalActionError::NotSupported)
        );

        // Out-of-range signal numbers
        assert_eq!(
            generate_signal(&MAIN, 32),
            Err(GenerateSignalError::InvalidArgument)
        );
        assert_eq!(
            queue_signal(&MAIN, 99, 0),
            Err(QueueSignalError::InvalidArgument)
        );
    }

    #[test]
    fn try_wait_accepts_pending_or_reports_again() {
        define_test_kernel!(SystemTraits);
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: None);

        let set = SignalSet::EMPTY.with(2).with(7);
        assert_eq!(
            try_wait_signals::<SystemTraits>(set),
            Err(PollSignalsError::Again)
        );

        generate_signal(&MAIN, 7).unwrap();
        generate_signal(&MAIN, 2).unwrap();

        // The lowest-numbered matching signal wins
        let information = try_wait_signals::<SystemTraits>(set).unwrap();
        assert_eq!(information.signal_number(), 2);
        let information = try_wait_signals::<SystemTraits>(set).unwrap();
        assert_eq!(information.signal_number(), 7);
    }

    #[test]
    fn generate_unblocks_synchronous_wait() {
        define_test_kernel!(SystemTraits);
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: None);

        // The generating "thread" is an ISR firing once the waiter blocked
        SystemTraits::queue_interrupt(|| generate_signal(&MAIN, 7).unwrap());

        let information = wait_signals::<SystemTraits>(SignalSet::EMPTY.with(7)).unwrap();
        assert_eq!(information.signal_number(), 7);
        assert_eq!(information.code(), SignalInformationCode::Generated);

        // The waiting-signal set was cleared on the way out
        let lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(RECEIVER.waiting_signal_set.get(&*lock).is_none());
    }

    #[test]
    fn queued_signal_unblocks_synchronous_wait_with_payload() {
        define_test_kernel!(SystemTraits);
        static QUEUE: SignalInformationQueueCb<SystemTraits> = SignalInformationQueueCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: Some(&QUEUE));

        SystemTraits::queue_interrupt(|| queue_signal(&MAIN, 4, 0xabcd).unwrap());

        let information = wait_signals::<SystemTraits>(SignalSet::EMPTY.with(4)).unwrap();
        assert_eq!(information.signal_number(), 4);
        assert_eq!(information.code(), SignalInformationCode::Queued);
        assert_eq!(information.value(), 0xabcd);
    }

    #[test]
    fn timed_signal_wait_times_out() {
        define_test_kernel!(SystemTraits);
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: None);

        for _ in 0..3 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        assert_eq!(
            try_wait_signals_for::<SystemTraits>(
                SignalSet::EMPTY.with(1),
                TickDuration::from_ticks(2)
            ),
            Err(WaitSignalsTimeoutError::Timeout)
        );

        let lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(RECEIVER.waiting_signal_set.get(&*lock).is_none());
    }

    #[test]
    fn signal_not_in_waiting_set_does_not_wake() {
        define_test_kernel!(SystemTraits);
        define_signal_main!(SystemTraits, MAIN, catcher: None, queue: None);

        // Signal 9 is generated but not waited for; the wait must run into
        // its timeout
        SystemTraits::queue_interrupt(|| generate_signal(&MAIN, 9).unwrap());
        for _ in 0..3 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        assert_eq!(
            try_wait_signals_for::<SystemTraits>(
                SignalSet::EMPTY.with(1),
                TickDuration::from_ticks(2)
            ),
            Err(WaitSignalsTimeoutError::Timeout)
        );

        // Signal 9 is still pending
        assert!(pending_signal_set::<SystemTraits>()
            .unwrap()
            .test(9)
            .unwrap());
    }

    #[test]
    fn caught_signal_is_delivered_asynchronously() {
        use std::sync::atomic::{AtomicU32, Ordering};

        define_test_kernel!(SystemTraits);
        static CATCHER: SignalsCatcherCb<SystemTraits> = SignalsCatcherCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: Some(&CATCHER), queue: None);

        static DELIVERED: AtomicU32 = AtomicU32::new(0);

        fn handler(information: SignalInformation) {
            assert_eq!(information.signal_number(), 3);
            // The delivered signal itself and the action's mask are masked
            // while the handler runs
            let mask = signal_mask::<SystemTraits>().unwrap();
            assert!(mask.test(3).unwrap());
            assert!(mask.test(10).unwrap());
            DELIVERED.fetch_add(1, Ordering::SeqCst);
        }

        set_signal_action::<SystemTraits>(
            3,
            SignalAction::new(handler, SignalSet::EMPTY.with(10)),
        )
        .unwrap();

        generate_signal(&MAIN, 3).unwrap();

        // The delivery request is executed at the next return to the thread,
        // which the harness models as an explicit drain
        SystemTraits::run_interrupts();

        assert_eq!(DELIVERED.load(Ordering::SeqCst), 1);
        assert_eq!(signal_mask::<SystemTraits>(), Ok(SignalSet::EMPTY));
        assert_eq!(
            accept_pending_signal::<SystemTraits>(3),
            Err(PollSignalsError::Again)
        );
    }

    #[test]
    fn masked_signal_is_delivered_after_unmasking() {
        use std::sync::atomic::{AtomicU32, Ordering};

        define_test_kernel!(SystemTraits);
        static CATCHER: SignalsCatcherCb<SystemTraits> = SignalsCatcherCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: Some(&CATCHER), queue: None);

        static DELIVERED: AtomicU32 = AtomicU32::new(0);

        fn handler(_: SignalInformation) {
            DELIVERED.fetch_add(1, Ordering::SeqCst);
        }

        set_signal_action::<SystemTraits>(6, SignalAction::new(handler, SignalSet::EMPTY))
            .unwrap();
        set_signal_mask::<SystemTraits>(SignalSet::EMPTY.with(6)).unwrap();

        generate_signal(&MAIN, 6).unwrap();
        SystemTraits::run_interrupts();
        assert_eq!(DELIVERED.load(Ordering::SeqCst), 0);

        // Unmasking the pending signal triggers a new delivery request
        set_signal_mask::<SystemTraits>(SignalSet::EMPTY).unwrap();
        SystemTraits::run_interrupts();
        assert_eq!(DELIVERED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_action_restores_previous_association() {
        define_test_kernel!(SystemTraits);
        static CATCHER: SignalsCatcherCb<SystemTraits> = SignalsCatcherCb::new();
        define_signal_main!(SystemTraits, MAIN, catcher: Some(&CATCHER), queue: None);

        fn handler(_: SignalInformation) {}

        let previous = set_signal_action::<SystemTraits>(
            8,
            SignalAction::new(handler, SignalSet::EMPTY),
        )
        .unwrap();
        assert!(previous.handler().is_none());

        let previous =
            set_signal_action::<SystemTraits>(8, SignalAction::DEFAULT).unwrap();
        assert!(previous.handler().is_some());

        assert!(signal_action::<SystemTraits>(8)
            .unwrap()
            .handler()
            .is_none());
    }
}
