//! Mutexes
//!
//! A mutex is an ownership-tracking binary synchronization object layered on
//! the kernel's wait machinery. Unlocking a contended mutex hands the
//! ownership directly to the highest-priority waiter instead of releasing it
//! for grabs, so the wakeup order is also the acquisition order.
//!
//! Two locking protocols can bound priority inversion:
//!
//!  - [`PriorityInheritance`](MutexProtocol::PriorityInheritance): a
//!    contending waiter raises the owner's effective priority to its own.
//!    The boost propagates transitively when the owner is itself blocked on
//!    another inheritance mutex.
//!  - [`PriorityProtect`](MutexProtocol::PriorityProtect): locking raises the
//!    owner's effective priority to the mutex's ceiling; threads whose base
//!    priority exceeds the ceiling may not lock the mutex at all.
//!
//! In both cases, the owner's effective priority is recomputed from its
//! remaining held mutexes on unlock.
use core::{fmt, ptr};

use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, ResultCode,
        TryLockMutexError, UnlockMutexError, WaitError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    state, thread,
    thread::{list::ThreadList, ThreadCb, ThreadSt},
    time::{TickDuration, TickInstant},
    timeout,
    wait::{self, WaitPayload},
    KernelTraits, Port, Priority,
};

/// How relocking and unlocking by the wrong thread are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// No usage checking beyond what memory safety requires. A relock by the
    /// owner is still reported as `Deadlock` rather than hanging forever.
    Normal,

    /// A relock by the owner fails with `Deadlock`.
    ErrorChecking,

    /// A relock by the owner succeeds, incrementing a recursion count. The
    /// mutex is released when `unlock` has been called as many times as
    /// `lock`.
    Recursive,
}

/// The locking protocol of a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    /// No priority adjustment.
    None,

    /// Priority inheritance: the owner inherits the highest effective
    /// priority among the waiters of all inheritance mutexes it holds.
    PriorityInheritance,

    /// Priority ceiling: the owner's effective priority is raised to the
    /// mutex's ceiling while it holds the mutex.
    PriorityProtect,
}

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: Port> {
    pub(super) kind: MutexKind,
    pub(super) protocol: MutexProtocol,

    /// The ceiling priority. Only meaningful when `protocol` is
    /// [`MutexProtocol::PriorityProtect`].
    pub(super) ceiling: Priority,

    /// The number of additional times the owner has locked this `Recursive`
    /// mutex.
    pub(super) recursion_count: CpuLockCell<Traits, u32>,

    /// The thread that currently owns the mutex lock.
    pub(super) owning_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The next element in the singly-linked chain headed by
    /// `ThreadCb::last_mutex_held`, containing all mutexes currently held by
    /// the owning thread.
    pub(super) prev_mutex_held: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,

    pub(super) wait_queue: ThreadList<Traits>,
}

impl<Traits: Port> MutexCb<Traits> {
    /// Construct a `MutexCb` with the specified kind and protocol.
    ///
    /// For [`MutexProtocol::PriorityProtect`], use
    /// [`with_ceiling`](Self::with_ceiling) instead.
    pub const fn new(kind: MutexKind, protocol: MutexProtocol) -> Self {
        assert!(
            !matches!(protocol, MutexProtocol::PriorityProtect),
            "the PriorityProtect protocol requires a ceiling; use `with_ceiling`"
        );
        Self::new_inner(kind, protocol, Priority::MAX)
    }

    /// Construct a `MutexCb` using the [`MutexProtocol::PriorityProtect`]
    /// protocol with the specified ceiling priority.
    pub const fn with_ceiling(kind: MutexKind, ceiling: Priority) -> Self {
        Self::new_inner(kind, MutexProtocol::PriorityProtect, ceiling)
    }

    const fn new_inner(kind: MutexKind, protocol: MutexProtocol, ceiling: Priority) -> Self {
        Self {
            kind,
            protocol,
            ceiling,
            recursion_count: CpuLockCell::new(0),
            owning_thread: CpuLockCell::new(None),
            prev_mutex_held: CpuLockCell::new(None),
            wait_queue: ThreadList::new(ThreadSt::BlockedOnMutex),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("kind", &self.kind)
            .field("protocol", &self.protocol)
            .field("ceiling", &self.ceiling)
            .field("recursion_count", &self.recursion_count)
            .field(
                "owning_thread",
                // break infinite recursion (ThreadCb → MutexCb → ThreadCb → …)
                &self
                    .owning_thread
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field(
                "prev_mutex_held",
                // prevent O((# of held mutexes)²)-order debug printing
                &self
                    .prev_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("wait_queue", &self.wait_queue)
            .finish()
    }
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Lock the mutex, blocking until it becomes available.
    pub fn lock(&'static self) -> Result<(), LockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        lock_mutex(self, lock)
    }

    /// Lock the mutex if it is immediately available; fail with `Busy`
    /// otherwise.
    pub fn try_lock(&'static self) -> Result<(), TryLockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;

        try_lock_mutex(self, lock)
    }

    /// As [`lock`](Self::lock), but give up with `Timeout` after the
    /// specified duration.
    pub fn try_lock_for(&'static self, duration: TickDuration) -> Result<(), LockMutexTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        lock_mutex_timeout(self, lock, timeout::Expiry::After(duration.as_ticks()))
    }

    /// As [`lock`](Self::lock), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_lock_until(
        &'static self,
        time_point: TickInstant,
    ) -> Result<(), LockMutexTimeoutError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        lock_mutex_timeout(self, lock, timeout::Expiry::At(time_point.as_ticks()))
    }

    /// Unlock the mutex.
    pub fn unlock(&'static self) -> Result<(), UnlockMutexError> {
        let lock = klock::lock_cpu::<Traits>()?;
        state::expect_thread_context::<Traits>()?;

        unlock_mutex(self, lock)
    }

    /// Get a flag indicating whether the mutex is currently locked.
    pub fn is_locked(&'static self) -> Result<bool, ResultCode> {
        let lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
        Ok(self.owning_thread.get(&*lock).is_some())
    }
}

/// The outcome of [`precheck_and_get_running_thread`].
enum Precheck<Traits: Port> {
    /// The mutex can be acquired or contended for by the returned (running)
    /// thread.
    Proceed(&'static ThreadCb<Traits>),

    /// The mutex is `Recursive` and was already owned by the calling thread;
    /// the recursion count has been incremented.
    Recursed,
}

/// Check the error conditions covered by [`LockMutexPrecheckError`]:
///
///  - `Deadlock`: The current thread already owns the mutex (and the mutex is
///    not `Recursive`).
///
///  - `InvalidArgument`: The mutex uses the `PriorityProtect` protocol and
///    the current thread's base priority is higher than the mutex's priority
///    ceiling.
#[inline]
fn precheck_and_get_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<Precheck<Traits>, LockMutexPrecheckError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    if ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) == thread as *const _ {
        return match mutex_cb.kind {
            MutexKind::Recursive => {
                let recursion_count = mutex_cb.recursion_count.write(&mut *lock);
                *recursion_count += 1;
                Ok(Precheck::Recursed)
            }
            // A `Normal` relock would deadlock the thread forever; report it
            // instead of hanging
            MutexKind::Normal | MutexKind::ErrorChecking => Err(LockMutexPrecheckError::Deadlock),
        };
    }

    if mutex_cb.protocol == MutexProtocol::PriorityProtect
        && thread.base_priority.get(&*lock) > mutex_cb.ceiling
    {
        return Err(LockMutexPrecheckError::InvalidArgument);
    }

    Ok(Precheck::Proceed(thread))
}

/// Check if the current state of a mutex satisfies the wait condition.
///
/// If it does, this function gives the ownership to `thread` and returns
/// `true`. Otherwise, it returns `false`, indicating the calling thread
/// should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    thread: &'static ThreadCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    if mutex_cb.owning_thread.get(&*lock).is_some() {
        false
    } else {
        lock_core(mutex_cb, thread, lock);
        true
    }
}

/// Give the ownership of the mutex to `thread`.
///
/// The thread must be in the Running state or blocked in `mutex_cb`'s wait
/// queue.
#[inline]
fn lock_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    thread: &'static ThreadCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert!(mutex_cb.owning_thread.read(&*lock).is_none());

    mutex_cb.owning_thread.replace(&mut *lock, Some(thread));
    mutex_cb.recursion_count.replace(&mut *lock, 0);

    // Push `mutex_cb` to the chain of the mutexes held by the thread
    let prev_mutex_held = thread.last_mutex_held.replace(&mut *lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut *lock, prev_mutex_held);

    if mutex_cb.protocol == MutexProtocol::PriorityProtect {
        let effective_priority = thread.effective_priority.get(&*lock);
        if mutex_cb.ceiling > effective_priority {
            thread::update_effective_priority(lock, thread, mutex_cb.ceiling);
        }
    }
}

#[inline]
pub(crate) fn lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), LockMutexError> {
    let thread = match precheck_and_get_running_thread(lock.borrow_mut(), mutex_cb)? {
        Precheck::Recursed => return Ok(()),
        Precheck::Proceed(thread) => thread,
    };

    if !poll_core(mutex_cb, thread, lock.borrow_mut()) {
        // The mutex is held by another thread. Boost the owner before
        // joining the wait queue, then wait for the ownership hand-off.
        let effective_priority = thread.effective_priority.get(&*lock);
        boost_owner_for_new_waiter(lock.borrow_mut(), mutex_cb, effective_priority);

        match wait::wait_in_list(
            lock.borrow_mut(),
            &mutex_cb.wait_queue,
            WaitPayload::Mutex(mutex_cb),
        ) {
            // The unlocker made us the owner before waking us
            Ok(()) => {}
            Err(WaitError::Interrupted) => unreachable!("mutex waits are not interruptible"),
        }

        debug_assert!(
            ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) == thread as *const _
        );
    }

    Ok(())
}

#[inline]
fn try_lock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), TryLockMutexError> {
    let thread = match precheck_and_get_running_thread(lock.borrow_mut(), mutex_cb)? {
        Precheck::Recursed => return Ok(()),
        Precheck::Proceed(thread) => thread,
    };

    if !poll_core(mutex_cb, thread, lock.borrow_mut()) {
        return Err(TryLockMutexError::Busy);
    }

    Ok(())
}

#[inline]
fn lock_mutex_timeout<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
    expiry: timeout::Expiry,
) -> Result<(), LockMutexTimeoutError> {
    let thread = match precheck_and_get_running_thread(lock.borrow_mut(), mutex_cb)? {
        Precheck::Recursed => return Ok(()),
        Precheck::Proceed(thread) => thread,
    };

    if !poll_core(mutex_cb, thread, lock.borrow_mut()) {
        let effective_priority = thread.effective_priority.get(&*lock);
        boost_owner_for_new_waiter(lock.borrow_mut(), mutex_cb, effective_priority);

        match wait::wait_in_list_timeout(
            lock.borrow_mut(),
            &mutex_cb.wait_queue,
            WaitPayload::Mutex(mutex_cb),
            expiry,
        ) {
            // The unlocker made us the owner before waking us
            Ok(()) => {}
            // The wait machinery already detached us from the wait queue and
            // dropped the owner's boost; ownership was not taken
            Err(WaitTimeoutError::Timeout) => return Err(LockMutexTimeoutError::Timeout),
            Err(WaitTimeoutError::Interrupted) => {
                unreachable!("mutex waits are not interruptible")
            }
        }

        debug_assert!(
            ptr_from_option_ref(mutex_cb.owning_thread.get(&*lock)) == thread as *const _
        );
    }

    Ok(())
}

#[inline]
fn unlock_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockGuard<Traits>,
) -> Result<(), UnlockMutexError> {
    unlock_mutex_inner(lock.borrow_mut(), mutex_cb)?;

    thread::unlock_cpu_and_check_preemption(lock);

    Ok(())
}

/// The core portion of [`MutexCb::unlock`]. May make a thread Runnable but
/// leaves the preemption check to the caller; also used by the condition
/// variable, which must atomically unlock the mutex and start waiting.
pub(crate) fn unlock_mutex_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<(), UnlockMutexError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    let Some(owning_thread) = mutex_cb.owning_thread.get(&*lock) else {
        return Err(UnlockMutexError::OwnerDead);
    };

    if !ptr::eq(owning_thread, thread) {
        // The current thread does not own the mutex
        return Err(UnlockMutexError::InvalidArgument);
    }

    let recursion_count = mutex_cb.recursion_count.get(&*lock);
    if recursion_count > 0 {
        // The mutex is `Recursive` and remains owned
        mutex_cb
            .recursion_count
            .replace(&mut *lock, recursion_count - 1);
        return Ok(());
    }

    // Remove `mutex_cb` from the chain of the mutexes held by the thread
    remove_from_held_chain(lock.borrow_mut(), thread, mutex_cb);

    // Lower the thread's effective priority. This may cause preemption.
    let base_priority = thread.base_priority.get(&*lock);
    let effective_priority =
        evaluate_thread_effective_priority(lock.borrow_mut(), thread, base_priority);
    thread::update_effective_priority(lock.borrow_mut(), thread, effective_priority);

    // Wake up the next waiter
    unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());

    Ok(())
}

/// Release the mutex and hand the ownership to the next waiter, if any.
///
/// This function doesn't restore the previous owner's effective priority.
///
/// This function may make a thread Runnable, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
fn unlock_mutex_unchecked<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    mutex_cb.owning_thread.replace(&mut *lock, None);

    if let Some(next_thread) = mutex_cb.wait_queue.first(lock.borrow_mut()) {
        // Give the ownership of the mutex to `next_thread`
        lock_core(mutex_cb, next_thread, lock.borrow_mut());

        // Wake up the new owner
        wait::complete_wait(lock.borrow_mut(), next_thread, Ok(()));

        // The remaining waiters (if any) now boost the new owner
        reevaluate_owner_effective_priority(lock.borrow_mut(), mutex_cb);
    }
}

/// Abandon all mutexes held by the thread, handing each to its next waiter.
///
/// This function doesn't restore the thread's effective priority.
///
/// This function may make threads Runnable, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` (or something similar) as needed.
pub(crate) fn abandon_held_mutexes<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    let mut maybe_mutex_cb = thread.last_mutex_held.replace(&mut *lock, None);
    while let Some(mutex_cb) = maybe_mutex_cb {
        maybe_mutex_cb = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        unlock_mutex_unchecked(mutex_cb, lock.borrow_mut());
    }
}

/// Unlink `mutex_cb` from the chain of mutexes held by `thread`. Unlocking in
/// any order is allowed, so this may have to walk the chain.
fn remove_from_held_chain<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    // The thread owns `mutex_cb`, so the chain must contain it
    let last_mutex_held = thread.last_mutex_held.get(&*lock).unwrap();

    if ptr::eq(last_mutex_held, mutex_cb) {
        let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
        thread.last_mutex_held.replace(&mut *lock, prev);
        return;
    }

    let mut cursor = last_mutex_held;
    loop {
        let next = cursor.prev_mutex_held.get(&*lock).unwrap();
        if ptr::eq(next, mutex_cb) {
            let prev = mutex_cb.prev_mutex_held.replace(&mut *lock, None);
            cursor.prev_mutex_held.replace(&mut *lock, prev);
            return;
        }
        cursor = next;
    }
}

/// Reevaluate the thread's effective priority and return the result.
/// (This function doesn't update `ThreadCb::effective_priority`.)
/// The base priority is assumed to be `base_priority`.
pub(crate) fn evaluate_thread_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &ThreadCb<Traits>,
    base_priority: Priority,
) -> Priority {
    let mut effective_priority = base_priority;
    let mut maybe_mutex_cb = thread.last_mutex_held.get(&*lock);

    while let Some(mutex_cb) = maybe_mutex_cb {
        match mutex_cb.protocol {
            MutexProtocol::PriorityProtect => {
                effective_priority = effective_priority.max(mutex_cb.ceiling);
            }
            MutexProtocol::PriorityInheritance => {
                // The wait queue is priority-ordered, so the first waiter has
                // the highest effective priority
                if let Some(waiter) = mutex_cb.wait_queue.first(lock.borrow_mut()) {
                    effective_priority =
                        effective_priority.max(waiter.effective_priority.get(&*lock));
                }
            }
            MutexProtocol::None => {}
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }

    effective_priority
}

/// Raise the owner's effective priority for a thread about to join the wait
/// queue of an inheritance-protocol mutex. The boost propagates transitively
/// along the blocked-owner chain.
fn boost_owner_for_new_waiter<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    waiter_priority: Priority,
) {
    if mutex_cb.protocol != MutexProtocol::PriorityInheritance {
        return;
    }

    // The mutex is contended, so it must have an owner
    let owning_thread = mutex_cb.owning_thread.get(&*lock).unwrap();

    if owning_thread.effective_priority.get(&*lock) < waiter_priority {
        thread::update_effective_priority(lock, owning_thread, waiter_priority);
    }
}

/// Reevaluate the owner's effective priority after a change in the mutex's
/// wait queue (a waiter left, arrived with the ownership hand-off pending, or
/// changed its own priority).
fn reevaluate_owner_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    if mutex_cb.protocol != MutexProtocol::PriorityInheritance {
        return;
    }

    let Some(owning_thread) = mutex_cb.owning_thread.get(&*lock) else {
        return;
    };

    let base_priority = owning_thread.base_priority.get(&*lock);
    let effective_priority =
        evaluate_thread_effective_priority(lock.borrow_mut(), owning_thread, base_priority);

    // `update_effective_priority` recursively reevaluates the next mutex in
    // the blocked-owner chain, implementing transitive inheritance
    thread::update_effective_priority(lock, owning_thread, effective_priority);
}

/// Called by the wait machinery when a waiter is removed from the mutex's
/// wait queue without acquiring it (timed-out wait).
pub(crate) fn on_waiter_removed<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    reevaluate_owner_effective_priority(lock, mutex_cb);
}

/// Called when a thread blocked on the mutex had its effective priority
/// changed.
pub(crate) fn on_waiter_priority_changed<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) {
    reevaluate_owner_effective_priority(lock, mutex_cb);
}

/// Check if the specified mutex, which is currently held or waited for by a
/// thread, is compatible with the new thread base priority according to the
/// mutex's locking protocol.
///
/// The check is only needed when raising the priority.
#[inline]
pub(crate) fn does_mutex_allow_base_priority<Traits: KernelTraits>(
    _lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    !(mutex_cb.protocol == MutexProtocol::PriorityProtect && new_base_priority > mutex_cb.ceiling)
}

/// Check if the thread's held mutexes are all compatible with the new thread
/// base priority according to the mutexes's locking protocols.
///
/// The check is only needed when raising the priority.
#[inline]
pub(crate) fn do_held_mutexes_allow_base_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &ThreadCb<Traits>,
    new_base_priority: Priority,
) -> bool {
    let mut maybe_mutex_cb = thread.last_mutex_held.get(&*lock);
    while let Some(mutex_cb) = maybe_mutex_cb {
        if !does_mutex_allow_base_priority(lock.borrow_mut(), mutex_cb, new_base_priority) {
            return false;
        }

        maybe_mutex_cb = mutex_cb.prev_mutex_held.get(&*lock);
    }
    true
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, thread::SchedulingPolicy, wait, SetThreadPriorityError};

    /// Put an inert thread into `mutex_cb`'s wait list, performing the same
    /// state changes its own `lock` call would.
    fn block_thread_on_mutex<Traits: KernelTraits>(
        mutex_cb: &'static MutexCb<Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        assert!(mutex_cb.owning_thread.get(&*lock).is_some());
        let effective_priority = thread.effective_priority.get(&*lock);
        boost_owner_for_new_waiter(lock.borrow_mut(), mutex_cb, effective_priority);
        wait::start_wait_for_test(
            lock.borrow_mut(),
            thread,
            Some(&mutex_cb.wait_queue),
            ThreadSt::BlockedOnMutex,
            WaitPayload::Mutex(mutex_cb),
        );
    }

    /// Give the ownership of `mutex_cb` to an inert thread.
    fn give_mutex_to<Traits: KernelTraits>(
        mutex_cb: &'static MutexCb<Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        lock_core(mutex_cb, thread, lock.borrow_mut());
    }

    #[test]
    fn lock_unlock_roundtrip() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> = MutexCb::new(MutexKind::Normal, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        assert_eq!(MUTEX.is_locked(), Ok(false));
        MUTEX.lock().unwrap();
        assert_eq!(MUTEX.is_locked(), Ok(true));
        MUTEX.unlock().unwrap();
        assert_eq!(MUTEX.is_locked(), Ok(false));
    }

    #[test]
    fn relock_is_detected() {
        define_test_kernel!(SystemTraits);
        static NORMAL: MutexCb<SystemTraits> = MutexCb::new(MutexKind::Normal, MutexProtocol::None);
        static CHECKED: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::ErrorChecking, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        NORMAL.lock().unwrap();
        assert_eq!(NORMAL.lock(), Err(LockMutexError::Deadlock));

        CHECKED.lock().unwrap();
        assert_eq!(CHECKED.try_lock(), Err(TryLockMutexError::Deadlock));
    }

    #[test]
    fn recursive_lock_counts() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Recursive, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        MUTEX.lock().unwrap();
        MUTEX.lock().unwrap();
        MUTEX.try_lock().unwrap();

        MUTEX.unlock().unwrap();
        MUTEX.unlock().unwrap();
        assert_eq!(MUTEX.is_locked(), Ok(true));
        MUTEX.unlock().unwrap();
        assert_eq!(MUTEX.is_locked(), Ok(false));
    }

    #[test]
    fn unlock_usage_errors() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> = MutexCb::new(MutexKind::Normal, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        // Unlocking an unowned mutex
        assert_eq!(MUTEX.unlock(), Err(UnlockMutexError::OwnerDead));

        // Unlocking a mutex owned by another thread
        let other = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        give_mutex_to(&MUTEX, other);
        assert_eq!(MUTEX.unlock(), Err(UnlockMutexError::InvalidArgument));
    }

    #[test]
    fn try_lock_contended_is_busy() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> = MutexCb::new(MutexKind::Normal, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let other = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        give_mutex_to(&MUTEX, other);

        assert_eq!(MUTEX.try_lock(), Err(TryLockMutexError::Busy));
    }

    #[test]
    fn ceiling_boosts_and_restores() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> = MutexCb::with_ceiling(MutexKind::Normal, 250);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        MUTEX.lock().unwrap();
        assert_eq!(main.priority(), Ok(200));
        assert_eq!(main.effective_priority(), Ok(250));

        MUTEX.unlock().unwrap();
        assert_eq!(main.effective_priority(), Ok(200));
    }

    #[test]
    fn ceiling_violations() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> = MutexCb::with_ceiling(MutexKind::Normal, 100);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        // Locking with a base priority above the ceiling
        assert_eq!(MUTEX.lock(), Err(LockMutexError::InvalidArgument));

        // Raising the base priority above the ceiling of a held mutex
        main.set_priority(50, false).unwrap();
        MUTEX.lock().unwrap();
        assert_eq!(
            main.set_priority(150, false),
            Err(SetThreadPriorityError::InvalidArgument)
        );
        main.set_priority(100, false).unwrap();
    }

    #[test]
    fn priority_inheritance_boosts_owner() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Normal, MutexProtocol::PriorityInheritance);

        // The low-priority "L" thread of the classic inversion scenario is
        // the test thread itself
        let main = test_support::leak_thread(1, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        MUTEX.lock().unwrap();

        let high = test_support::leak_thread(5, SchedulingPolicy::Fifo);
        block_thread_on_mutex(&MUTEX, high);

        // L inherits H's priority until it unlocks
        assert_eq!(main.priority(), Ok(1));
        assert_eq!(main.effective_priority(), Ok(5));

        MUTEX.unlock().unwrap();
        assert_eq!(main.effective_priority(), Ok(1));

        // The ownership was handed to the highest-priority waiter
        let lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            MUTEX.owning_thread.get(&*lock).unwrap(),
            high
        ));
        assert_eq!(*high.st.read(&*lock), ThreadSt::Running);
    }

    #[test]
    fn priority_inheritance_is_transitive() {
        define_test_kernel!(SystemTraits);
        static INNER: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Normal, MutexProtocol::PriorityInheritance);
        static OUTER: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Normal, MutexProtocol::PriorityInheritance);

        let main = test_support::leak_thread(1, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        // main owns INNER; `middle` owns OUTER and is blocked on INNER
        INNER.lock().unwrap();
        let middle = test_support::leak_thread(3, SchedulingPolicy::Fifo);
        give_mutex_to(&OUTER, middle);
        block_thread_on_mutex(&INNER, middle);
        assert_eq!(main.effective_priority(), Ok(3));

        // A high-priority waiter on OUTER boosts `middle`, and the boost
        // propagates through INNER to main
        let high = test_support::leak_thread(9, SchedulingPolicy::Fifo);
        block_thread_on_mutex(&OUTER, high);
        assert_eq!(middle.effective_priority(), Ok(9));
        assert_eq!(main.effective_priority(), Ok(9));

        // Unlocking INNER hands it to `middle` and drops main's boost
        INNER.unlock().unwrap();
        assert_eq!(main.effective_priority(), Ok(1));
        assert_eq!(middle.effective_priority(), Ok(9));
    }

    #[test]
    fn timed_lock_times_out_without_taking_ownership() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Normal, MutexProtocol::PriorityInheritance);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let other = test_support::leak_thread(10, SchedulingPolicy::Fifo);
        give_mutex_to(&MUTEX, other);

        for _ in 0..4 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        assert_eq!(
            MUTEX.try_lock_for(crate::time::TickDuration::from_ticks(3)),
            Err(LockMutexTimeoutError::Timeout)
        );

        // Ownership was not taken, and the owner's boost was dropped when the
        // waiter left
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            MUTEX.owning_thread.get(&*lock.borrow_mut()).unwrap(),
            other
        ));
        assert!(MUTEX.wait_queue.is_empty(lock.borrow_mut()));
        drop(lock);
        assert_eq!(other.effective_priority(), Ok(10));
    }

    #[test]
    fn waiters_are_served_in_priority_order() {
        define_test_kernel!(SystemTraits);
        static MUTEX: MutexCb<SystemTraits> =
            MutexCb::new(MutexKind::Normal, MutexProtocol::None);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        MUTEX.lock().unwrap();

        // Block waiters in an order different from their priorities
        let waiters: Vec<_> = [40u8, 10, 30, 20, 50]
            .iter()
            .map(|&priority| {
                let thread =
                    test_support::leak_thread::<SystemTraits>(priority, SchedulingPolicy::Fifo);
                block_thread_on_mutex(&MUTEX, thread);
                thread
            })
            .collect();

        // main's unlock hands the mutex to the highest-priority waiter;
        // releasing on behalf of each inert owner drains the rest
        MUTEX.unlock().unwrap();

        let mut unblock_order = Vec::new();
        loop {
            let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
            let Some(owner) = MUTEX.owning_thread.get(&*lock.borrow_mut()) else {
                break;
            };
            unblock_order.push(owner.attr.priority);
            remove_from_held_chain(lock.borrow_mut(), owner, &MUTEX);
            unlock_mutex_unchecked(&MUTEX, lock.borrow_mut());
        }
        assert_eq!(unblock_order, vec![50, 40, 30, 20, 10]);

        let _ = waiters;
    }
}
