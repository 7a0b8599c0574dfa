//! Wait machinery shared by all blocking primitives
//!
//! A blocking operation records *what* the current thread is waiting on (a
//! [`WaitPayload`]) in the thread control block, splices the thread into the
//! primitive's blocked [`ThreadList`] (or, for list-less waits such as sleep,
//! just stamps the state), and suspends until a waker resumes it. The waker
//! stores the wake reason in the control block before making the thread
//! Runnable; the resumed thread returns that reason to its caller.
//!
//! Timed waits additionally register a stack-pinned [`timeout::Timeout`]
//! whose callback cancels the wait with [`WaitTimeoutError::Timeout`],
//! rolling back the side effect the wait had on the primitive (e.g., the
//! semaphore value decrement).
use core::fmt;

use crate::{
    error::{expect_not_timeout, BadObjectStateError, WaitError, WaitTimeoutError},
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, semaphore, thread,
    thread::{
        list::{self, ThreadList},
        ThreadCb, ThreadSt,
    },
    timeout,
    utils::Init,
    KernelTraits, PortThreading,
};

/// What a waiting thread is waiting on. Wakers use this to roll back the
/// wait's side effects when a wait is cancelled.
pub(crate) enum WaitPayload<Traits: PortThreading> {
    Semaphore(&'static semaphore::SemaphoreCb<Traits>),
    Mutex(&'static mutex::MutexCb<Traits>),
    ConditionVariable,
    SignalWait,
    Join,
    Sleep,
}

impl<Traits: PortThreading> Clone for WaitPayload<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for WaitPayload<Traits> {}

impl<Traits: PortThreading> fmt::Debug for WaitPayload<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Semaphore(semaphore) => write!(f, "Semaphore({semaphore:p})"),
            Self::Mutex(mutex) => write!(f, "Mutex({mutex:p})"),
            Self::ConditionVariable => f.write_str("ConditionVariable"),
            Self::SignalWait => f.write_str("SignalWait"),
            Self::Join => f.write_str("Join"),
            Self::Sleep => f.write_str("Sleep"),
        }
    }
}

/// The wait state of a thread.
pub(crate) struct ThreadWait<Traits: PortThreading> {
    /// The payload describing the ongoing wait operation. `None` iff the
    /// thread is not waiting.
    current_wait: CpuLockCell<Traits, Option<WaitPayload<Traits>>>,

    /// The result of the last wait operation. Set by a waker. Returned by
    /// the `wait_*` functions.
    wait_result: CpuLockCell<Traits, Result<(), WaitTimeoutError>>,
}

impl<Traits: PortThreading> Init for ThreadWait<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current_wait: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
    };
}

impl<Traits: PortThreading> fmt::Debug for ThreadWait<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadWait")
            .field("current_wait", &self.current_wait)
            .field(
                "wait_result",
                &self.wait_result.debug_fmt_with(|x, f| x.fmt(f)),
            )
            .finish()
    }
}

/// Where a wait operation parks the current thread.
enum WaitTarget<Traits: PortThreading> {
    /// A primitive's blocked list. The list's tag determines the thread
    /// state.
    List(&'static ThreadList<Traits>),

    /// No list; the thread state is set directly. Such a wait can only end by
    /// [`interrupt_thread`] (used by the timeout callback).
    OutOfList(ThreadSt),
}

/// Register a timeout object to cancel the current thread's wait at
/// `$expiry`. The timeout object remains valid throughout the current lexical
/// scope.
///
/// This macro is used inside a blocking operation with timeout.
macro_rules! setup_timeout_wait {
    ($lock:ident, $thread:expr, $expiry:expr) => {
        // Create a timeout object on the waiting thread's stack.
        let timeout = core::pin::pin!(new_timeout_object_for_thread(
            $lock.borrow_mut(),
            $thread,
            $expiry
        ));

        // Use `TimeoutGuard` to automatically unregister the timeout when
        // leaving the current lexical scope.
        let mut timeout_guard = timeout::TimeoutGuard {
            timeout: timeout.as_ref(),
            lock: $lock,
        };
        let mut $lock = timeout_guard.lock.borrow_mut();

        // Register the timeout object
        timeout::insert_timeout($lock.borrow_mut(), timeout_guard.timeout);
    };
}

/// Transition the current thread into the state named by `queue`'s tag and
/// wait until a waker resumes it.
///
/// The current context must be waitable (this function doesn't check that).
/// The caller should use `expect_waitable_context` to do that.
#[inline]
pub(crate) fn wait_in_list<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static ThreadList<Traits>,
    payload: WaitPayload<Traits>,
) -> Result<(), WaitError> {
    wait_inner(lock, WaitTarget::List(queue), payload).map_err(expect_not_timeout)
}

/// [`wait_in_list`] with a timeout.
#[inline]
pub(crate) fn wait_in_list_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &'static ThreadList<Traits>,
    payload: WaitPayload<Traits>,
    expiry: timeout::Expiry,
) -> Result<(), WaitTimeoutError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    // Configure a timeout
    setup_timeout_wait!(lock, thread, expiry);

    wait_inner(lock, WaitTarget::List(queue), payload)
}

/// Transition the current thread into `st` without joining any wait list, and
/// wait until the wait is cancelled by [`interrupt_thread`].
///
/// The current context must be waitable (this function doesn't check that).
#[inline]
#[allow(dead_code)]
pub(crate) fn wait_no_list<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    st: ThreadSt,
    payload: WaitPayload<Traits>,
) -> Result<(), WaitError> {
    wait_inner(lock, WaitTarget::OutOfList(st), payload).map_err(expect_not_timeout)
}

/// [`wait_no_list`] with a timeout. This is the substrate of `sleep_for` and
/// `sleep_until`.
#[inline]
pub(crate) fn wait_no_list_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    st: ThreadSt,
    payload: WaitPayload<Traits>,
    expiry: timeout::Expiry,
) -> Result<(), WaitTimeoutError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    // Configure a timeout
    setup_timeout_wait!(lock, thread, expiry);

    wait_inner(lock, WaitTarget::OutOfList(st), payload)
}

/// The core portion of the `wait_*` functions.
fn wait_inner<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    target: WaitTarget<Traits>,
    payload: WaitPayload<Traits>,
) -> Result<(), WaitTimeoutError> {
    let thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    debug_assert_eq!(*thread.st.read(&*lock), ThreadSt::Running);
    debug_assert!(thread.wait.current_wait.read(&*lock).is_none());

    thread.wait.current_wait.replace(&mut *lock, Some(payload));

    match target {
        WaitTarget::List(queue) => {
            // The list stamps the thread state
            queue.insert(lock.borrow_mut(), thread);
        }
        WaitTarget::OutOfList(st) => {
            debug_assert!(st.is_blocked());
            thread.st.replace(&mut *lock, st);
        }
    }

    // This statement will complete when the thread is woken up
    thread::wait_until_woken_up(lock.borrow_mut());

    // A waker should have detached the thread from the wait
    debug_assert!(thread.wait.current_wait.get(&*lock).is_none());
    debug_assert!(thread.list_data.owner.get(&*lock).is_none());

    // Return the wait result stored by the waker
    thread.wait.wait_result.get(&*lock)
}

/// Get the payload of the specified thread's ongoing wait operation, if any.
pub(crate) fn current_wait_payload<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &ThreadCb<Traits>,
) -> Option<WaitPayload<Traits>> {
    thread.wait.current_wait.get(&*lock)
}

/// End the specified thread's wait with the result `wait_result`, detaching
/// it from its wait list (if any) and making it Runnable.
///
/// This is the success path: the side effects of the wait operation are
/// considered transferred (e.g., a semaphore permit was handed to the woken
/// thread), so nothing is rolled back.
///
/// This function may make a thread Runnable, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn complete_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) {
    let payload = thread.wait.current_wait.replace(&mut *lock, None);
    debug_assert!(payload.is_some());
    debug_assert!(thread.st.read(&*lock).is_blocked());

    if let Some(queue) = list::owner_of(lock.borrow_mut(), thread) {
        queue.remove(lock.borrow_mut(), thread);
    }

    thread.wait.wait_result.replace(&mut *lock, wait_result);

    // Make the thread Runnable
    thread::make_ready(lock, thread);
}

/// Cancel any ongoing wait operation of the thread, rolling back the side
/// effect the wait had on the primitive.
///
/// Returns `Err(BadObjectState)` if the thread is not waiting.
///
/// This function may make a thread Runnable, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` as needed.
pub(crate) fn interrupt_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    wait_result: Result<(), WaitTimeoutError>,
) -> Result<(), BadObjectStateError> {
    let Some(payload) = thread.wait.current_wait.get(&*lock) else {
        return Err(BadObjectStateError::BadObjectState);
    };

    // Undo the effect the wait operation had on the primitive. The wait is
    // being cancelled, so the thread must not consume anything.
    if let WaitPayload::Semaphore(semaphore_cb) = payload {
        semaphore::restore_value(lock.borrow_mut(), semaphore_cb);
    }

    complete_wait(lock.borrow_mut(), thread, wait_result);

    // With the waiter gone, the owner of an inheritance-protocol mutex may
    // lose its boost
    if let WaitPayload::Mutex(mutex_cb) = payload {
        mutex::on_waiter_removed(lock.borrow_mut(), mutex_cb);
    }

    Ok(())
}

/// Put a thread that is not actually executing into a wait state, for tests
/// that need populated wait lists without real context switching. Mirrors
/// the state transitions of [`wait_inner`] for a non-running thread.
#[cfg(test)]
pub(crate) fn start_wait_for_test<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    queue: Option<&'static ThreadList<Traits>>,
    st: ThreadSt,
    payload: WaitPayload<Traits>,
) {
    // Detach the thread from the runnable list first, as if it had been
    // running and called a blocking operation
    if let Some(owner) = list::owner_of(lock.borrow_mut(), thread) {
        owner.remove(lock.borrow_mut(), thread);
    }

    thread.wait.current_wait.replace(&mut *lock, Some(payload));

    match queue {
        Some(queue) => queue.insert(lock.borrow_mut(), thread),
        None => {
            thread.st.replace(&mut *lock, st);
        }
    }
}

/// Read back the wait result a waker stored for `thread`.
#[cfg(test)]
pub(crate) fn wait_result_for_test<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &ThreadCb<Traits>,
) -> Result<(), WaitTimeoutError> {
    thread.wait.wait_result.get(&*lock)
}

/// Construct a [`timeout::Timeout`] that cancels the specified thread's wait
/// with [`WaitTimeoutError::Timeout`] when it expires.
fn new_timeout_object_for_thread<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    expiry: timeout::Expiry,
) -> timeout::Timeout<Traits> {
    // Construct a `Timeout`, supplying our callback function
    let param = thread as *const _ as usize;

    /// The callback function
    fn interrupt_thread_by_timeout<Traits: KernelTraits>(
        param: usize,
        mut lock: CpuLockGuard<Traits>,
    ) -> CpuLockGuard<Traits> {
        // Safety: We are just converting `param` back to the original form
        let thread = unsafe { &*(param as *const ThreadCb<Traits>) };

        // Cancel the wait
        match interrupt_thread(
            lock.borrow_mut(),
            thread,
            Err(WaitTimeoutError::Timeout),
        ) {
            // Even if the thread is already unblocked, we don't care
            Ok(()) | Err(BadObjectStateError::BadObjectState) => {}
        }

        lock
    }

    let timeout_object = timeout::Timeout::new(interrupt_thread_by_timeout, param);

    // Configure the expiration time
    timeout_object.set_expiry(lock, expiry);

    timeout_object
}
