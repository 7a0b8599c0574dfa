//! Threads and the scheduler core
use core::{cell::UnsafeCell, convert::Infallible, fmt, ptr};

use elain::Align;

use crate::{
    cfg,
    error::{
        GetThreadPriorityError, JoinThreadError, ResultCode, SetThreadPriorityError, SleepError,
        StartThreadError, WaitError, WaitTimeoutError,
    },
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    mutex, signal, state,
    time::{TickDuration, TickInstant},
    timeout,
    utils::Init,
    wait::{self, WaitPayload},
    KernelTraits, PortThreading, Priority,
};

pub(crate) mod list;
use self::list::{ThreadList, ThreadListData};

/// How a thread shares the processor with equal-priority peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// The thread runs until it blocks or a higher-priority thread becomes
    /// runnable. Within a priority band, threads run in FIFO order.
    Fifo,

    /// As `Fifo`, but the thread is additionally rotated behind its
    /// equal-priority peers whenever its time slice
    /// ([`ROUND_ROBIN_QUANTUM`](crate::cfg::ROUND_ROBIN_QUANTUM) ticks)
    /// elapses.
    RoundRobin,
}

/// Thread state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The thread is not started yet.
    Dormant,

    /// The thread is ready to run and stored in the runnable list.
    Runnable,

    /// The thread is currently running.
    Running,

    /// The thread is sleeping (`sleep_for`/`sleep_until`).
    Sleeping,

    /// The thread is blocked in a semaphore's wait list.
    BlockedOnSemaphore,

    /// The thread is blocked in a mutex's wait list.
    BlockedOnMutex,

    /// The thread is blocked in a condition variable's wait list.
    BlockedOnConditionVariable,

    /// The thread is blocked in a synchronous signal wait.
    BlockedOnSignalWait,

    /// The thread is blocked joining another thread.
    BlockedOnJoin,

    /// The thread's entry function returned or the thread called
    /// [`exit_thread`].
    Terminated,
}

impl ThreadSt {
    /// Whether the state denotes a suspended wait that a waker can end.
    pub(crate) fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::Sleeping
                | Self::BlockedOnSemaphore
                | Self::BlockedOnMutex
                | Self::BlockedOnConditionVariable
                | Self::BlockedOnSignalWait
                | Self::BlockedOnJoin
        )
    }
}

/// Caller-provided storage for a thread's stack.
///
/// Placed in a `static` by the application and referenced by a
/// [`ThreadStack`]:
///
/// ```ignore
/// static STACK: StackStorage<4096> = StackStorage::new();
/// ```
#[repr(C)]
pub struct StackStorage<const N: usize> {
    _align: Align<{ cfg::STACK_ALIGN }>,
    storage: UnsafeCell<[u8; N]>,
}

// Safety: The contents are only accessed by the port while initializing or
// running the owning thread
unsafe impl<const N: usize> Sync for StackStorage<N> {}

impl<const N: usize> StackStorage<N> {
    pub const fn new() -> Self {
        Self {
            _align: Align::NEW,
            storage: UnsafeCell::new([0; N]),
        }
    }
}

impl<const N: usize> Default for StackStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread's stack region: caller-provided storage described by a base
/// pointer and a length.
pub struct ThreadStack {
    start: *mut u8,
    len: usize,
}

// Safety: `ThreadStack` only describes the region; accesses are the port's
// responsibility
unsafe impl Send for ThreadStack {}
unsafe impl Sync for ThreadStack {}

impl ThreadStack {
    /// Construct a `ThreadStack` referring to the given storage.
    pub const fn new<const N: usize>(storage: &'static StackStorage<N>) -> Self {
        Self {
            start: storage.storage.get() as *mut u8,
            len: N,
        }
    }

    /// Get the lowest address of the stack region.
    #[inline]
    pub const fn start(&self) -> *mut u8 {
        self.start
    }

    /// Get the size of the stack region in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the address one past the highest address of the stack region.
    /// This is where a full-descending stack starts.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.start.wrapping_add(self.len)
    }
}

impl fmt::Debug for ThreadStack {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadStack")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// The static properties of a thread.
pub struct ThreadAttr<Traits: PortThreading> {
    /// The entry point of the thread. Returning from it terminates the
    /// thread.
    pub entry_point: fn(usize),

    /// The parameter supplied for `entry_point`.
    pub entry_param: usize,

    /// The stack region for the thread.
    pub stack: ThreadStack,

    /// The initial base priority of the thread.
    pub priority: Priority,

    /// The scheduling policy of the thread.
    pub policy: SchedulingPolicy,

    /// The signals receiver for the thread. `None` if the thread does not
    /// receive signals.
    pub signals_receiver: Option<&'static signal::SignalsReceiverCb<Traits>>,
}

impl<Traits: PortThreading> fmt::Debug for ThreadAttr<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadAttr")
            .field("entry_point", &self.entry_point)
            .field("entry_param", &self.entry_param)
            .field("stack", &self.stack)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .finish()
    }
}

/// *Thread control block* - the state data of a thread.
#[repr(C)]
pub struct ThreadCb<Traits: PortThreading> {
    /// Port-specific state, holding the saved stack pointer of a suspended
    /// thread.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so that
    /// assembly code can refer to this easily.
    pub port_thread_state: Traits::PortThreadState,

    /// The static properties of the thread.
    pub attr: &'static ThreadAttr<Traits>,

    /// The thread's base priority.
    pub(crate) base_priority: CpuLockCell<Traits, Priority>,

    /// The thread's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by a mutex locking
    /// protocol.
    ///
    /// The effective priority determines the thread's position within the
    /// runnable list and within priority-ordered wait lists. After updating
    /// it for a thread that is in a list, the list must be re-sorted.
    pub(crate) effective_priority: CpuLockCell<Traits, Priority>,

    pub(crate) st: CpuLockCell<Traits, ThreadSt>,

    /// Intrusive links and the owning-list back-reference.
    pub(crate) list_data: ThreadListData<Traits>,

    /// The wait state of the thread.
    pub(crate) wait: wait::ThreadWait<Traits>,

    /// The last mutex locked by the thread, forming a singly-linked chain of
    /// all mutexes it currently holds.
    pub(crate) last_mutex_held: CpuLockCell<Traits, Option<&'static mutex::MutexCb<Traits>>>,

    /// The remaining ticks of the thread's round-robin time slice.
    pub(crate) round_robin_quantum: CpuLockCell<Traits, u32>,

    /// Threads blocked in [`ThreadCb::join`] waiting for this thread to
    /// terminate.
    pub(crate) join_wait_queue: ThreadList<Traits>,
}

impl<Traits: PortThreading> ThreadCb<Traits> {
    /// Construct a `ThreadCb` in the Dormant state.
    pub const fn new(attr: &'static ThreadAttr<Traits>) -> Self {
        Self {
            port_thread_state: Init::INIT,
            attr,
            base_priority: CpuLockCell::new(attr.priority),
            effective_priority: CpuLockCell::new(attr.priority),
            st: CpuLockCell::new(ThreadSt::Dormant),
            list_data: Init::INIT,
            wait: Init::INIT,
            last_mutex_held: CpuLockCell::new(None),
            round_robin_quantum: CpuLockCell::new(0),
            join_wait_queue: ThreadList::new(ThreadSt::BlockedOnJoin),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("port_thread_state", &self.port_thread_state)
            .field("attr", self.attr)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("list_data", &self.list_data)
            .field("wait", &self.wait)
            .field(
                "last_mutex_held",
                // Don't print the content of the mutex; that would recurse
                // back into this thread
                &self
                    .last_mutex_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("round_robin_quantum", &self.round_robin_quantum)
            .finish()
    }
}

impl<Traits: KernelTraits> ThreadCb<Traits> {
    /// Start the thread, transitioning it from Dormant into Runnable.
    ///
    /// May be called before [`PortToKernel::boot`] (to define the initial
    /// thread population) or at runtime from a thread context.
    ///
    /// [`PortToKernel::boot`]: crate::PortToKernel::boot
    pub fn start(&'static self) -> Result<(), StartThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        if *self.st.read(&*lock) != ThreadSt::Dormant {
            return Err(StartThreadError::BadObjectState);
        }

        // Safety: CPU Lock active, the thread is in the Dormant state
        unsafe { Traits::initialize_thread_state(self) };

        // Reset the scheduling state
        self.base_priority.replace(&mut *lock, self.attr.priority);
        self.effective_priority
            .replace(&mut *lock, self.attr.priority);
        self.round_robin_quantum
            .replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);

        // Associate the signals receiver with this thread
        if let Some(receiver) = self.attr.signals_receiver {
            receiver.set_owner(lock.borrow_mut(), self);
        }

        make_ready(lock.borrow_mut(), self);

        // If `self` has a higher priority, perform a context switch.
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }

    /// Block the current thread until this thread terminates.
    pub fn join(&'static self) -> Result<(), JoinThreadError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_waitable_context::<Traits>()?;

        let current = Traits::state().running_thread(lock.borrow_mut()).unwrap();
        if ptr::eq(current, self) {
            return Err(JoinThreadError::Deadlock);
        }

        match *self.st.read(&*lock) {
            ThreadSt::Dormant => return Err(JoinThreadError::BadObjectState),
            ThreadSt::Terminated => return Ok(()),
            _ => {}
        }

        match wait::wait_in_list(lock.borrow_mut(), &self.join_wait_queue, WaitPayload::Join) {
            Ok(()) => Ok(()),
            Err(WaitError::Interrupted) => unreachable!("join waits are not interruptible"),
        }
    }

    /// Get the thread's base priority.
    pub fn priority(&'static self) -> Result<Priority, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        if *self.st.read(&*lock) == ThreadSt::Dormant {
            Err(GetThreadPriorityError::BadObjectState)
        } else {
            Ok(self.base_priority.get(&*lock))
        }
    }

    /// Get the thread's effective priority (the base priority plus any boost
    /// applied by a mutex locking protocol).
    pub fn effective_priority(&'static self) -> Result<Priority, GetThreadPriorityError> {
        let lock = klock::lock_cpu::<Traits>()?;

        if *self.st.read(&*lock) == ThreadSt::Dormant {
            Err(GetThreadPriorityError::BadObjectState)
        } else {
            Ok(self.effective_priority.get(&*lock))
        }
    }

    /// Change the thread's base priority.
    ///
    /// If `preserve_round_robin` is `false`, the thread's remaining
    /// round-robin time slice is also reloaded.
    pub fn set_priority(
        &'static self,
        priority: Priority,
        preserve_round_robin: bool,
    ) -> Result<(), SetThreadPriorityError> {
        let mut lock = klock::lock_cpu::<Traits>()?;

        let st = *self.st.read(&*lock);
        if st == ThreadSt::Dormant || st == ThreadSt::Terminated {
            return Err(SetThreadPriorityError::BadObjectState);
        }

        if !preserve_round_robin {
            self.round_robin_quantum
                .replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);
        }

        let old_base_priority = self.base_priority.get(&*lock);
        if old_base_priority == priority {
            return Ok(());
        }

        // Fail with `InvalidArgument` if the operation would violate the
        // precondition of the locking protocol used in any of the held or
        // waited mutexes. This check is only needed when raising the
        // priority.
        if priority > old_base_priority {
            let waited_mutex = match wait::current_wait_payload(lock.borrow_mut(), self) {
                Some(WaitPayload::Mutex(mutex_cb)) => Some(mutex_cb),
                _ => None,
            };

            if let Some(waited_mutex) = waited_mutex {
                if !mutex::does_mutex_allow_base_priority(lock.borrow_mut(), waited_mutex, priority)
                {
                    return Err(SetThreadPriorityError::InvalidArgument);
                }
            }

            if !mutex::do_held_mutexes_allow_base_priority(lock.borrow_mut(), self, priority) {
                return Err(SetThreadPriorityError::InvalidArgument);
            }
        }

        self.base_priority.replace(&mut *lock, priority);

        // Recalculate the effective priority according to the locking
        // protocols of held mutexes, and reposition the thread
        let effective_priority =
            mutex::evaluate_thread_effective_priority(lock.borrow_mut(), self, priority);
        update_effective_priority(lock.borrow_mut(), self, effective_priority);

        // - If the thread is the currently running thread and the priority
        //   was lowered, it could be preempted by a Runnable thread.
        // - If the thread is Runnable and the priority was raised, it could
        //   preempt the currently running thread.
        unlock_cpu_and_check_preemption(lock);

        Ok(())
    }
}

/// Get the currently running thread.
pub fn current_thread<Traits: KernelTraits>() -> Result<&'static ThreadCb<Traits>, ResultCode> {
    if !Traits::is_thread_context() {
        return Err(ResultCode::BadContext);
    }

    let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
    Traits::state()
        .running_thread(lock.borrow_mut())
        .ok_or(ResultCode::BadObjectState)
}

/// Relinquish the processor, rotating the current thread behind its
/// equal-priority peers.
pub fn yield_now<Traits: KernelTraits>() -> Result<(), ResultCode> {
    if !Traits::is_thread_context() {
        return Err(ResultCode::BadContext);
    }

    let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    debug_assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    make_ready(lock.borrow_mut(), running_thread);

    drop(lock);

    // Safety: CPU Lock inactive
    unsafe { Traits::yield_cpu() };

    Ok(())
}

/// Block the current thread for the specified duration.
pub fn sleep_for<Traits: KernelTraits>(duration: TickDuration) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    sleep_inner(
        lock.borrow_mut(),
        timeout::Expiry::After(duration.as_ticks()),
    )
}

/// Block the current thread until the specified time point.
pub fn sleep_until<Traits: KernelTraits>(time_point: TickInstant) -> Result<(), SleepError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    state::expect_waitable_context::<Traits>()?;

    sleep_inner(lock.borrow_mut(), timeout::Expiry::At(time_point.as_ticks()))
}

fn sleep_inner<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    expiry: timeout::Expiry,
) -> Result<(), SleepError> {
    match wait::wait_no_list_timeout(lock, ThreadSt::Sleeping, WaitPayload::Sleep, expiry) {
        // A sleep only ever ends by its timeout firing
        Err(WaitTimeoutError::Timeout) => Ok(()),
        Err(WaitTimeoutError::Interrupted) => unreachable!("sleeps are not interruptible"),
        Ok(()) => unreachable!("nothing completes a sleep"),
    }
}

/// Terminate the current thread, transitioning it into the Terminated state.
///
/// The kernel (to be precise, the port) makes an implicit call to this
/// function when a thread entry point function returns.
///
/// Mutexes held by the thread are released as if by `unlock`, and all threads
/// joined on this thread are woken up.
pub fn exit_thread<Traits: KernelTraits>() -> Result<Infallible, ResultCode> {
    if !Traits::is_thread_context() {
        return Err(ResultCode::BadContext);
    }

    // If CPU Lock is inactive, activate it.
    let mut lock = unsafe {
        if !Traits::is_cpu_lock_active() {
            Traits::enter_cpu_lock();
        }
        klock::assume_cpu_lock::<Traits>()
    };

    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();

    // Release owned mutexes, waking up their next waiters (if any)
    mutex::abandon_held_mutexes(lock.borrow_mut(), running_thread);
    debug_assert!(running_thread.last_mutex_held.read(&*lock).is_none());

    // Wake up joined threads
    while let Some(joiner) = running_thread.join_wait_queue.first(lock.borrow_mut()) {
        wait::complete_wait(lock.borrow_mut(), joiner, Ok(()));
    }

    // Transition the current thread to Terminated
    assert_eq!(*running_thread.st.read(&*lock), ThreadSt::Running);
    running_thread.st.replace(&mut *lock, ThreadSt::Terminated);

    // Erase `running_thread`
    Traits::state().running_thread.replace(&mut *lock, None);

    core::mem::forget(lock);

    // Safety: (1) The caller of `exit_thread` acknowledges that all
    // preexisting data on the thread stack will be invalidated. (2) CPU Lock
    // active
    unsafe {
        Traits::exit_and_dispatch(running_thread);
    }
}

/// Transition the thread into the Runnable state, placing it at the back of
/// its priority band. This function doesn't do any proper cleanup for a
/// previous state.
pub(crate) fn make_ready<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
) {
    // Insert the thread to the runnable list; the list stamps `Runnable`
    Traits::state().runnable.insert(lock, thread);
}

/// Update the thread's effective priority, repositioning it in whatever list
/// holds it and propagating the change through the mutex locking protocols.
pub(crate) fn update_effective_priority<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: &'static ThreadCb<Traits>,
    effective_priority: Priority,
) {
    let old_effective_priority = thread
        .effective_priority
        .replace(&mut *lock, effective_priority);

    if old_effective_priority == effective_priority {
        return;
    }

    // Reposition the thread. The running thread is not stored in any list.
    if *thread.st.read(&*lock) != ThreadSt::Running {
        if let Some(owner) = list::owner_of(lock.borrow_mut(), thread) {
            owner.reorder(lock.borrow_mut(), thread);
        }
    }

    // If the thread is blocked on a priority-inheritance mutex, the owner's
    // boost must be reevaluated (transitive inheritance)
    if let Some(WaitPayload::Mutex(mutex_cb)) = wait::current_wait_payload(lock.borrow_mut(), thread)
    {
        mutex::on_waiter_priority_changed(lock.borrow_mut(), mutex_cb);
    }
}

/// Relinquish CPU Lock. After that, if there's a higher-priority thread than
/// the running thread, call `Port::yield_cpu`.
///
/// System services that transition a thread into the Runnable state should
/// call this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) {
    let prev_priority = Traits::state()
        .running_thread(lock.borrow_mut())
        .filter(|t| *t.st.read(&*lock) == ThreadSt::Running)
        .map(|t| t.effective_priority.get(&*lock));

    let has_preempting_thread = match (
        Traits::state().runnable.first(lock.borrow_mut()),
        prev_priority,
    ) {
        (Some(head), Some(prev)) => head.effective_priority.get(&*lock) > prev,
        (Some(_), None) => true,
        (None, _) => false,
    };

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_thread {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements [`PortToKernel::choose_running_thread`].
///
/// [`PortToKernel::choose_running_thread`]: crate::PortToKernel::choose_running_thread
#[inline]
pub(crate) fn choose_next_running_thread<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let prev_running_thread = Traits::state().running_thread(lock.borrow_mut());

    // The priority of the running thread, or `None` if there is no running
    // thread or it is no longer in the Running state (in which case we need
    // to elect a new thread to run even if no thread is schedulable)
    let prev_priority = prev_running_thread
        .filter(|t| *t.st.read(&*lock) == ThreadSt::Running)
        .map(|t| t.effective_priority.get(&*lock));

    // Decide the next thread to run
    let next_running_thread = match (
        Traits::state().runnable.first(lock.borrow_mut()),
        prev_priority,
    ) {
        (Some(head), Some(prev)) if head.effective_priority.get(&*lock) <= prev => {
            // There's no thread willing to take over the current one, and the
            // current one can still run
            return;
        }
        (None, Some(_)) => return,
        (head, _) => {
            debug_assert!(head.is_some() || prev_priority.is_none());
            Traits::state().runnable.pop_first(lock.borrow_mut())
        }
    };

    if let Some(next) = next_running_thread {
        // Transition `next` into the Running state
        next.st.replace(&mut *lock, ThreadSt::Running);

        if ptr_from_option_ref(prev_running_thread) == next as *const _ {
            // Skip the remaining steps if `next == prev_running_thread`
            return;
        }
    }

    // `prev_running_thread` now loses the control of the processor.
    if let Some(prev) = prev_running_thread {
        if *prev.st.read(&*lock) == ThreadSt::Running {
            // The thread was preempted while still runnable. A `Fifo` thread
            // keeps its turn (front of its priority band); a `RoundRobin`
            // thread's position is determined by its time slice, which is
            // handled in `round_robin_tick`, so mid-slice preemption keeps
            // its turn as well.
            Traits::state()
                .runnable
                .insert_front_of_band(lock.borrow_mut(), prev);
        }
        // Waiting/Runnable/Terminated threads stay where they are
    }

    Traits::state()
        .running_thread
        .replace(&mut *lock, next_running_thread);
}

/// Rotate the running thread's round-robin time slice. Called by the tick
/// handler after processing timeouts.
pub(crate) fn round_robin_tick<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let Some(running_thread) = Traits::state().running_thread(lock.borrow_mut()) else {
        return;
    };

    if *running_thread.st.read(&*lock) != ThreadSt::Running
        || running_thread.attr.policy != SchedulingPolicy::RoundRobin
    {
        return;
    }

    let quantum = running_thread.round_robin_quantum.write(&mut *lock);
    *quantum = quantum.saturating_sub(1);
    if *quantum > 0 {
        return;
    }

    // The time slice expired: reload it, and rotate the thread behind its
    // equal-priority peers if any other thread can run
    running_thread
        .round_robin_quantum
        .replace(&mut *lock, cfg::ROUND_ROBIN_QUANTUM);

    let head_priority = Traits::state()
        .runnable
        .first(lock.borrow_mut())
        .map(|t| t.effective_priority.get(&*lock));
    if let Some(head_priority) = head_priority {
        if head_priority >= running_thread.effective_priority.get(&*lock) {
            make_ready(lock.borrow_mut(), running_thread);
            // The caller (`handle_tick`) requests the context switch
        }
    }
}

/// Transition the currently running thread into the state already stored in
/// its control block and wait until a waker makes it Running again.
///
/// The current context must be waitable (this function doesn't check that).
pub(crate) fn wait_until_woken_up<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    debug_assert_eq!(state::expect_waitable_context::<Traits>(), Ok(()));

    let running_thread = Traits::state().running_thread(lock.borrow_mut()).unwrap();
    debug_assert!(running_thread.st.read(&*lock).is_blocked());

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`
        // Safety: (1) We don't access resources protected by CPU Lock.
        //         (2) We currently have CPU Lock.
        //         (3) We will re-acquire CPU Lock before returning from this
        //             function.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        // Re-acquire CPU Lock
        unsafe { Traits::enter_cpu_lock() };

        if *running_thread.st.read(&*lock) == ThreadSt::Running {
            break;
        }
    }
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
    use crate::{test_support, Kernel, KernelCfg};

    fn current_running<Traits: KernelTraits>() -> Option<&'static ThreadCb<Traits>> {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().running_thread(lock.borrow_mut())
    }

    #[test]
    fn highest_priority_thread_is_elected() {
        define_test_kernel!(SystemTraits);
        test_support::init_logger();

        let main = test_support::leak_thread::<SystemTraits>(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let low = test_support::leak_thread::<SystemTraits>(100, SchedulingPolicy::Fifo);
        let mid = test_support::leak_thread::<SystemTraits>(150, SchedulingPolicy::Fifo);
        low.start().unwrap();
        mid.start().unwrap();

        // main outranks both, so it keeps running; the runnable list leads
        // with the higher of the two
        assert!(core::ptr::eq(current_running::<SystemTraits>().unwrap(), main));
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            SystemTraits::state().runnable.first(lock.borrow_mut()).unwrap(),
            mid
        ));
    }

    #[test]
    fn start_of_higher_priority_thread_preempts() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let peer = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        peer.start().unwrap();

        let high = test_support::leak_thread::<SystemTraits>(10, SchedulingPolicy::Fifo);
        high.start().unwrap();

        // `high` took over; the preempted `main` kept the front of its band
        assert!(core::ptr::eq(current_running::<SystemTraits>().unwrap(), high));
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            SystemTraits::state().runnable.first(lock.borrow_mut()).unwrap(),
            main
        ));
    }

    #[test]
    fn round_robin_rotates_on_tick() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::RoundRobin);
        test_support::adopt_main::<SystemTraits>(main);

        let t1 = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::RoundRobin);
        let t2 = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::RoundRobin);
        let t3 = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::RoundRobin);
        t1.start().unwrap();
        t2.start().unwrap();
        t3.start().unwrap();

        let band = [main, t1, t2, t3];

        // With a one-tick time slice, each tick hands the processor to the
        // next thread of the band, round-robin
        let mut schedule = Vec::new();
        for _ in 0..8 {
            SystemTraits::tick();
            let running = current_running::<SystemTraits>().unwrap();
            schedule.push(
                band.iter()
                    .position(|t| core::ptr::eq(*t, running))
                    .unwrap(),
            );
        }
        log::debug!("observed schedule: {schedule:?}");
        assert_eq!(schedule, vec![1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn fifo_threads_are_not_time_sliced() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let peer = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        peer.start().unwrap();

        for _ in 0..3 {
            SystemTraits::tick();
            assert!(core::ptr::eq(current_running::<SystemTraits>().unwrap(), main));
        }
    }

    #[test]
    fn yield_rotates_behind_equal_priority_peers() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let peer = test_support::leak_thread::<SystemTraits>(5, SchedulingPolicy::Fifo);
        peer.start().unwrap();

        yield_now::<SystemTraits>().unwrap();

        assert!(core::ptr::eq(current_running::<SystemTraits>().unwrap(), peer));
        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            SystemTraits::state().runnable.first(lock.borrow_mut()).unwrap(),
            main
        ));
    }

    #[test]
    fn sleep_for_elapses_after_duration_plus_one() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        for _ in 0..4 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        sleep_for::<SystemTraits>(TickDuration::from_ticks(3)).unwrap();

        assert_eq!(
            SystemTraits::now().unwrap(),
            TickInstant::from_ticks(4)
        );
    }

    #[test]
    fn sleep_until_elapses_at_time_point() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        for _ in 0..6 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        sleep_until::<SystemTraits>(TickInstant::from_ticks(6)).unwrap();

        assert_eq!(
            SystemTraits::now().unwrap(),
            TickInstant::from_ticks(6)
        );
    }

    #[test]
    fn set_priority_repositions_runnable_thread() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let t1 = test_support::leak_thread::<SystemTraits>(10, SchedulingPolicy::Fifo);
        let t2 = test_support::leak_thread::<SystemTraits>(20, SchedulingPolicy::Fifo);
        t1.start().unwrap();
        t2.start().unwrap();

        t1.set_priority(30, false).unwrap();
        assert_eq!(t1.priority(), Ok(30));

        let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
        assert!(core::ptr::eq(
            SystemTraits::state().runnable.first(lock.borrow_mut()).unwrap(),
            t1
        ));
    }

    #[test]
    fn lifecycle_errors() {
        define_test_kernel!(SystemTraits);

        let main = test_support::leak_thread::<SystemTraits>(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        // Starting a started thread
        assert_eq!(main.start(), Err(StartThreadError::BadObjectState));

        // Joining self
        assert_eq!(main.join(), Err(JoinThreadError::Deadlock));

        // Joining a thread that was never started
        let dormant = test_support::leak_thread::<SystemTraits>(10, SchedulingPolicy::Fifo);
        assert_eq!(dormant.join(), Err(JoinThreadError::BadObjectState));
        assert_eq!(
            dormant.priority(),
            Err(GetThreadPriorityError::BadObjectState)
        );

        // Joining a terminated thread completes immediately
        let finished = test_support::leak_thread::<SystemTraits>(10, SchedulingPolicy::Fifo);
        {
            let mut lock = klock::lock_cpu::<SystemTraits>().unwrap();
            finished.st.replace(&mut *lock.borrow_mut(), ThreadSt::Terminated);
        }
        assert_eq!(finished.join(), Ok(()));
    }
}
