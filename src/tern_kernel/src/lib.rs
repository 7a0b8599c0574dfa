//! The Tern RTOS kernel
//!
//! Tern is a preemptive real-time kernel for single-core microcontrollers.
//! Threads are scheduled by fixed priority (0-255, higher wins) with
//! round-robin time slicing among equal-priority `RoundRobin` threads. The
//! counting [semaphore](SemaphoreCb) is the universal blocking primitive;
//! [mutexes](MutexCb) (with priority-inheritance and priority-ceiling
//! protocols), [condition variables](ConditionVariableCb), and
//! [FIFO](RawFifoQueue)/[message](RawMessageQueue) queues are built over the
//! same wait machinery. Each thread can own a [signals
//! receiver](SignalsReceiverCb) providing POSIX-style signal generation,
//! queuing, synchronous waits, and asynchronous handler delivery.
//!
//! # Kernel objects
//!
//! The kernel allocates no memory. Every kernel object is a control block
//! (`…Cb`) placed in caller-provided `'static` storage and parameterized by a
//! *system type* implementing the port traits. A port (the
//! architecture-specific layer) implements [`PortThreading`] for the system
//! type and drives the kernel through [`PortToKernel`].
//!
//! # Contexts
//!
//! Kernel services classify the calling context:
//!
//!  - *Thread context*: executing a thread's code. All operations are allowed.
//!  - *Interrupt context*: executing an interrupt handler. Only non-blocking
//!    operations are allowed ([`SemaphoreCb::post`], [`generate_signal`],
//!    [`queue_signal`], the `try_*` flavors); blocking ones return
//!    `BadContext`.
//!
//! A *waitable* context is a thread context in which blocking is permitted.
#![cfg_attr(not(test), no_std)]

pub mod utils;

#[cfg(test)]
#[macro_use]
mod test_support;

pub mod cfg;
mod condvar;
mod error;
mod klock;
mod msgqueue;
mod mutex;
mod queue;
mod semaphore;
mod signal;
mod state;
mod thread;
pub mod time;
mod timeout;
mod timer;
mod wait;

pub use self::{
    condvar::*, error::*, msgqueue::*, mutex::*, queue::*, semaphore::*, signal::*, thread::*,
    timeout::{TimeoutRef, TimeoutStorage}, timer::*,
};

use core::{fmt, mem::forget};

use crate::{
    klock::CpuLockCell,
    thread::{list::ThreadList, ThreadCb, ThreadSt},
    utils::Init,
};

/// Scheduling priority of a thread. `0` is the lowest priority; `255` is the
/// highest.
pub type Priority = u8;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-thread state, holding the saved stack pointer of a
    /// suspended thread. This is the first field of [`ThreadCb`] so that
    /// assembly code can refer to it easily.
    type PortThreadState: Send + Sync + Init + fmt::Debug + 'static;

    /// The default stack size for threads.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// The alignment requirement for thread stack regions.
    const STACK_ALIGN: usize = cfg::STACK_ALIGN;

    /// Transfer the control to the first scheduled thread, discarding the
    /// current (startup) context.
    ///
    /// Precondition: CPU Lock active, Startup phase
    unsafe fn dispatch_first_thread() -> !;

    /// Yield the processor.
    ///
    /// In a thread context, this method immediately transfers the control to
    /// a dispatcher. The dispatcher should call
    /// [`PortToKernel::choose_running_thread`] to find the next thread to run
    /// and transfer the control to that thread.
    ///
    /// In an interrupt context, the effect of this method will be deferred
    /// until the processor completes the execution of all active interrupt
    /// handlers (e.g., by pending the lowest-priority exception).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running thread (`thread`, which
    /// was already transitioned out of the Running state) and proceed to the
    /// dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(thread: &'static ThreadCb<Self>) -> !;

    /// Disable all kernel-managed interrupts (this state is called *CPU
    /// Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Prepare the thread for execution. More specifically, store an initial
    /// context in the thread's stack region so that the thread will enter
    /// `attr.entry(attr.param)` next time it receives the control. Ports are
    /// encouraged to fill callee-saved registers with sentinel values for
    /// debuggability.
    ///
    /// Precondition: CPU Lock active, the thread is in the Dormant state
    unsafe fn initialize_thread_state(thread: &'static ThreadCb<Self>);

    /// Arrange for `func` to be executed on `thread` before the thread's own
    /// code resumes, the next time `thread` returns to thread mode. Used by
    /// the signal subsystem to deliver asynchronous signal handlers.
    ///
    /// Precondition: CPU Lock active, the thread is not Dormant
    unsafe fn request_function_execution(thread: &'static ThreadCb<Self>, func: fn());

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a thread
    /// context.
    fn is_thread_context() -> bool;
}

/// Represents the group of traits a port should implement.
pub trait Port: PortThreading {}

impl<T: PortThreading> Port for T {}

/// Associates a system type with kernel-private data. A port (or an
/// application's system-type definition) implements this to provide the
/// kernel's global state storage.
///
/// # Safety
///
/// `state()` must return the same instance for every call.
pub unsafe trait KernelCfg: Port + Sized + 'static {
    /// The storage for the timeout heap. Its capacity bounds the number of
    /// concurrently outstanding timed operations and software timers.
    type TimeoutHeap: timeout::TimeoutStorage<Self> + fmt::Debug + Init + 'static;

    /// Access the kernel's global state.
    fn state() -> &'static State<Self>;
}

/// The complete set of traits implemented by a usable system type.
pub trait KernelTraits: Port + KernelCfg + 'static {}

impl<T: Port + KernelCfg + 'static> KernelTraits for T {}

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Start scheduling.
    ///
    /// Should be called exactly once by the port after the application has
    /// started at least one thread. Elects the first running thread and jumps
    /// into [`PortThreading::dispatch_first_thread`].
    ///
    /// Precondition: CPU Lock active, Startup phase
    unsafe fn boot() -> !;

    /// Determine the next thread to run and make it the running thread.
    /// Called by the port's dispatcher between saving the outgoing thread's
    /// context and restoring the incoming one's.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_thread();

    /// Called by the port's timebase driver to announce a new tick.
    ///
    /// Advances the tick count, expires timed events, and performs
    /// round-robin rotation. A context switch, if one became necessary, is
    /// requested through [`PortThreading::yield_cpu`] before this method
    /// returns.
    ///
    /// Precondition: CPU Lock inactive, an interrupt context
    unsafe fn timer_tick();
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Choose the first running thread
        thread::choose_next_running_thread(lock.borrow_mut());

        // Post-condition: CPU Lock active
        forget(lock);

        // Safety: CPU Lock is active, Startup phase
        unsafe { Traits::dispatch_first_thread() }
    }

    unsafe fn choose_running_thread() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        thread::choose_next_running_thread(lock.borrow_mut());

        // Post-condition: CPU Lock active
        forget(lock);
    }

    unsafe fn timer_tick() {
        timeout::handle_tick::<Traits>();
    }
}

/// Global kernel state.
pub struct State<Traits: KernelCfg> {
    /// The currently running thread. `None` during the startup phase and
    /// whenever no thread is schedulable (the port idles in that case).
    /// The running thread is *not* stored in `runnable`.
    running_thread: CpuLockCell<Traits, Option<&'static ThreadCb<Traits>>>,

    /// The list of Runnable threads, sorted by descending effective priority,
    /// FIFO within equal priority.
    runnable: ThreadList<Traits>,

    /// The global state of the timekeeping system, including the 64-bit
    /// monotonic tick count.
    timeout: timeout::TimeoutGlobals<Traits, Traits::TimeoutHeap>,
}

impl<Traits: KernelCfg> Init for State<Traits> {
    const INIT: Self = Self {
        running_thread: Init::INIT,
        runnable: ThreadList::new(ThreadSt::Runnable),
        timeout: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for State<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("State")
            .field(
                "running_thread",
                &self
                    .running_thread
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .field("runnable", &self.runnable)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<Traits: KernelCfg> State<Traits> {
    /// Get the currently running thread.
    pub(crate) fn running_thread(
        &self,
        lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static ThreadCb<Traits>> {
        self.running_thread.get(&*lock)
    }
}

/// Provides access to the global API functions exposed by the kernel.
///
/// This trait is automatically implemented on system types that have
/// sufficient trait `impl`s to instantiate the kernel.
pub trait Kernel: KernelTraits {
    /// Activate CPU Lock (the interrupt-masking critical section).
    ///
    /// Returns `BadContext` if CPU Lock is already active.
    fn acquire_cpu_lock() -> Result<(), ResultCode>;

    /// Deactivate CPU Lock.
    ///
    /// # Safety
    ///
    /// CPU Lock is useful for creating a critical section. By making this
    /// method `unsafe`, safe code is prevented from interfering with a
    /// critical section.
    unsafe fn release_cpu_lock() -> Result<(), ResultCode>;

    /// Return a flag indicating whether CPU Lock is currently active.
    fn has_cpu_lock() -> bool;

    /// Read the current tick count.
    ///
    /// The tick count is 64 bits wide; reading it atomically requires CPU
    /// Lock, so this method will return `BadContext` when CPU Lock is already
    /// active.
    fn now() -> Result<time::TickInstant, ResultCode>;

    /// Read the system time as microseconds since boot, derived from the
    /// tick count and [`cfg::TICK_RATE_HZ`].
    #[cfg(feature = "system_time")]
    fn system_time() -> Result<u64, ResultCode>;
}

impl<Traits: KernelTraits> Kernel for Traits {
    fn acquire_cpu_lock() -> Result<(), ResultCode> {
        if Traits::is_cpu_lock_active() {
            Err(ResultCode::BadContext)
        } else {
            // Safety: CPU Lock inactive
            unsafe { Traits::enter_cpu_lock() };
            Ok(())
        }
    }

    unsafe fn release_cpu_lock() -> Result<(), ResultCode> {
        if !Traits::is_cpu_lock_active() {
            Err(ResultCode::BadContext)
        } else {
            // Safety: CPU Lock active
            unsafe { Traits::leave_cpu_lock() };
            Ok(())
        }
    }

    fn has_cpu_lock() -> bool {
        Traits::is_cpu_lock_active()
    }

    fn now() -> Result<time::TickInstant, ResultCode> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
        Ok(timeout::current_time::<Traits>(lock.borrow_mut()))
    }

    #[cfg(feature = "system_time")]
    fn system_time() -> Result<u64, ResultCode> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
        let ticks = timeout::current_time::<Traits>(lock.borrow_mut()).as_ticks() as u128;
        Ok((ticks * 1_000_000 / cfg::TICK_RATE_HZ as u128) as u64)
    }
}
