//! Test harness: a mock port and per-test kernel instances
//!
//! Each test invokes [`define_test_kernel!`] inside its own function body,
//! which instantiates a fresh system type with its own kernel state. The mock
//! port doesn't perform real context switching: the test function *is* the
//! running thread. `yield_cpu` instead drains a queue of simulated interrupt
//! actions (tick announcements, ISR-side posts, signal generation) and then
//! runs the scheduler, so genuine block-until-woken scenarios execute on the
//! host: the test thread blocks, a queued "interrupt" wakes it, and the wait
//! loop observes the wakeup.
//!
//! Threads other than the test thread are inert control blocks. Tests put
//! them into wait lists through the wait module's test hooks and observe
//! scheduling decisions through the kernel state.
use core::fmt;

use crate::{
    utils::Init, KernelTraits, PortToKernel, Priority, SchedulingPolicy, SignalsReceiverCb,
    StackStorage, ThreadAttr, ThreadCb, ThreadStack,
};

/// The mock port's per-thread state. The harness never saves real contexts,
/// so this is empty.
pub(crate) struct TestThreadState;

impl Init for TestThreadState {
    const INIT: Self = Self;
}

impl fmt::Debug for TestThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("TestThreadState")
    }
}

/// The queue of simulated interrupt actions, drained at every preemption
/// point.
pub(crate) type InterruptActions = std::sync::Mutex<Vec<fn()>>;

/// The mock port's `yield_cpu`: fire the simulated interrupts, then
/// dispatch.
pub(crate) fn process_yield<Traits: KernelTraits>(actions: &InterruptActions) {
    // Simulated interrupts fire at the preemption point, with CPU Lock
    // inactive, exactly like hardware interrupts would
    loop {
        let action = {
            let mut actions = actions.lock().unwrap();
            if actions.is_empty() {
                None
            } else {
                Some(actions.remove(0))
            }
        };
        match action {
            Some(action) => action(),
            None => break,
        }
    }

    // Safety: `yield_cpu`'s precondition is CPU Lock inactive
    unsafe {
        Traits::enter_cpu_lock();
        <Traits as PortToKernel>::choose_running_thread();
        Traits::leave_cpu_lock();
    }
}

/// Create a thread control block with leaked `'static` storage.
pub(crate) fn leak_thread<Traits: KernelTraits>(
    priority: Priority,
    policy: SchedulingPolicy,
) -> &'static ThreadCb<Traits> {
    leak_thread_with_receiver(priority, policy, None)
}

pub(crate) fn leak_thread_with_receiver<Traits: KernelTraits>(
    priority: Priority,
    policy: SchedulingPolicy,
    signals_receiver: Option<&'static SignalsReceiverCb<Traits>>,
) -> &'static ThreadCb<Traits> {
    let stack: &'static StackStorage<256> = Box::leak(Box::new(StackStorage::new()));
    let attr = Box::leak(Box::new(ThreadAttr {
        entry_point: |_| {},
        entry_param: 0,
        stack: ThreadStack::new(stack),
        priority,
        policy,
        signals_receiver,
    }));
    Box::leak(Box::new(ThreadCb::new(attr)))
}

/// Start `thread` and elect it as the running thread, adopting the test
/// function's own execution as that thread's context.
///
/// The thread must have the highest priority of all started threads.
pub(crate) fn adopt_main<Traits: KernelTraits>(thread: &'static ThreadCb<Traits>) {
    thread.start().unwrap();

    // Safety: Mirrors what the port does in `boot`
    unsafe {
        Traits::enter_cpu_lock();
        <Traits as PortToKernel>::choose_running_thread();
        Traits::leave_cpu_lock();
    }

    assert!(core::ptr::eq(
        crate::current_thread::<Traits>().unwrap(),
        thread
    ));
}

pub(crate) fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Instantiate a fresh system type with its own kernel state and mock port.
///
/// The expansion provides these inherent associated functions:
///
///  - `$Traits::queue_interrupt(f)` - enqueue a simulated interrupt action to
///    fire at the next preemption point
///  - `$Traits::run_interrupts()` - fire all queued actions immediately
///    (including function-execution requests made by the signal subsystem)
///  - `$Traits::tick()` - announce one tick, as the port's timebase driver
///    would
macro_rules! define_test_kernel {
    ($Traits:ident) => {
        struct $Traits;

        static KERNEL_STATE: $crate::State<$Traits> =
            <$crate::State<$Traits> as $crate::utils::Init>::INIT;
        static CPU_LOCK: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
        static INTERRUPT_ACTIONS: $crate::test_support::InterruptActions =
            std::sync::Mutex::new(Vec::new());

        unsafe impl $crate::PortThreading for $Traits {
            type PortThreadState = $crate::test_support::TestThreadState;

            unsafe fn dispatch_first_thread() -> ! {
                unreachable!("the test harness never dispatches for real")
            }

            unsafe fn yield_cpu() {
                $crate::test_support::process_yield::<$Traits>(&INTERRUPT_ACTIONS);
            }

            unsafe fn exit_and_dispatch(_thread: &'static $crate::ThreadCb<Self>) -> ! {
                panic!("thread exited");
            }

            unsafe fn enter_cpu_lock() {
                let was_active = CPU_LOCK.swap(true, std::sync::atomic::Ordering::SeqCst);
                assert!(!was_active, "CPU Lock is already active");
            }

            unsafe fn leave_cpu_lock() {
                let was_active = CPU_LOCK.swap(false, std::sync::atomic::Ordering::SeqCst);
                assert!(was_active, "CPU Lock is not active");
            }

            unsafe fn initialize_thread_state(_thread: &'static $crate::ThreadCb<Self>) {}

            unsafe fn request_function_execution(
                _thread: &'static $crate::ThreadCb<Self>,
                func: fn(),
            ) {
                INTERRUPT_ACTIONS.lock().unwrap().push(func);
            }

            fn is_cpu_lock_active() -> bool {
                CPU_LOCK.load(std::sync::atomic::Ordering::SeqCst)
            }

            fn is_thread_context() -> bool {
                true
            }
        }

        unsafe impl $crate::KernelCfg for $Traits {
            type TimeoutHeap = arrayvec::ArrayVec<$crate::TimeoutRef<$Traits>, 16>;

            fn state() -> &'static $crate::State<$Traits> {
                &KERNEL_STATE
            }
        }

        impl $Traits {
            #[allow(dead_code)]
            fn queue_interrupt(action: fn()) {
                INTERRUPT_ACTIONS.lock().unwrap().push(action);
            }

            #[allow(dead_code)]
            fn run_interrupts() {
                loop {
                    let action = {
                        let mut actions = INTERRUPT_ACTIONS.lock().unwrap();
                        if actions.is_empty() {
                            None
                        } else {
                            Some(actions.remove(0))
                        }
                    };
                    match action {
                        Some(action) => action(),
                        None => break,
                    }
                }
            }

            #[allow(dead_code)]
            fn tick() {
                // Safety: Mirrors the port's timebase driver
                unsafe { <$Traits as $crate::PortToKernel>::timer_tick() }
            }
        }
    };
}
