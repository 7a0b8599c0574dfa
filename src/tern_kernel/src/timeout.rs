//! Manages timeouts (timed events) and the kernel timebase.
//!
//! # Ticks
//!
//! The kernel tracks time as a 64-bit count of ticks since boot, incremented
//! by [`handle_tick`] on every tick interrupt. At 1 kHz the counter lasts for
//! half a billion years, so unlike narrower tick counters it never wraps and
//! timeouts can be stored as plain absolute tick values.
//!
//! # Timeouts
//!
//! An outstanding timeout is a [`Timeout`] object linked into a binary
//! min-heap ordered by arrival tick. The heap stores references; the objects
//! themselves live wherever their owner put them, be it a software timer
//! control block or a waiting thread's stack frame. [`handle_tick`] pops and fires
//! every timeout whose arrival tick has been reached.
//!
//! # The extra tick
//!
//! A relative expiration ([`Expiry::After`]) is armed at
//! `current tick + duration + 1`. The tick in progress is only partially
//! elapsed and must not count toward the duration, so a timed operation of
//! `d` ticks started at tick `T` completes at `T + d + 1`. This rounding is
//! part of the kernel's contract; all timed operations go through this one
//! place.
use arrayvec::ArrayVec;
use core::{fmt, marker::PhantomPinned, ops, pin::Pin, ptr::NonNull};

use crate::{
    klock::{lock_cpu, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    thread,
    time::TickInstant,
    utils::Init,
    KernelTraits, PortThreading,
};

// ---------------------------------------------------------------------------
// Define a singleton token type to allow the mutable access to `Timeout::{at,
// heap_pos}` while the heap itself is mutably borrowed from its `CpuLockCell`.

struct TimeoutPropTag;

/// The key that "unlocks" [`TimeoutPropCell`].
type TimeoutPropToken = tokenlock::UnsyncSingletonToken<TimeoutPropTag>;

/// The keyhole type for [`TimeoutPropCell`] that can be "unlocked" by
/// [`TimeoutPropToken`].
type TimeoutPropKeyhole = tokenlock::SingletonTokenId<TimeoutPropTag>;

/// Cell type that can be accessed by [`TimeoutPropToken`], which is stored
/// alongside the timeout heap and therefore protected by CPU Lock.
type TimeoutPropCell<T> = tokenlock::UnsyncTokenLock<T, TimeoutPropKeyhole>;

// ---------------------------------------------------------------------------

/// A relative time span, measured in ticks.
pub(crate) type Ticks = u32;

/// The expiration time of a timed operation.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Expiry {
    /// Expire the specified number of ticks from now, rounded up to the next
    /// tick boundary (see the module documentation).
    After(Ticks),

    /// Expire at the specified absolute tick, or at the next tick if the
    /// specified one has already been reached.
    At(u64),
}

/// A kernel-global state for timed event management.
pub(super) struct TimeoutGlobals<Traits, TimeoutHeap: 'static> {
    /// The number of ticks elapsed since boot. 64 bits wide; reading it from
    /// a thread context requires CPU Lock.
    tick_count: CpuLockCell<Traits, u64>,

    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival tick, and the `TimeoutPropToken` used to access
    /// [`Timeout`]'s field contents.
    heap_and_prop_token: CpuLockCell<Traits, TimeoutHeapAndPropToken<TimeoutHeap>>,
}

#[derive(Debug)]
struct TimeoutHeapAndPropToken<TimeoutHeap: 'static> {
    /// The heap (priority queue) containing outstanding timeouts, sorted by
    /// arrival tick.
    heap: TimeoutHeap,

    /// The `TimeoutPropToken` used to access [`Timeout`]'s field contents.
    prop_token: TimeoutPropToken,
}

impl<Traits, TimeoutHeap: Init + 'static> Init for TimeoutGlobals<Traits, TimeoutHeap> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        tick_count: Init::INIT,
        heap_and_prop_token: CpuLockCell::new(TimeoutHeapAndPropToken {
            heap: Init::INIT,
            // Safety: In each particular `Traits`, this is the only instance
            //         of `TimeoutPropToken`. If there are more than one
            //         `Traits` in a program, the singleton property of
            //         `UnsyncSingletonToken` will be broken, technically, but
            //         that doesn't pose a problem because we never use the
            //         `TimeoutPropToken` of one `Traits` to unlock another
            //         `Traits`'s data structures.
            prop_token: unsafe { TimeoutPropToken::new_unchecked() },
        }),
    };
}

impl<Traits: KernelTraits, TimeoutHeap: fmt::Debug> fmt::Debug
    for TimeoutGlobals<Traits, TimeoutHeap>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimeoutGlobals")
            .field("tick_count", &self.tick_count)
            .field("heap_and_prop_token", &self.heap_and_prop_token)
            .finish()
    }
}

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap>;
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self, Self::TimeoutHeap> {
        &Self::state().timeout
    }
}

// Timeouts
// ---------------------------------------------------------------------------

/// A timeout.
///
/// `Timeout` is a `!Unpin` type. Once registered by [`insert_timeout`], the
/// `Timeout` must stay in the same memory location until it's unregistered.
/// Dropping isn't allowed either. `Timeout::drop` can detect the violation of
/// this requirement and cause a panic.
///
/// `Timeout` is unregistered by one of the following ways:
///
///  - On expiration, right before its callback function is called.
///  - [`remove_timeout`] can unregister a `Timeout` at anytime. There is a
///    RAII guard type [`TimeoutGuard`] that does this automatically.
pub(crate) struct Timeout<Traits: PortThreading> {
    /// The arrival tick of the timeout.
    ///
    /// This is wrapped by `TimeoutPropCell` because the heap maintenance code
    /// needs to access this while the heap itself is mutably borrowed.
    at: TimeoutPropCell<u64>,

    /// The position of this timeout in [`TimeoutGlobals::heap_and_prop_token`]'s
    /// heap. [`HEAP_POS_NONE`] indicates this timeout is not included in the
    /// heap.
    heap_pos: TimeoutPropCell<usize>,

    /// Callback function.
    callback: TimeoutFn<Traits>,

    /// Parameter given to the callback function.
    ///
    /// Wrapped by `TimeoutPropCell` so that objects embedding a `Timeout`
    /// (software timers) can bind it to their own address after construction.
    callback_param: TimeoutPropCell<usize>,

    /// Un-implement `Unpin`.
    _pin: PhantomPinned,
}

/// Timeout callback function.
///
/// The callback function is called with CPU Lock active when the associated
/// [`Timeout`] expires. It must be short and non-blocking.
///
/// The callback function may wake up threads. When it does that, it doesn't
/// have to call `unlock_cpu_and_check_preemption` or `yield_cpu` - it's
/// automatically taken care of by [`handle_tick`].
pub(crate) type TimeoutFn<Traits> = fn(usize, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// Value of [`Timeout::heap_pos`] indicating the timeout is not included in
/// the heap.
const HEAP_POS_NONE: usize = usize::MAX;

impl<Traits: PortThreading> Drop for Timeout<Traits> {
    #[inline]
    fn drop(&mut self) {
        if *self.heap_pos.get_mut() != HEAP_POS_NONE {
            // The timeout is still in the heap. Dropping `self` now would
            // cause use-after-free. Since we don't have CPU Lock and we
            // aren't sure if we can get a hold of it, panicking (escalating
            // to abort) is the only course of action we can take. The owner
            // of `Timeout` is responsible for ensuring this does not happen.
            panic!("timeout is still linked");
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for Timeout<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("callback", &self.callback)
            .finish()
    }
}

impl<Traits: KernelTraits> Timeout<Traits> {
    /// Construct a `Timeout`.
    ///
    /// The expiration time is initialized to the boot-time origin.
    pub(crate) const fn new(callback: TimeoutFn<Traits>, callback_param: usize) -> Self {
        Self {
            at: TimeoutPropCell::new(TimeoutPropKeyhole::new(), 0),
            heap_pos: TimeoutPropCell::new(TimeoutPropKeyhole::new(), HEAP_POS_NONE),
            callback,
            callback_param: TimeoutPropCell::new(TimeoutPropKeyhole::new(), callback_param),
            _pin: PhantomPinned,
        }
    }

    /// Set the parameter passed to the callback function. The timeout must
    /// not be linked.
    pub(crate) fn set_callback_param(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        callback_param: usize,
    ) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        debug_assert_eq!(*self.heap_pos.read(&*prop_token), HEAP_POS_NONE);
        *self.callback_param.write(prop_token) = callback_param;
    }

    /// Get a flag indicating whether the `Timeout` is currently in the heap.
    pub(crate) fn is_linked(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        *self.heap_pos.read(prop_token) != HEAP_POS_NONE
    }

    /// Configure the `Timeout` to expire at `expiry`.
    pub(crate) fn set_expiry(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, expiry: Expiry) {
        let now = Traits::g_timeout().tick_count.get(&*lock);
        let at = match expiry {
            // The tick in progress doesn't count toward the duration; see the
            // module documentation
            Expiry::After(ticks) => now + ticks as u64 + 1,
            Expiry::At(at) => at.max(now + 1),
        };

        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        *self.at.write(prop_token) = at;
    }

    /// Advance the `Timeout`'s expiration time by the specified number of
    /// ticks.
    ///
    /// Intended to be used by periodic events before re-registering the
    /// `Timeout`. Unlike [`Expiry::After`], no extra tick is added; the new
    /// expiration is relative to the previous one, not to the current tick.
    pub(crate) fn adjust_expiration(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        ticks: Ticks,
    ) {
        let prop_token = &mut Traits::g_timeout()
            .heap_and_prop_token
            .write(&mut *lock)
            .prop_token;

        let at = self.at.write(prop_token);
        *at += ticks as u64;
    }

    /// Calculate the number of ticks before this timeout expires. Returns `0`
    /// if it is already overdue.
    pub(crate) fn saturating_ticks_until_expiry(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Ticks {
        let now = Traits::g_timeout().tick_count.get(&*lock.borrow_mut());

        let prop_token = &Traits::g_timeout()
            .heap_and_prop_token
            .read(&*lock)
            .prop_token;

        let at = *self.at.read(prop_token);
        at.saturating_sub(now).min(Ticks::MAX as u64) as Ticks
    }
}

/// A reference to a [`Timeout`].
pub struct TimeoutRef<Traits: PortThreading>(NonNull<Timeout<Traits>>);

// Safety: `Timeout` is `Send + Sync`
unsafe impl<Traits: PortThreading> Send for TimeoutRef<Traits> {}
unsafe impl<Traits: PortThreading> Sync for TimeoutRef<Traits> {}

impl<Traits: PortThreading> Clone for TimeoutRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for TimeoutRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TimeoutRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TimeoutRef").field(&self.0).finish()
    }
}

// The timeout heap
// ---------------------------------------------------------------------------
//
// A binary min-heap of `TimeoutRef`s keyed by arrival tick. The heap is not a
// general-purpose container: every maintenance step also has to write the
// entry's new index back into `Timeout::heap_pos` (that's what makes O(log n)
// cancellation of a timed wait possible), so the sifting code manipulates the
// timeout objects directly through the prop token.

/// Backing storage for the timeout heap, supplied by the system type
/// ([`KernelCfg::TimeoutHeap`]) so that the capacity can be chosen per
/// application. One slot per thread plus one per software timer is always
/// sufficient.
///
/// [`KernelCfg::TimeoutHeap`]: crate::KernelCfg::TimeoutHeap
pub trait TimeoutStorage<Traits: PortThreading>:
    ops::Deref<Target = [TimeoutRef<Traits>]> + ops::DerefMut + Send + Sync
{
    /// Append an entry at the end of the storage.
    fn push(&mut self, timeout_ref: TimeoutRef<Traits>);

    /// Remove and return the last entry.
    fn pop(&mut self) -> Option<TimeoutRef<Traits>>;
}

impl<Traits: PortThreading, const N: usize> TimeoutStorage<Traits>
    for ArrayVec<TimeoutRef<Traits>, N>
{
    fn push(&mut self, timeout_ref: TimeoutRef<Traits>) {
        ArrayVec::push(self, timeout_ref);
    }

    fn pop(&mut self) -> Option<TimeoutRef<Traits>> {
        ArrayVec::pop(self)
    }
}

/// Read the arrival tick of a heap entry.
#[inline]
fn arrival_tick<Traits: PortThreading>(
    prop_token: &TimeoutPropToken,
    timeout_ref: TimeoutRef<Traits>,
) -> u64 {
    // Safety: `timeout_ref` is in the heap, so the pointee must be valid
    unsafe { *timeout_ref.0.as_ref().at.read(prop_token) }
}

/// Record a heap entry's new index in its `heap_pos` field.
#[inline]
fn store_heap_pos<Traits: PortThreading>(
    prop_token: &mut TimeoutPropToken,
    timeout_ref: TimeoutRef<Traits>,
    heap_pos: usize,
) {
    // Safety: `timeout_ref` is in the heap, so the pointee must be valid
    unsafe { timeout_ref.0.as_ref() }
        .heap_pos
        .replace(prop_token, heap_pos);
}

/// Swap the heap entries at `a` and `b`, keeping their `heap_pos` fields
/// current.
#[inline]
fn swap_entries<Traits: KernelTraits>(
    heap: &mut Traits::TimeoutHeap,
    prop_token: &mut TimeoutPropToken,
    a: usize,
    b: usize,
) {
    heap.swap(a, b);
    store_heap_pos(prop_token, heap[a], a);
    store_heap_pos(prop_token, heap[b], b);
}

/// Link `timeout_ref` into the heap: append it at the end, then bubble it up
/// until its parent arrives no later than it does. Returns the entry's final
/// index.
fn heap_link<Traits: KernelTraits>(
    heap: &mut Traits::TimeoutHeap,
    prop_token: &mut TimeoutPropToken,
    timeout_ref: TimeoutRef<Traits>,
) -> usize {
    heap.push(timeout_ref);
    let mut pos = heap.len() - 1;
    store_heap_pos(prop_token, timeout_ref, pos);

    while pos > 0 {
        let parent = (pos - 1) / 2;
        if arrival_tick(&*prop_token, heap[parent]) <= arrival_tick(&*prop_token, heap[pos]) {
            break;
        }
        swap_entries::<Traits>(heap, prop_token, pos, parent);
        pos = parent;
    }

    pos
}

/// Unlink the heap entry at `pos`, filling the hole with the last entry and
/// re-sifting it. Returns `None` when `pos` is out of bounds (which includes
/// [`HEAP_POS_NONE`]). The unlinked entry's `heap_pos` is reset.
fn heap_unlink<Traits: KernelTraits>(
    heap: &mut Traits::TimeoutHeap,
    prop_token: &mut TimeoutPropToken,
    pos: usize,
) -> Option<TimeoutRef<Traits>> {
    if pos >= heap.len() {
        return None;
    }

    let removed = heap[pos];
    store_heap_pos(prop_token, removed, HEAP_POS_NONE);

    // The last entry must move: either it *is* the removed entry, or it
    // fills the hole
    let last = heap.pop().unwrap();
    if pos == heap.len() {
        return Some(removed);
    }

    heap[pos] = last;
    store_heap_pos(prop_token, last, pos);

    // Restore the ordering around the filled hole. At most one of these
    // loops actually moves the entry.
    let mut pos = pos;
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if arrival_tick(&*prop_token, heap[parent]) <= arrival_tick(&*prop_token, heap[pos]) {
            break;
        }
        swap_entries::<Traits>(heap, prop_token, pos, parent);
        pos = parent;
    }
    loop {
        let left = pos * 2 + 1;
        if left >= heap.len() {
            break;
        }
        let mut earliest_child = left;
        let right = left + 1;
        if right < heap.len()
            && arrival_tick(&*prop_token, heap[right]) < arrival_tick(&*prop_token, heap[left])
        {
            earliest_child = right;
        }
        if arrival_tick(&*prop_token, heap[pos])
            <= arrival_tick(&*prop_token, heap[earliest_child])
        {
            break;
        }
        swap_entries::<Traits>(heap, prop_token, pos, earliest_child);
        pos = earliest_child;
    }

    Some(removed)
}

// Global time management
// ---------------------------------------------------------------------------

/// Get the current tick count.
pub(crate) fn current_time<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) -> TickInstant {
    TickInstant::from_ticks(Traits::g_timeout().tick_count.get(&*lock.borrow_mut()))
}

/// Implements [`PortToKernel::timer_tick`].
///
/// Precondition: CPU Lock inactive, an interrupt context
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
#[inline]
pub(super) fn handle_tick<Traits: KernelTraits>() {
    // The precondition includes CPU Lock being inactive, so this `unwrap`
    // should succeed
    let mut lock = lock_cpu::<Traits>().unwrap();

    let g_timeout = Traits::g_timeout();

    // Announce the new tick
    let now = {
        let tick_count = g_timeout.tick_count.write(&mut *lock);
        *tick_count += 1;
        *tick_count
    };

    // Process expired timeouts.
    //
    // For each iteration, check the top element (representing the earliest
    // timeout) in the heap. Exit from the loop if the heap is empty or the
    // earliest timeout hasn't arrived yet.
    loop {
        let Some(&timeout_ref) = g_timeout.heap_and_prop_token.read(&*lock).heap.get(0) else {
            break;
        };

        // Safety: `timeout_ref` is in the heap, meaning the pointee is valid
        let timeout = unsafe { &*timeout_ref.0.as_ptr() };

        let TimeoutHeapAndPropToken { heap, prop_token } =
            g_timeout.heap_and_prop_token.write(&mut *lock);

        if *timeout.at.read(&*prop_token) > now {
            break;
        }

        // The timeout has expired. Remove it from the heap.
        let callback = timeout.callback;
        let callback_param = *timeout.callback_param.read(&*prop_token);

        debug_assert_eq!(*timeout.heap_pos.read(&*prop_token), 0);
        heap_unlink::<Traits>(heap, prop_token, 0);

        // (Note: `timeout` is considered invalid at this point because it's
        // not in the heap anymore)

        // Call the callback function.
        lock = callback(callback_param, lock);
    }

    // Rotate the running thread's round-robin band if its time slice expired
    thread::round_robin_tick(lock.borrow_mut());

    // Callback functions might have woken up some threads. Check for dispatch
    // and release CPU Lock.
    thread::unlock_cpu_and_check_preemption(lock);
}

// Timeout management
// ---------------------------------------------------------------------------

/// Register the specified timeout.
pub(crate) fn insert_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Pin<&Timeout<Traits>>,
) {
    // This check is important for memory safety. For each `Timeout`, there
    // can be only one heap entry pointing to that `Timeout`. `heap_pos`
    // indicates whether there's a corresponding heap entry or not. If we let
    // two entries reside in the heap, when we remove the first one, we would
    // falsely flag the `Timeout` as "not in the heap". If we drop the
    // `Timeout` in this state, the second entry would be still referencing
    // the no-longer existent `Timeout`.
    let prop_token = &Traits::g_timeout()
        .heap_and_prop_token
        .read(&*lock)
        .prop_token;
    assert_eq!(
        *timeout.heap_pos.read(prop_token),
        HEAP_POS_NONE,
        "timeout is already registered",
    );

    // Insert a reference to `timeout` into the heap
    //
    // `Timeout` is `!Unpin` and `Timeout::drop` ensures it's not dropped
    // while it's still in the heap, so `*timeout` will never be leaked while
    // being referenced by the heap. Therefore, it's safe to insert a
    // reference to `*timeout` into the heap.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let pos = heap_link(heap, prop_token, TimeoutRef((&*timeout).into()));

    // `heap_link` should have assigned `heap_pos`
    debug_assert_eq!(*timeout.heap_pos.read(&*prop_token), pos);
}

/// Unregister the specified `Timeout`. Does nothing if it's not registered.
#[inline]
pub(crate) fn remove_timeout<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: &Timeout<Traits>,
) {
    // Remove `timeout` from the heap
    //
    // If `heap_pos == HEAP_POS_NONE`, we are supposed to do nothing.
    // `HEAP_POS_NONE` is a huge value, so `heap_unlink` will inevitably
    // reject such a huge value by bounds check. This way, we can check both
    // for bounds and `HEAP_POS_NONE` in one fell swoop.
    let TimeoutHeapAndPropToken { heap, prop_token } =
        Traits::g_timeout().heap_and_prop_token.write(&mut *lock);

    let heap_pos = *timeout.heap_pos.read(&*prop_token);

    let timeout_ref = heap_unlink::<Traits>(heap, prop_token, heap_pos);

    if let Some(timeout_ref) = timeout_ref {
        // The unlinked entry should have pointed to `timeout`, and its
        // `heap_pos` was reset by `heap_unlink`
        debug_assert_eq!(timeout_ref.0.as_ptr() as *const _, timeout as *const _);
    } else {
        // The cause of failure must be `timeout` not being registered in the
        // first place. (Bounds check failure would be clearly because of our
        // programming error.)
        debug_assert_eq!(heap_pos, HEAP_POS_NONE);
    }
}

/// RAII guard that automatically unregisters `Timeout` when dropped.
pub(crate) struct TimeoutGuard<'a, 'b, Traits: KernelTraits> {
    pub(crate) timeout: Pin<&'a Timeout<Traits>>,
    pub(crate) lock: CpuLockTokenRefMut<'b, Traits>,
}

impl<Traits: KernelTraits> Drop for TimeoutGuard<'_, '_, Traits> {
    #[inline]
    fn drop(&mut self) {
        remove_timeout(self.lock.borrow_mut(), &self.timeout);
    }
}
