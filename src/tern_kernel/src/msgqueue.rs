//! Message queues
//!
//! A message queue is the priority-ordered sibling of the FIFO queue. The
//! same two-semaphore skeleton provides blocking and backpressure, but the
//! circular cursors are replaced by an entry pool: a free list of unused
//! element slots and an in-use list kept in descending message-priority
//! order, FIFO within equal priority. `pop` therefore always removes the
//! highest-priority message.
//!
//! Entry storage ([`MessageQueueEntryStorage`]) and element storage
//! ([`QueueStorage`]) are both caller-provided; entry `i` of the pool always
//! describes element slot `i`.
use core::{cell::UnsafeCell, fmt, marker::PhantomData, mem, ptr};

use crate::{
    error::{QueueError, QueueTimeoutError, ResultCode, TryQueueError},
    klock::{self, CpuLockCell},
    queue::{
        queue_error, queue_timeout_error, try_queue_error, MessageSizeError, QueueStorage,
        RawStorage,
    },
    semaphore::{SemaphoreCb, SemaphoreWait},
    time::{TickDuration, TickInstant},
    KernelTraits, Port,
};

/// The priority of a queued message. Higher values are popped first.
pub type MessagePriority = u8;

/// Index value representing "no entry".
const ENTRY_NONE: usize = usize::MAX;

/// A pool entry describing one element slot.
#[derive(Debug, Clone, Copy)]
pub struct MessageQueueEntry {
    priority: MessagePriority,

    /// The next entry in the free list or the in-use list.
    next: usize,
}

/// Caller-provided entry-pool storage for a message queue holding up to `N`
/// messages.
pub struct MessageQueueEntryStorage<const N: usize> {
    entries: UnsafeCell<[MessageQueueEntry; N]>,
}

// Safety: The contents are only accessed under CPU Lock by the owning queue
unsafe impl<const N: usize> Sync for MessageQueueEntryStorage<N> {}

impl<const N: usize> MessageQueueEntryStorage<N> {
    pub const fn new() -> Self {
        // Chain all entries into the initial free list
        let mut entries = [MessageQueueEntry {
            priority: 0,
            next: ENTRY_NONE,
        }; N];
        let mut i = 0;
        while i + 1 < N {
            entries[i].next = i + 1;
            i += 1;
        }
        Self {
            entries: UnsafeCell::new(entries),
        }
    }
}

impl<const N: usize> Default for MessageQueueEntryStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw view of an entry pool.
#[derive(Clone, Copy)]
struct RawEntries {
    ptr: *mut MessageQueueEntry,
    len: usize,
}

// Safety: `RawEntries` only describes a region of caller-provided `'static`
// storage; all accesses happen under CPU Lock
unsafe impl Send for RawEntries {}
unsafe impl Sync for RawEntries {}

/// The pool state of a message queue.
struct MessagePool {
    storage: RawStorage,
    entries: RawEntries,

    /// Head of the free-entry list.
    free_head: usize,

    /// Head of the in-use list, in descending message priority, FIFO within
    /// equal priority.
    used_head: usize,
}

impl MessagePool {
    /// Get a mutable reference to the specified entry.
    ///
    /// # Safety
    ///
    /// The caller must hold CPU Lock (enforced by reaching `MessagePool`
    /// through its `CpuLockCell`) and `i` must be a valid entry index.
    unsafe fn entry(&self, i: usize) -> &mut MessageQueueEntry {
        debug_assert!(i < self.entries.len);
        unsafe { &mut *self.entries.ptr.add(i) }
    }

    /// Take an entry from the free list.
    fn allocate(&mut self) -> usize {
        let i = self.free_head;
        debug_assert_ne!(i, ENTRY_NONE);
        // Safety: `i` came from the free list, so it's a valid index
        self.free_head = unsafe { self.entry(i) }.next;
        i
    }

    /// Return an entry to the free list.
    fn free(&mut self, i: usize) {
        // Safety: `i` was just removed from the in-use list
        unsafe { self.entry(i) }.next = self.free_head;
        self.free_head = i;
    }

    /// Insert entry `i` into the in-use list behind all entries whose
    /// priority is greater than or equal to `priority`.
    fn insert_used(&mut self, i: usize, priority: MessagePriority) {
        // Safety: `i` is a valid index returned by `allocate`
        unsafe {
            self.entry(i).priority = priority;

            let mut prev = ENTRY_NONE;
            let mut cursor = self.used_head;
            while cursor != ENTRY_NONE && self.entry(cursor).priority >= priority {
                prev = cursor;
                cursor = self.entry(cursor).next;
            }

            self.entry(i).next = cursor;
            if prev == ENTRY_NONE {
                self.used_head = i;
            } else {
                self.entry(prev).next = i;
            }
        }
    }

    /// Remove and return the head of the in-use list.
    fn take_used(&mut self) -> (usize, MessagePriority) {
        let i = self.used_head;
        debug_assert_ne!(i, ENTRY_NONE);
        // Safety: `i` came from the in-use list, so it's a valid index
        let entry = unsafe { self.entry(i) };
        let next = entry.next;
        let priority = entry.priority;
        self.used_head = next;
        (i, priority)
    }
}

/// Implements the basic functionality of the message queue front ends.
struct MessageQueueBase<Traits: Port> {
    /// Guards the "pop" side - its value equals the number of queued
    /// messages.
    pop_semaphore: SemaphoreCb<Traits>,

    /// Guards the "push" side - its value equals the number of free slots.
    push_semaphore: SemaphoreCb<Traits>,

    /// Size of a single queue element, in bytes.
    element_size: usize,

    pool: CpuLockCell<Traits, MessagePool>,
}

impl<Traits: Port> MessageQueueBase<Traits> {
    const fn new(
        storage: RawStorage,
        entries: RawEntries,
        element_size: usize,
        max_elements: usize,
    ) -> Self {
        Self {
            pop_semaphore: SemaphoreCb::with_max(0, max_elements as i32),
            push_semaphore: SemaphoreCb::with_max(max_elements as i32, max_elements as i32),
            element_size,
            pool: CpuLockCell::new(MessagePool {
                storage,
                entries,
                free_head: if max_elements > 0 { 0 } else { ENTRY_NONE },
                used_head: ENTRY_NONE,
            }),
        }
    }
}

impl<Traits: KernelTraits> MessageQueueBase<Traits> {
    fn push(
        &'static self,
        wait_kind: SemaphoreWait,
        src: *const u8,
        priority: MessagePriority,
    ) -> Result<(), ResultCode> {
        self.push_semaphore.wait_by(wait_kind)?;

        {
            let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
            let element_size = self.element_size;
            let pool = self.pool.write(&mut *lock);

            let i = pool.allocate();

            // Safety: Entry `i` came from the free list, so slot `i` is
            // unused, and the copy happens under CPU Lock
            unsafe {
                ptr::copy_nonoverlapping(src, pool.storage.ptr.add(i * element_size), element_size);
            }

            pool.insert_used(i, priority);
        }

        let posted = self.pop_semaphore.post();
        debug_assert!(posted.is_ok());

        Ok(())
    }

    fn pop(
        &'static self,
        wait_kind: SemaphoreWait,
        dst: *mut u8,
    ) -> Result<MessagePriority, ResultCode> {
        self.pop_semaphore.wait_by(wait_kind)?;

        let priority = {
            let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
            let element_size = self.element_size;
            let pool = self.pool.write(&mut *lock);

            let (i, priority) = pool.take_used();

            // Safety: Entry `i` came from the in-use list, so slot `i` holds
            // a message, and the copy happens under CPU Lock
            unsafe {
                ptr::copy_nonoverlapping(pool.storage.ptr.add(i * element_size), dst, element_size);
            }

            pool.free(i);
            priority
        };

        let posted = self.push_semaphore.post();
        debug_assert!(posted.is_ok());

        Ok(priority)
    }
}

/// A fixed-element-size message queue moving untyped byte blobs, delivered in
/// descending message-priority order.
pub struct RawMessageQueue<Traits: Port> {
    base: MessageQueueBase<Traits>,
}

impl<Traits: Port> RawMessageQueue<Traits> {
    /// Construct a `RawMessageQueue` over the given entry and element
    /// storage.
    ///
    /// The queue holds up to `N_ENTRIES` messages; the element storage must
    /// provide room for that many elements.
    pub const fn new<const N_ENTRIES: usize, const N_BYTES: usize>(
        entry_storage: &'static MessageQueueEntryStorage<N_ENTRIES>,
        storage: &'static QueueStorage<N_BYTES>,
        element_size: usize,
    ) -> Self {
        assert!(element_size > 0, "element size must be non-zero");
        assert!(N_ENTRIES > 0, "entry storage holds no entries");
        assert!(
            N_BYTES / element_size >= N_ENTRIES,
            "element storage is smaller than the entry pool"
        );
        Self {
            base: MessageQueueBase::new(
                storage.as_raw(),
                RawEntries {
                    ptr: entry_storage.entries.get() as *mut MessageQueueEntry,
                    len: N_ENTRIES,
                },
                element_size,
                N_ENTRIES,
            ),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for RawMessageQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawMessageQueue")
            .field("self", &(self as *const _))
            .field("pop_semaphore", &self.base.pop_semaphore)
            .field("push_semaphore", &self.base.push_semaphore)
            .field("element_size", &self.base.element_size)
            .finish()
    }
}

impl<Traits: KernelTraits> RawMessageQueue<Traits> {
    /// Append `data` with the given message priority, blocking while the
    /// queue is full.
    ///
    /// `data.len()` must equal the queue's element size; otherwise the call
    /// fails with `MessageSize` without touching the queue.
    pub fn push(&'static self, data: &[u8], priority: MessagePriority) -> Result<(), QueueError> {
        self.check_size::<QueueError>(data.len())?;
        self.base
            .push(SemaphoreWait::Wait, data.as_ptr(), priority)
            .map_err(queue_error)
    }

    /// As [`push`](Self::push), but fail with `Busy` instead of blocking.
    pub fn try_push(
        &'static self,
        data: &[u8],
        priority: MessagePriority,
    ) -> Result<(), TryQueueError> {
        self.check_size::<TryQueueError>(data.len())?;
        self.base
            .push(SemaphoreWait::TryWait, data.as_ptr(), priority)
            .map_err(try_queue_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` after the
    /// specified duration.
    pub fn try_push_for(
        &'static self,
        data: &[u8],
        priority: MessagePriority,
        duration: TickDuration,
    ) -> Result<(), QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(data.len())?;
        self.base
            .push(SemaphoreWait::TryWaitFor(duration), data.as_ptr(), priority)
            .map_err(queue_timeout_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_push_until(
        &'static self,
        data: &[u8],
        priority: MessagePriority,
        time_point: TickInstant,
    ) -> Result<(), QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(data.len())?;
        self.base
            .push(
                SemaphoreWait::TryWaitUntil(time_point),
                data.as_ptr(),
                priority,
            )
            .map_err(queue_timeout_error)
    }

    /// Remove the highest-priority message into `buffer`, blocking while the
    /// queue is empty. Returns the message's priority.
    pub fn pop(&'static self, buffer: &mut [u8]) -> Result<MessagePriority, QueueError> {
        self.check_size::<QueueError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::Wait, buffer.as_mut_ptr())
            .map_err(queue_error)
    }

    /// As [`pop`](Self::pop), but fail with `Busy` instead of blocking.
    pub fn try_pop(&'static self, buffer: &mut [u8]) -> Result<MessagePriority, TryQueueError> {
        self.check_size::<TryQueueError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::TryWait, buffer.as_mut_ptr())
            .map_err(try_queue_error)
    }

    /// As [`pop`](Self::pop), but give up with `Timeout` after the specified
    /// duration.
    pub fn try_pop_for(
        &'static self,
        buffer: &mut [u8],
        duration: TickDuration,
    ) -> Result<MessagePriority, QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::TryWaitFor(duration), buffer.as_mut_ptr())
            .map_err(queue_timeout_error)
    }

    /// As [`pop`](Self::pop), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_pop_until(
        &'static self,
        buffer: &mut [u8],
        time_point: TickInstant,
    ) -> Result<MessagePriority, QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::TryWaitUntil(time_point), buffer.as_mut_ptr())
            .map_err(queue_timeout_error)
    }

    #[inline]
    fn check_size<E: MessageSizeError>(&self, len: usize) -> Result<(), E> {
        if len != self.base.element_size {
            Err(E::message_size())
        } else {
            Ok(())
        }
    }
}

/// A fixed-size message queue of `T` values, delivered in descending
/// message-priority order.
pub struct MessageQueue<Traits: Port, T: 'static + Copy + Send> {
    base: MessageQueueBase<Traits>,
    _phantom: PhantomData<fn() -> T>,
}

impl<Traits: Port, T: 'static + Copy + Send> MessageQueue<Traits, T> {
    /// Construct a `MessageQueue` over the given entry and element storage.
    pub const fn new<const N_ENTRIES: usize, const N_BYTES: usize>(
        entry_storage: &'static MessageQueueEntryStorage<N_ENTRIES>,
        storage: &'static QueueStorage<N_BYTES>,
    ) -> Self {
        assert!(mem::size_of::<T>() > 0, "zero-sized elements are not useful");
        assert!(N_ENTRIES > 0, "entry storage holds no entries");
        assert!(
            N_BYTES / mem::size_of::<T>() >= N_ENTRIES,
            "element storage is smaller than the entry pool"
        );
        Self {
            base: MessageQueueBase::new(
                storage.as_raw(),
                RawEntries {
                    ptr: entry_storage.entries.get() as *mut MessageQueueEntry,
                    len: N_ENTRIES,
                },
                mem::size_of::<T>(),
                N_ENTRIES,
            ),
            _phantom: PhantomData,
        }
    }
}

impl<Traits: KernelTraits, T: 'static + Copy + Send> MessageQueue<Traits, T> {
    /// Append `value` with the given message priority, blocking while the
    /// queue is full.
    pub fn push(&'static self, value: T, priority: MessagePriority) -> Result<(), QueueError> {
        self.base
            .push(
                SemaphoreWait::Wait,
                &value as *const T as *const u8,
                priority,
            )
            .map_err(queue_error)
    }

    /// As [`push`](Self::push), but fail with `Busy` instead of blocking.
    pub fn try_push(
        &'static self,
        value: T,
        priority: MessagePriority,
    ) -> Result<(), TryQueueError> {
        self.base
            .push(
                SemaphoreWait::TryWait,
                &value as *const T as *const u8,
                priority,
            )
            .map_err(try_queue_error)
    }

    /// Remove and return the highest-priority message and its priority,
    /// blocking while the queue is empty.
    pub fn pop(&'static self) -> Result<(T, MessagePriority), QueueError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        let priority = self
            .base
            .pop(SemaphoreWait::Wait, out.as_mut_ptr() as *mut u8)
            .map_err(queue_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok((unsafe { out.assume_init() }, priority))
    }

    /// As [`pop`](Self::pop), but fail with `Busy` instead of blocking.
    pub fn try_pop(&'static self) -> Result<(T, MessagePriority), TryQueueError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        let priority = self
            .base
            .pop(SemaphoreWait::TryWait, out.as_mut_ptr() as *mut u8)
            .map_err(try_queue_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok((unsafe { out.assume_init() }, priority))
    }
}
