//! FIFO queues
//!
//! A FIFO queue is a pair of semaphores wrapped around a circular buffer:
//! `pop_semaphore` counts the elements available for reading and
//! `push_semaphore` counts the free slots. `push` waits on the push semaphore,
//! copies the element into the write slot, and posts the pop semaphore; `pop`
//! is the mirror image. Priority-ordered waiting and backpressure therefore
//! come directly from the semaphore.
//!
//! The buffer storage is caller-provided ([`QueueStorage`] /
//! [`FifoQueueStorage`]); elements are moved by untyped copy, which is why
//! the typed front end requires `T: Copy`.
use core::{cell::UnsafeCell, fmt, marker::PhantomData, mem, ptr};

use crate::{
    error::{QueueError, QueueTimeoutError, ResultCode, TryQueueError},
    klock::{self, CpuLockCell},
    semaphore::{SemaphoreCb, SemaphoreWait},
    time::{TickDuration, TickInstant},
    KernelTraits, Port,
};

/// Caller-provided byte storage for a [`RawFifoQueue`].
pub struct QueueStorage<const N: usize> {
    storage: UnsafeCell<[u8; N]>,
}

// Safety: The contents are only accessed under CPU Lock by the owning queue
unsafe impl<const N: usize> Sync for QueueStorage<N> {}

impl<const N: usize> QueueStorage<N> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([0; N]),
        }
    }

    pub(crate) const fn as_raw(&'static self) -> RawStorage {
        RawStorage {
            ptr: self.storage.get() as *mut u8,
            len: N,
        }
    }
}

impl<const N: usize> Default for QueueStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-provided element storage for a [`FifoQueue`]`<T>`.
pub struct FifoQueueStorage<T, const N: usize> {
    storage: UnsafeCell<[mem::MaybeUninit<T>; N]>,
}

// Safety: The contents are only accessed under CPU Lock by the owning queue
unsafe impl<T: Send, const N: usize> Sync for FifoQueueStorage<T, N> {}

impl<T: Copy, const N: usize> FifoQueueStorage<T, N> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([mem::MaybeUninit::uninit(); N]),
        }
    }
}

impl<T: Copy, const N: usize> Default for FifoQueueStorage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A raw (pointer + length) view of caller-provided storage.
#[derive(Clone, Copy)]
pub(crate) struct RawStorage {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

// Safety: `RawStorage` only describes a region of caller-provided `'static`
// storage; all accesses happen under CPU Lock
unsafe impl Send for RawStorage {}
unsafe impl Sync for RawStorage {}

/// The read/write state of a circular buffer.
struct QueueCursors {
    storage: RawStorage,

    /// Byte offset of the first element available for reading.
    read: usize,

    /// Byte offset of the first free slot available for writing.
    write: usize,
}

/// Implements the basic functionality of the FIFO queue front ends.
pub(crate) struct FifoQueueBase<Traits: Port> {
    /// Guards the "pop" side - its value equals the number of elements
    /// available for reading.
    pop_semaphore: SemaphoreCb<Traits>,

    /// Guards the "push" side - its value equals the number of free slots.
    push_semaphore: SemaphoreCb<Traits>,

    /// Size of a single queue element, in bytes.
    element_size: usize,

    cursors: CpuLockCell<Traits, QueueCursors>,
}

impl<Traits: Port> FifoQueueBase<Traits> {
    const fn new(storage: RawStorage, element_size: usize, max_elements: usize) -> Self {
        Self {
            pop_semaphore: SemaphoreCb::with_max(0, max_elements as i32),
            push_semaphore: SemaphoreCb::with_max(max_elements as i32, max_elements as i32),
            element_size,
            cursors: CpuLockCell::new(QueueCursors {
                storage,
                read: 0,
                write: 0,
            }),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for FifoQueueBase<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FifoQueueBase")
            .field("self", &(self as *const _))
            .field("pop_semaphore", &self.pop_semaphore)
            .field("push_semaphore", &self.push_semaphore)
            .field("element_size", &self.element_size)
            .finish()
    }
}

impl<Traits: KernelTraits> FifoQueueBase<Traits> {
    /// Acquire a free slot (waiting per `wait_kind`), copy `element_size`
    /// bytes from `src` into it, and signal the pop side.
    pub(crate) fn push(
        &'static self,
        wait_kind: SemaphoreWait,
        src: *const u8,
    ) -> Result<(), ResultCode> {
        self.push_semaphore.wait_by(wait_kind)?;

        {
            let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
            let element_size = self.element_size;
            let cursors = self.cursors.write(&mut *lock);

            // Safety: The push semaphore handed us exclusive use of the slot
            // at the write cursor, and the copy happens under CPU Lock
            unsafe {
                ptr::copy_nonoverlapping(
                    src,
                    cursors.storage.ptr.add(cursors.write),
                    element_size,
                );
            }
            cursors.write = advance(cursors.write, element_size, cursors.storage.len);
        }

        let posted = self.pop_semaphore.post();
        debug_assert!(posted.is_ok());

        Ok(())
    }

    /// Acquire an element (waiting per `wait_kind`), copy it to `dst`, and
    /// signal the push side.
    pub(crate) fn pop(
        &'static self,
        wait_kind: SemaphoreWait,
        dst: *mut u8,
    ) -> Result<(), ResultCode> {
        self.pop_semaphore.wait_by(wait_kind)?;

        {
            let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
            let element_size = self.element_size;
            let cursors = self.cursors.write(&mut *lock);

            // Safety: The pop semaphore handed us exclusive use of the
            // element at the read cursor, and the copy happens under CPU Lock
            unsafe {
                ptr::copy_nonoverlapping(cursors.storage.ptr.add(cursors.read), dst, element_size);
            }
            cursors.read = advance(cursors.read, element_size, cursors.storage.len);
        }

        let posted = self.push_semaphore.post();
        debug_assert!(posted.is_ok());

        Ok(())
    }

    pub(crate) fn element_size(&self) -> usize {
        self.element_size
    }
}

#[inline]
fn advance(cursor: usize, element_size: usize, capacity: usize) -> usize {
    let next = cursor + element_size;
    if next == capacity {
        0
    } else {
        next
    }
}

/// A fixed-element-size FIFO queue moving untyped byte blobs.
pub struct RawFifoQueue<Traits: Port> {
    base: FifoQueueBase<Traits>,
}

impl<Traits: Port> RawFifoQueue<Traits> {
    /// Construct a `RawFifoQueue` over the given storage.
    ///
    /// The queue holds `N / element_size` elements.
    pub const fn new<const N: usize>(
        storage: &'static QueueStorage<N>,
        element_size: usize,
    ) -> Self {
        assert!(element_size > 0, "element size must be non-zero");
        let max_elements = N / element_size;
        assert!(max_elements > 0, "storage holds no elements");
        Self {
            base: FifoQueueBase::new(
                RawStorage {
                    ptr: storage.storage.get() as *mut u8,
                    len: max_elements * element_size,
                },
                element_size,
                max_elements,
            ),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for RawFifoQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawFifoQueue")
            .field("base", &self.base)
            .finish()
    }
}

impl<Traits: KernelTraits> RawFifoQueue<Traits> {
    /// Append `data` to the queue, blocking while the queue is full.
    ///
    /// `data.len()` must equal the queue's element size; otherwise the call
    /// fails with `MessageSize` without touching the queue.
    pub fn push(&'static self, data: &[u8]) -> Result<(), QueueError> {
        self.check_size::<QueueError>(data.len())?;
        self.base
            .push(SemaphoreWait::Wait, data.as_ptr())
            .map_err(queue_error)
    }

    /// As [`push`](Self::push), but fail with `Busy` instead of blocking.
    pub fn try_push(&'static self, data: &[u8]) -> Result<(), TryQueueError> {
        self.check_size::<TryQueueError>(data.len())?;
        self.base
            .push(SemaphoreWait::TryWait, data.as_ptr())
            .map_err(try_queue_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` after the
    /// specified duration.
    pub fn try_push_for(
        &'static self,
        data: &[u8],
        duration: TickDuration,
    ) -> Result<(), QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(data.len())?;
        self.base
            .push(SemaphoreWait::TryWaitFor(duration), data.as_ptr())
            .map_err(queue_timeout_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_push_until(
        &'static self,
        data: &[u8],
        time_point: TickInstant,
    ) -> Result<(), QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(data.len())?;
        self.base
            .push(SemaphoreWait::TryWaitUntil(time_point), data.as_ptr())
            .map_err(queue_timeout_error)
    }

    /// Remove the oldest element into `buffer`, blocking while the queue is
    /// empty.
    ///
    /// `buffer.len()` must equal the queue's element size.
    pub fn pop(&'static self, buffer: &mut [u8]) -> Result<(), QueueError> {
        self.check_size::<QueueError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::Wait, buffer.as_mut_ptr())
            .map_err(queue_error)
    }

    /// As [`pop`](Self::pop), but fail with `Busy` instead of blocking.
    pub fn try_pop(&'static self, buffer: &mut [u8]) -> Result<(), TryQueueError> {
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
    ) -> Result<(), QueueTimeoutError> {
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
    ) -> Result<(), QueueTimeoutError> {
        self.check_size::<QueueTimeoutError>(buffer.len())?;
        self.base
            .pop(SemaphoreWait::TryWaitUntil(time_point), buffer.as_mut_ptr())
            .map_err(queue_timeout_error)
    }

    #[inline]
    fn check_size<E: MessageSizeError>(&self, len: usize) -> Result<(), E> {
        if len != self.base.element_size() {
            Err(E::message_size())
        } else {
            Ok(())
        }
    }
}

/// A fixed-size FIFO queue of `T` values.
pub struct FifoQueue<Traits: Port, T: 'static + Copy + Send> {
    base: FifoQueueBase<Traits>,
    _phantom: PhantomData<fn() -> T>,
}

impl<Traits: Port, T: 'static + Copy + Send> FifoQueue<Traits, T> {
    /// Construct a `FifoQueue` over the given storage.
    pub const fn new<const N: usize>(storage: &'static FifoQueueStorage<T, N>) -> Self {
        assert!(mem::size_of::<T>() > 0, "zero-sized elements are not useful");
        assert!(N > 0, "storage holds no elements");
        Self {
            base: FifoQueueBase::new(
                RawStorage {
                    ptr: storage.storage.get() as *mut u8,
                    len: N * mem::size_of::<T>(),
                },
                mem::size_of::<T>(),
                N,
            ),
            _phantom: PhantomData,
        }
    }
}

impl<Traits: KernelTraits, T: 'static + Copy + Send> fmt::Debug for FifoQueue<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FifoQueue").field("base", &self.base).finish()
    }
}

impl<Traits: KernelTraits, T: 'static + Copy + Send> FifoQueue<Traits, T> {
    /// Append `value` to the queue, blocking while the queue is full.
    pub fn push(&'static self, value: T) -> Result<(), QueueError> {
        self.base
            .push(SemaphoreWait::Wait, &value as *const T as *const u8)
            .map_err(queue_error)
    }

    /// As [`push`](Self::push), but fail with `Busy` instead of blocking.
    pub fn try_push(&'static self, value: T) -> Result<(), TryQueueError> {
        self.base
            .push(SemaphoreWait::TryWait, &value as *const T as *const u8)
            .map_err(try_queue_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` after the
    /// specified duration.
    pub fn try_push_for(
        &'static self,
        value: T,
        duration: TickDuration,
    ) -> Result<(), QueueTimeoutError> {
        self.base
            .push(
                SemaphoreWait::TryWaitFor(duration),
                &value as *const T as *const u8,
            )
            .map_err(queue_timeout_error)
    }

    /// As [`push`](Self::push), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_push_until(
        &'static self,
        value: T,
        time_point: TickInstant,
    ) -> Result<(), QueueTimeoutError> {
        self.base
            .push(
                SemaphoreWait::TryWaitUntil(time_point),
                &value as *const T as *const u8,
            )
            .map_err(queue_timeout_error)
    }

    /// Remove and return the oldest element, blocking while the queue is
    /// empty.
    pub fn pop(&'static self) -> Result<T, QueueError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        self.base
            .pop(SemaphoreWait::Wait, out.as_mut_ptr() as *mut u8)
            .map_err(queue_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok(unsafe { out.assume_init() })
    }

    /// As [`pop`](Self::pop), but fail with `Busy` instead of blocking.
    pub fn try_pop(&'static self) -> Result<T, TryQueueError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        self.base
            .pop(SemaphoreWait::TryWait, out.as_mut_ptr() as *mut u8)
            .map_err(try_queue_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok(unsafe { out.assume_init() })
    }

    /// As [`pop`](Self::pop), but give up with `Timeout` after the specified
    /// duration.
    pub fn try_pop_for(&'static self, duration: TickDuration) -> Result<T, QueueTimeoutError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        self.base
            .pop(
                SemaphoreWait::TryWaitFor(duration),
                out.as_mut_ptr() as *mut u8,
            )
            .map_err(queue_timeout_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok(unsafe { out.assume_init() })
    }

    /// As [`pop`](Self::pop), but give up with `Timeout` at the specified
    /// time point.
    pub fn try_pop_until(&'static self, time_point: TickInstant) -> Result<T, QueueTimeoutError> {
        let mut out = mem::MaybeUninit::<T>::uninit();
        self.base
            .pop(
                SemaphoreWait::TryWaitUntil(time_point),
                out.as_mut_ptr() as *mut u8,
            )
            .map_err(queue_timeout_error)?;
        // Safety: `pop` filled `out` with a previously pushed element
        Ok(unsafe { out.assume_init() })
    }
}

/// Internal helper for constructing the `MessageSize` variant of the queue
/// error types.
pub(crate) trait MessageSizeError {
    fn message_size() -> Self;
}

impl MessageSizeError for QueueError {
    fn message_size() -> Self {
        Self::MessageSize
    }
}

impl MessageSizeError for TryQueueError {
    fn message_size() -> Self {
        Self::MessageSize
    }
}

impl MessageSizeError for QueueTimeoutError {
    fn message_size() -> Self {
        Self::MessageSize
    }
}

pub(crate) fn queue_error(code: ResultCode) -> QueueError {
    match code {
        ResultCode::BadContext => QueueError::BadContext,
        _ => unreachable!("unexpected result code for a blocking queue operation"),
    }
}

pub(crate) fn try_queue_error(code: ResultCode) -> TryQueueError {
    match code {
        ResultCode::BadContext => TryQueueError::BadContext,
        ResultCode::Busy => TryQueueError::Busy,
        _ => unreachable!("unexpected result code for a non-blocking queue operation"),
    }
}

pub(crate) fn queue_timeout_error(code: ResultCode) -> QueueTimeoutError {
    match code {
        ResultCode::BadContext => QueueTimeoutError::BadContext,
        ResultCode::Timeout => QueueTimeoutError::Timeout,
        _ => unreachable!("unexpected result code for a timed queue operation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_support, thread::SchedulingPolicy, time::TickDuration};

    #[test]
    fn raw_push_pop_preserves_order() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<12> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 4);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        QUEUE.push(&[1, 2, 3, 4]).unwrap();
        QUEUE.push(&[5, 6, 7, 8]).unwrap();
        QUEUE.push(&[9, 10, 11, 12]).unwrap();

        let mut buffer = [0u8; 4];
        QUEUE.pop(&mut buffer).unwrap();
        assert_eq!(buffer, [1, 2, 3, 4]);
        QUEUE.pop(&mut buffer).unwrap();
        assert_eq!(buffer, [5, 6, 7, 8]);
        QUEUE.pop(&mut buffer).unwrap();
        assert_eq!(buffer, [9, 10, 11, 12]);
    }

    #[test]
    fn wraparound_keeps_order() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<4> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 2);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let mut buffer = [0u8; 2];
        for round in 0u8..5 {
            QUEUE.push(&[round, round]).unwrap();
            QUEUE.push(&[round + 100, round + 100]).unwrap();
            QUEUE.pop(&mut buffer).unwrap();
            assert_eq!(buffer, [round, round]);
            QUEUE.pop(&mut buffer).unwrap();
            assert_eq!(buffer, [round + 100, round + 100]);
        }
    }

    #[test]
    fn size_mismatch_is_rejected_without_side_effects() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<8> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 4);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        assert_eq!(QUEUE.push(&[1, 2, 3]), Err(QueueError::MessageSize));
        assert_eq!(QUEUE.try_push(&[1; 5]), Err(TryQueueError::MessageSize));

        let mut buffer = [0u8; 2];
        assert_eq!(QUEUE.pop(&mut buffer), Err(QueueError::MessageSize));

        // Nothing was enqueued by the failed attempts
        let mut buffer = [0u8; 4];
        assert_eq!(QUEUE.try_pop(&mut buffer), Err(TryQueueError::Busy));
    }

    #[test]
    fn try_operations_report_busy() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<2> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 1);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        let mut buffer = [0u8; 1];
        assert_eq!(QUEUE.try_pop(&mut buffer), Err(TryQueueError::Busy));

        QUEUE.try_push(&[7]).unwrap();
        QUEUE.try_push(&[8]).unwrap();
        assert_eq!(QUEUE.try_push(&[9]), Err(TryQueueError::Busy));

        QUEUE.try_pop(&mut buffer).unwrap();
        assert_eq!(buffer, [7]);
    }

    #[test]
    fn blocked_pop_is_woken_by_interrupt_push() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<4> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 1);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        SystemTraits::queue_interrupt(|| QUEUE.try_push(&[42]).unwrap());

        let mut buffer = [0u8; 1];
        QUEUE.pop(&mut buffer).unwrap();
        assert_eq!(buffer, [42]);
    }

    #[test]
    fn timed_pop_times_out_on_empty_queue() {
        define_test_kernel!(SystemTraits);
        static STORAGE: QueueStorage<4> = QueueStorage::new();
        static QUEUE: RawFifoQueue<SystemTraits> = RawFifoQueue::new(&STORAGE, 1);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        for _ in 0..3 {
            SystemTraits::queue_interrupt(|| SystemTraits::tick());
        }

        let mut buffer = [0u8; 1];
        assert_eq!(
            QUEUE.try_pop_for(&mut buffer, TickDuration::from_ticks(2)),
            Err(QueueTimeoutError::Timeout)
        );

        // The pop semaphore was restored: a later push-then-pop works
        QUEUE.try_push(&[1]).unwrap();
        QUEUE.try_pop(&mut buffer).unwrap();
    }

    #[test]
    fn typed_queue_roundtrip() {
        define_test_kernel!(SystemTraits);
        static STORAGE: FifoQueueStorage<u32, 3> = FifoQueueStorage::new();
        static QUEUE: FifoQueue<SystemTraits, u32> = FifoQueue::new(&STORAGE);

        let main = test_support::leak_thread(200, SchedulingPolicy::Fifo);
        test_support::adopt_main::<SystemTraits>(main);

        QUEUE.push(0xdead_beef).unwrap();
        QUEUE.push(1).unwrap();
        assert_eq!(QUEUE.pop(), Ok(0xdead_beef));
        assert_eq!(QUEUE.pop(), Ok(1));
        assert_eq!(QUEUE.try_pop(), Err(TryQueueError::Busy));
    }
}
