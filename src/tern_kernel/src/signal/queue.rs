//! The bounded queued-signal pool
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    cfg,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    signal::{SignalInformation, SignalInformationCode, SignalSet},
    KernelTraits, Port,
};

/// *Signal information queue control block* - the bounded pool of queued
/// signals for one receiver.
///
/// Queued signals are kept in arrival order, so acceptance is FIFO within
/// each signal number.
pub struct SignalInformationQueueCb<Traits: Port> {
    queue: CpuLockCell<Traits, ArrayVec<SignalInformation, { cfg::SIGNAL_QUEUE_LEN }>>,
}

impl<Traits: Port> SignalInformationQueueCb<Traits> {
    pub const fn new() -> Self {
        Self {
            queue: CpuLockCell::new(ArrayVec::new_const()),
        }
    }
}

impl<Traits: Port> Default for SignalInformationQueueCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for SignalInformationQueueCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalInformationQueueCb")
            .field(
                "queue",
                &self.queue.debug_fmt_with(|x, f| x.as_slice().fmt(f)),
            )
            .finish()
    }
}

impl<Traits: Port> SignalInformationQueueCb<Traits> {
    /// Append a queued signal. Returns `false` if the pool is full.
    pub(super) fn queue_signal(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
        value: u32,
    ) -> bool {
        let queue = self.queue.write(&mut *lock);
        if queue.is_full() {
            return false;
        }
        queue.push(SignalInformation::new(
            signal_number,
            SignalInformationCode::Queued,
            value,
        ));
        true
    }

    /// Remove and return the oldest queued instance of `signal_number`, if
    /// any.
    pub(super) fn accept_queued_signal(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
    ) -> Option<SignalInformation> {
        let queue = self.queue.write(&mut *lock);
        let position = queue
            .iter()
            .position(|information| information.signal_number() == signal_number)?;
        // `remove` (not `swap_remove`) keeps the remaining instances in FIFO
        // order
        Some(queue.remove(position))
    }

    /// Get the set of signals that have at least one queued instance.
    pub(super) fn queued_signal_set(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> SignalSet {
        let mut set = SignalSet::EMPTY;
        for information in self.queue.read(&*lock).iter() {
            set = set.with(information.signal_number());
        }
        set
    }
}
