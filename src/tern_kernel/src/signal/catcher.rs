//! Signal actions, the signal mask, and asynchronous handler delivery
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    cfg,
    klock::{lock_cpu, CpuLockCell, CpuLockTokenRefMut},
    signal::{SignalAction, SignalSet},
    thread::{self, ThreadCb},
    KernelTraits, Port,
};

/// An association between a signal number and the action taken when that
/// signal is caught.
#[derive(Debug, Clone, Copy)]
struct Association {
    signal_number: u8,
    action: SignalAction,
}

/// *Signals catcher control block* - the state data for catching (handling)
/// signals: the association table and the signal mask.
pub struct SignalsCatcherCb<Traits: Port> {
    /// Associations of signal numbers with non-default actions. Signals with
    /// no entry here use the default action (ignore).
    associations: CpuLockCell<Traits, ArrayVec<Association, { cfg::SIGNAL_ACTION_LEN }>>,

    /// The set of signals whose asynchronous delivery is currently blocked.
    signal_mask: CpuLockCell<Traits, SignalSet>,

    /// Set while [`deliver_signals`] is draining this catcher's signals.
    /// Suppresses redundant delivery requests made by mask updates performed
    /// from within the delivery loop.
    delivery_in_progress: CpuLockCell<Traits, bool>,
}

impl<Traits: Port> SignalsCatcherCb<Traits> {
    pub const fn new() -> Self {
        Self {
            associations: CpuLockCell::new(ArrayVec::new_const()),
            signal_mask: CpuLockCell::new(SignalSet::EMPTY),
            delivery_in_progress: CpuLockCell::new(false),
        }
    }
}

impl<Traits: Port> Default for SignalsCatcherCb<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> fmt::Debug for SignalsCatcherCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalsCatcherCb")
            .field(
                "associations",
                &self.associations.debug_fmt_with(|x, f| x.as_slice().fmt(f)),
            )
            .field("signal_mask", &self.signal_mask)
            .field("delivery_in_progress", &self.delivery_in_progress)
            .finish()
    }
}

impl<Traits: KernelTraits> SignalsCatcherCb<Traits> {
    /// Get the action associated with `signal_number`
    /// ([`SignalAction::DEFAULT`] if there is no association).
    pub(super) fn association(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
    ) -> SignalAction {
        self.associations
            .read(&*lock)
            .iter()
            .find(|association| association.signal_number == signal_number)
            .map(|association| association.action)
            .unwrap_or(SignalAction::DEFAULT)
    }

    /// Set the action associated with `signal_number`, returning the previous
    /// one. Setting the default action removes the association. Returns
    /// `Err(())` if the association table is full.
    pub(super) fn set_association(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
        action: SignalAction,
    ) -> Result<SignalAction, ()> {
        let associations = self.associations.write(&mut *lock);

        let position = associations
            .iter()
            .position(|association| association.signal_number == signal_number);

        if action.handler().is_none() {
            // The default action is represented by the absence of an
            // association
            return Ok(match position {
                Some(position) => associations.swap_remove(position).action,
                None => SignalAction::DEFAULT,
            });
        }

        match position {
            Some(position) => {
                let previous = associations[position].action;
                associations[position].action = action;
                Ok(previous)
            }
            None => {
                if associations.is_full() {
                    return Err(());
                }
                associations.push(Association {
                    signal_number,
                    action,
                });
                Ok(SignalAction::DEFAULT)
            }
        }
    }

    pub(super) fn signal_mask(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> SignalSet {
        self.signal_mask.get(&*lock)
    }

    pub(super) fn set_signal_mask_raw(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_mask: SignalSet,
    ) {
        self.signal_mask.replace(&mut *lock, signal_mask);
    }

    pub(super) fn is_delivery_in_progress(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.delivery_in_progress.get(&*lock)
    }

    /// Actions executed after a signal is generated or queued for the
    /// receiver owning this catcher, when the signal is not masked: if the
    /// signal has a non-default action, arrange for [`deliver_signals`] to
    /// run on the target thread. A signal with the default action is ignored.
    pub(super) fn post_generate(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        signal_number: u8,
        thread: &'static ThreadCb<Traits>,
    ) {
        if self
            .association(lock.borrow_mut(), signal_number)
            .handler()
            .is_none()
        {
            // Default action: ignore the signal
            return;
        }

        // Safety: CPU Lock active, and the thread was started (it has a
        // running signals receiver)
        unsafe { Traits::request_function_execution(thread, deliver_signals::<Traits>) };
    }

    /// Request a (re-)delivery after a mask update unmasked pending signals.
    pub(super) fn request_delivery(
        &self,
        _lock: CpuLockTokenRefMut<'_, Traits>,
        thread: &'static ThreadCb<Traits>,
    ) {
        // Safety: CPU Lock active, and the thread was started
        unsafe { Traits::request_function_execution(thread, deliver_signals::<Traits>) };
    }
}

/// Deliver all unmasked caught signals that are pending for the current
/// thread, invoking their handlers on the current (target) thread's stack.
///
/// This function is passed to
/// [`PortThreading::request_function_execution`](crate::PortThreading::request_function_execution)
/// and runs right before the target thread's own code resumes.
pub(super) fn deliver_signals<Traits: KernelTraits>() {
    let Ok(thread) = thread::current_thread::<Traits>() else {
        return;
    };
    let Some(receiver) = thread.attr.signals_receiver else {
        return;
    };
    let Some(catcher) = receiver.catcher() else {
        return;
    };

    let mut lock = lock_cpu::<Traits>().unwrap();
    catcher.delivery_in_progress.replace(&mut *lock, true);
    let signal_mask = catcher.signal_mask(lock.borrow_mut());
    drop(lock);

    loop {
        // Accept the lowest-numbered pending and unmasked signal
        let mut lock = lock_cpu::<Traits>().unwrap();
        let deliverable = receiver.pending_signal_set_inner(lock.borrow_mut()) & !signal_mask;
        let Some(signal_number) = deliverable.lowest_set() else {
            catcher.delivery_in_progress.replace(&mut *lock, false);
            break;
        };
        let information = receiver
            .accept_pending_signal_inner(lock.borrow_mut(), signal_number)
            .unwrap();
        let action = catcher.association(lock.borrow_mut(), signal_number);

        match action.handler() {
            Some(handler) => {
                // Run the handler with the union of the current mask, the
                // action's mask, and the delivered signal itself masked
                let handler_mask = (signal_mask | action.signal_mask()).with(signal_number);
                catcher.set_signal_mask_raw(lock.borrow_mut(), handler_mask);
                drop(lock);

                handler(information);

                // Restore the previous signal mask
                let mut lock = lock_cpu::<Traits>().unwrap();
                catcher.set_signal_mask_raw(lock.borrow_mut(), signal_mask);
            }
            None => {
                // Default action: the signal is consumed and ignored
            }
        }
    }
}
