//! Kernel state locking mechanism
//!
//! The interrupt-masking critical section is represented by [`CpuLockGuard`],
//! an RAII object wrapping the port's interrupt-mask control. There is at
//! most one guard alive per system type; holding it proves that no interrupt
//! handler (and no other kernel path) can observe the protected state.
//!
//! Every piece of kernel-shared state lives in a [`CpuLockCell`], which hands
//! out references only in exchange for the guard's token. Forgetting to mask
//! interrupts around a kernel mutation is therefore a compile error rather
//! than a race.
use core::{fmt, marker::PhantomData, mem};
use tokenlock::UnsyncTokenLock;

use crate::{error::BadContextError, utils::Init, PortThreading};

/// Type-level tag tying one system type's CPU Lock token to its cells, so
/// that tokens of distinct kernel instances cannot be mixed up.
pub(super) struct CpuLockTag<Traits>(PhantomData<Traits>);

/// The singleton token materializing the "interrupts are masked" fact.
pub(super) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type matching [`CpuLockToken`].
pub(super) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Borrowed form of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but occupies no memory.
///
/// Unlike an ordinary `&mut`, it is not reborrowed implicitly when passed to
/// a function; call [`borrow_mut`] at every hand-off.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(super) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// A value that can only be accessed while the CPU Lock is held.
pub struct CpuLockCell<Traits, T: ?Sized> {
    cell: UnsyncTokenLock<T, CpuLockKeyhole<Traits>>,
}

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(super) const fn new(value: T) -> Self {
        Self {
            cell: UnsyncTokenLock::new(CpuLockKeyhole::INIT, value),
        }
    }
}

impl<Traits: PortThreading, T: ?Sized> CpuLockCell<Traits, T> {
    /// Borrow the contents for the duration of the token borrow.
    pub(crate) fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> &'a T {
        self.cell.read(token)
    }

    /// Mutably borrow the contents for the duration of the token borrow.
    pub(crate) fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> &'a mut T {
        self.cell.write(token)
    }
}

impl<Traits: PortThreading, T> CpuLockCell<Traits, T> {
    /// Copy the contents out of the cell.
    pub(crate) fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.cell.read(token).clone()
    }

    /// Store `value`, returning the previous contents.
    pub(crate) fn replace(&self, token: &mut CpuLockToken<Traits>, value: T) -> T {
        mem::replace(self.cell.write(token), value)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { cell: Init::INIT };
}

/// Debug-formatting proxy returned by [`CpuLockCell::debug_fmt_with`].
///
/// Formatting momentarily takes CPU Lock to clone the contents; if the lock
/// is already held (the cell is being printed from inside a critical
/// section), a placeholder is printed instead of deadlocking.
pub(super) struct CellDebugProxy<'a, Traits, T, F> {
    cell: &'a CpuLockCell<Traits, T>,
    format: F,
}

impl<Traits: PortThreading, T: Clone, F: Fn(T, &mut fmt::Formatter<'_>) -> fmt::Result> fmt::Debug
    for CellDebugProxy<'_, Traits, T, F>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => {
                let value = self.cell.get(&lock);
                drop(lock);

                f.write_str("CpuLockCell(")?;
                (self.format)(value, f)?;
                f.write_str(")")
            }
            Err(_) => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

impl<Traits: PortThreading, T: Clone> CpuLockCell<Traits, T> {
    /// Return a proxy that debug-formats the cloned contents with `format`.
    ///
    /// Used by control blocks whose contents aren't `Debug` themselves or
    /// would recurse if printed directly (e.g. `ThreadCb` ↔ `MutexCb`
    /// references).
    pub(super) fn debug_fmt_with<F: Fn(T, &mut fmt::Formatter<'_>) -> fmt::Result>(
        &self,
        format: F,
    ) -> CellDebugProxy<'_, Traits, T, F> {
        CellDebugProxy { cell: self, format }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match lock_cpu::<Traits>() {
            Ok(lock) => {
                f.write_str("CpuLockCell(")?;
                self.cell.read(&*lock).fmt(f)?;
                f.write_str(")")
            }
            Err(_) => f.write_str("CpuLockCell(< locked >)"),
        }
    }
}

/// Enter the CPU Lock state and get an RAII guard for it.
/// Returns `BadContext` if CPU Lock is already active.
pub(super) fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    if Traits::is_cpu_lock_active() {
        // Something up the call stack (or the interrupted context) already
        // holds the interrupt mask
        return Err(BadContextError::BadContext);
    }

    // Safety: CPU Lock is inactive, and it's the kernel asking
    unsafe { Traits::enter_cpu_lock() };

    // Safety: We just entered the CPU Lock state, so no guard can exist yet
    Ok(unsafe { assume_cpu_lock() })
}

/// Materialize a guard for a CPU Lock state that is already in effect.
///
/// # Safety
///
/// CPU Lock must really be active, and no other [`CpuLockGuard`] may exist at
/// the point of the call.
pub(super) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: Upheld by the caller: this is the only guard, hence the
        // only token
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for the CPU Lock state. Leaving the state happens on drop; the
/// contained [`CpuLockToken`] is reached through `Deref`.
pub(super) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] borrowing `self`.
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: The existence of this guard proves CPU Lock is active and
        // owned by the kernel
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> core::ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> core::ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
