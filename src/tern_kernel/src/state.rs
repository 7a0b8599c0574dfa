use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a thread context, return `Err(BadContext)`.
pub(super) fn expect_thread_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_thread_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// Currently identical to [`expect_thread_context`], but blocking operations
/// call this one so that additional non-waitable thread states can be
/// introduced without touching every call site.
pub(super) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    expect_thread_context::<Traits>()
}
