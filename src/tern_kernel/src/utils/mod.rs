//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by port implementations.
mod init;
pub(crate) mod pin;
pub use self::init::*;
