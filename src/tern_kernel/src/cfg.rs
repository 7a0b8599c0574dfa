//! Compile-time kernel configuration
//!
//! These constants parameterize the kernel the way a board support package
//! would. They are deliberately plain constants rather than runtime settings;
//! the kernel allocates no memory and sizes everything at compile time.

/// The frequency of the kernel timebase, in hertz. One interrupt from the
/// timebase is one *tick*, the unit of all timed operations.
pub const TICK_RATE_HZ: u32 = 1_000;

/// The length of the time slice given to each `RoundRobin` thread, in ticks.
pub const ROUND_ROBIN_QUANTUM: u32 = 1;

/// The capacity of a receiver's queued-signal pool.
pub const SIGNAL_QUEUE_LEN: usize = 8;

/// The capacity of a catcher's signal-action association table.
pub const SIGNAL_ACTION_LEN: usize = 8;

/// The alignment of thread stack storage.
pub const STACK_ALIGN: usize = 16;
