//! Sample storage and latency sizing.
//!
//! `ring` holds the fixed-capacity frame store; `latency` resizes it to
//! follow the hardware burst size.

pub mod latency;
pub mod ring;

pub use latency::LatencyAdapter;
pub use ring::{Inconsistency, RingBuffer};

/// Capacity used when a session is opened without an explicit size
/// (2048 frames ≈ 43 ms at 48 kHz).
pub const DEFAULT_CAPACITY_FRAMES: usize = 2048;

/// Burst-to-capacity multiplier used when none is configured.
pub const DEFAULT_BURST_MULTIPLIER: usize = 2;
