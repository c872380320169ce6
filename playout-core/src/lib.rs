//! # playout-core
//!
//! Adaptive real-time audio ring buffer for low-latency output streams.
//!
//! ## Architecture
//!
//! ```text
//! producer ─► SessionRegistry::submit(id, samples)
//!                  │
//!             StreamSession ─► CallbackEngine::submit ─► FlowController ─► RingBuffer
//!                                                                              │
//! device clock ─► OutputStream ─► CallbackEngine::on_audio_ready ─► FlowController::render
//! ```
//!
//! The render callback never allocates, never fails and never stops the
//! stream: underruns are filled with silence, overruns drop the oldest
//! frames, stalls and index corruption trigger a self-healing reset.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{MockBackend, OutputBackend, OutputStream, StreamRequest};
pub use buffering::{LatencyAdapter, RingBuffer};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::PlayoutConfig;
pub use engine::{
    flow::{FlowConfig, FlowController, FlowState},
    CallbackEngine, CallbackResult, EngineConfig,
};
pub use error::{PlayoutError, Result};
pub use ipc::events::{
    FlowEvent, ResetReason, SessionStatus, SessionStatusEvent, StreamStats,
};
pub use session::{SessionConfig, SessionId, SessionRegistry, StreamSession};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalBackend;
