//! `CallbackEngine`: the real-time entry point.
//!
//! ## Hot path
//!
//! ```text
//! hardware tick
//!     └─► on_audio_ready(dest)
//!             ├─► (first call only) elevate thread priority
//!             └─► FlowController::render(dest)  → always Continue
//! ```
//!
//! The hot path performs no heap allocation and takes only the flow lock,
//! whose holders do index arithmetic and bulk copies. It never returns an
//! error and never asks the backend to stop.
//!
//! ## Threading
//!
//! `CallbackEngine` is `Send + Sync`. Backends hold it as
//! `Arc<CallbackEngine>` inside their render closure while producers call
//! `submit()` from any other thread.

pub mod flow;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
    Arc,
};

use tracing::{debug, info, warn};

use crate::{
    audio::priority::{self, PriorityElevator, PriorityOutcome},
    buffering::{LatencyAdapter, RingBuffer, DEFAULT_CAPACITY_FRAMES},
    clock::Clock,
    error::{PlayoutError, Result},
    ipc::events::StreamStats,
};

use self::flow::{FlowConfig, FlowController};

/// Value returned to the backend after every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CallbackResult {
    /// Keep the stream running.
    Continue,
}

/// Configuration for `CallbackEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Initial ring capacity. Usually replaced once the device reports its
    /// burst size. Default: 2048.
    pub capacity_frames: usize,
    /// Interleaved channels per frame. Default: 2.
    pub channels: usize,
    /// Used for latency figures in stats. Default: 48000.
    pub sample_rate: u32,
    pub flow: FlowConfig,
    /// Called once from inside the first callback.
    /// Default: `priority::elevate_current_thread`.
    pub elevator: PriorityElevator,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capacity_frames: DEFAULT_CAPACITY_FRAMES,
            channels: 2,
            sample_rate: 48_000,
            flow: FlowConfig::default(),
            elevator: priority::elevate_current_thread,
        }
    }
}

const OUTCOME_PENDING: u8 = 0;
const OUTCOME_ELEVATED: u8 = 1;
const OUTCOME_FAILED: u8 = 2;
const OUTCOME_UNSUPPORTED: u8 = 3;

pub struct CallbackEngine {
    flow: FlowController,
    sample_rate: AtomicU32,
    elevator: PriorityElevator,
    /// Check-and-set guard for the one elevation attempt.
    priority_attempted: AtomicBool,
    priority_outcome: AtomicU8,
}

impl CallbackEngine {
    /// # Errors
    /// `PlayoutError::InvalidConfig` for a zero sample rate, zero channels,
    /// zero capacity or an invalid `FlowConfig`.
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.sample_rate == 0 {
            return Err(PlayoutError::invalid("sample rate must be > 0"));
        }
        let ring = RingBuffer::new(config.capacity_frames, config.channels)?;
        let flow = FlowController::new(config.flow, ring, clock)?;

        Ok(Self {
            flow,
            sample_rate: AtomicU32::new(config.sample_rate),
            elevator: config.elevator,
            priority_attempted: AtomicBool::new(false),
            priority_outcome: AtomicU8::new(OUTCOME_PENDING),
        })
    }

    /// Fill `dest` for one hardware tick. Real-time safe.
    pub fn on_audio_ready(&self, dest: &mut [f32]) -> CallbackResult {
        if !self.priority_attempted.swap(true, Ordering::AcqRel) {
            self.elevate();
        }
        self.flow.render(dest);
        CallbackResult::Continue
    }

    /// Producer entry point; see [`FlowController::submit`].
    pub fn submit(&self, samples: &[f32]) -> usize {
        self.flow.submit(samples)
    }

    pub fn clear(&self) {
        self.flow.clear();
    }

    pub fn available_frames(&self) -> usize {
        self.flow.available_frames()
    }

    pub fn stats(&self) -> StreamStats {
        self.flow.stats(self.sample_rate())
    }

    pub fn flow(&self) -> &FlowController {
        &self.flow
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    /// Record the rate the device actually granted.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        if sample_rate > 0 {
            self.sample_rate.store(sample_rate, Ordering::Relaxed);
        }
    }

    /// Size the ring for a newly reported device burst.
    pub fn adapt_to_burst(
        &self,
        adapter: &LatencyAdapter,
        burst_frames: usize,
    ) -> Result<Option<usize>> {
        adapter.adapt(&self.flow, burst_frames)
    }

    /// `None` until the first callback has run.
    pub fn priority_outcome(&self) -> Option<PriorityOutcome> {
        match self.priority_outcome.load(Ordering::Acquire) {
            OUTCOME_ELEVATED => Some(PriorityOutcome::Elevated),
            OUTCOME_FAILED => Some(PriorityOutcome::Failed),
            OUTCOME_UNSUPPORTED => Some(PriorityOutcome::Unsupported),
            _ => None,
        }
    }

    fn elevate(&self) {
        let outcome = (self.elevator)();
        let raw = match outcome {
            PriorityOutcome::Elevated => {
                info!("render thread elevated to real-time priority");
                OUTCOME_ELEVATED
            }
            PriorityOutcome::Failed => {
                warn!("failed to elevate render thread priority (non-fatal)");
                OUTCOME_FAILED
            }
            PriorityOutcome::Unsupported => {
                debug!("real-time priority not supported here");
                OUTCOME_UNSUPPORTED
            }
        };
        self.priority_outcome.store(raw, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::ManualClock;

    static ELEVATIONS: AtomicUsize = AtomicUsize::new(0);

    fn counting_elevator() -> PriorityOutcome {
        ELEVATIONS.fetch_add(1, Ordering::SeqCst);
        PriorityOutcome::Failed
    }

    fn engine(config: EngineConfig) -> CallbackEngine {
        CallbackEngine::new(config, Arc::new(ManualClock::new(0))).unwrap()
    }

    #[test]
    fn priority_is_attempted_exactly_once() {
        let engine = engine(EngineConfig {
            elevator: counting_elevator,
            ..EngineConfig::default()
        });
        assert_eq!(engine.priority_outcome(), None);

        let mut out = vec![0.0; 64];
        for _ in 0..5 {
            assert_eq!(engine.on_audio_ready(&mut out), CallbackResult::Continue);
        }
        assert_eq!(ELEVATIONS.load(Ordering::SeqCst), 1);
        assert_eq!(engine.priority_outcome(), Some(PriorityOutcome::Failed));
    }

    #[test]
    fn callback_renders_submitted_audio() {
        let engine = engine(EngineConfig {
            channels: 1,
            capacity_frames: 32,
            elevator: priority::no_elevation,
            ..EngineConfig::default()
        });
        assert_eq!(engine.submit(&[0.5; 8]), 8);

        let mut out = vec![1.0; 12];
        engine.on_audio_ready(&mut out);
        assert!(out[..8].iter().all(|s| *s == 0.5));
        assert!(out[8..].iter().all(|s| *s == 0.0));
        assert_eq!(engine.available_frames(), 0);
    }

    #[test]
    fn stats_use_current_sample_rate() {
        let engine = engine(EngineConfig {
            channels: 1,
            sample_rate: 48_000,
            elevator: priority::no_elevation,
            ..EngineConfig::default()
        });
        engine.submit(&[0.0; 480]);
        approx::assert_relative_eq!(engine.stats().latency_ms, 10.0);

        engine.set_sample_rate(24_000);
        approx::assert_relative_eq!(engine.stats().latency_ms, 20.0);
        engine.set_sample_rate(0);
        assert_eq!(engine.sample_rate(), 24_000);
    }

    #[test]
    fn adapt_to_burst_resizes_ring() {
        let engine = engine(EngineConfig {
            elevator: priority::no_elevation,
            ..EngineConfig::default()
        });
        let resized = engine.adapt_to_burst(&LatencyAdapter::new(2), 128).unwrap();
        assert_eq!(resized, Some(256));
        assert_eq!(engine.stats().capacity_frames, 256);
    }

    #[test]
    fn rejects_zero_sample_rate() {
        let result = CallbackEngine::new(
            EngineConfig {
                sample_rate: 0,
                ..EngineConfig::default()
            },
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(PlayoutError::InvalidConfig(_))));
    }
}
