//! Platform audio output behind a narrow trait seam.
//!
//! # Design constraints
//!
//! A backend owns the hardware stream and calls
//! [`CallbackEngine::on_audio_ready`] from its render thread. That callback
//! **must not** allocate, block on anything but the short flow lock, or
//! perform I/O; backends must uphold the same contract around it (no
//! per-tick allocation, no logging on the steady-state path).
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms. The cpal backend therefore
//! keeps each stream on a dedicated worker thread and hands out a `Send`
//! command handle implementing [`OutputStream`].

pub mod device;
pub mod mock;
pub mod priority;

#[cfg(feature = "audio-cpal")]
pub mod cpal_backend;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{engine::CallbackEngine, error::Result};

pub use mock::{MockBackend, MockStreamHandle};

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::CpalBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleFormat {
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PerformanceMode {
    /// Let the backend pick its default buffer size.
    Default,
    /// Ask for the smallest buffer the device supports.
    LowLatency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharingMode {
    /// Exclusive access requested; backends fall back to shared silently.
    Exclusive,
    Shared,
}

/// Parameters for opening one hardware stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub direction: Direction,
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: usize,
    pub performance: PerformanceMode,
    pub sharing: SharingMode,
    /// Preferred device name. `None` selects the system default.
    pub device: Option<String>,
}

impl StreamRequest {
    /// Low-latency float output, exclusive if the device allows it.
    pub fn low_latency_output(sample_rate: u32, channels: usize) -> Self {
        Self {
            direction: Direction::Output,
            format: SampleFormat::F32,
            sample_rate,
            channels,
            performance: PerformanceMode::LowLatency,
            sharing: SharingMode::Exclusive,
            device: None,
        }
    }
}

/// Factory for hardware output streams.
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open (but do not start) a stream whose render callback drives
    /// `engine`.
    ///
    /// # Errors
    /// `PlayoutError::StreamOpen`, `NoOutputDevice` or `UnsupportedFormat`.
    fn open(
        &self,
        request: &StreamRequest,
        engine: Arc<CallbackEngine>,
    ) -> Result<Box<dyn OutputStream>>;
}

/// One opened hardware stream.
///
/// `close` must guarantee that no render callback runs after it returns.
pub trait OutputStream: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Frames the device consumes per callback.
    fn frames_per_burst(&self) -> usize;
    fn buffer_size_frames(&self) -> usize;

    /// Request a hardware buffer size; returns the size actually granted.
    fn set_buffer_size_frames(&mut self, frames: usize) -> Result<usize>;

    /// True when the backend's only buffer knob is the callback period, so
    /// `set_buffer_size_frames` also changes `frames_per_burst`.
    fn buffer_is_burst(&self) -> bool {
        false
    }

    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;
    fn sharing(&self) -> SharingMode;
}
