//! Event and statistics types published to observers.
//!
//! | Type | Transport |
//! |------|-----------|
//! | `FlowEvent` | bounded `crossbeam_channel` per stream (`FlowController::subscribe`) |
//! | `SessionStatusEvent` | `tokio::sync::broadcast` (`SessionRegistry::subscribe_status`) |
//! | `StreamStats` | pulled on demand (`SessionRegistry::stats`) |

use serde::{Deserialize, Serialize};

use crate::session::SessionId;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of one stream's buffer health.
///
/// The first seven fields keep the order of the legacy numeric stats array:
/// available, latency, receiving, underruns, drops, usage, resets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub available_frames: usize,
    /// `available_frames / sample_rate * 1000`.
    pub latency_ms: f32,
    /// Producer activity within the receiving window (2 s by default).
    pub is_receiving: bool,
    pub underruns: u64,
    pub drops: u64,
    /// `available_frames / capacity_frames * 100`.
    pub usage_percent: f32,
    pub resets: u64,
    pub capacity_frames: usize,
    pub callback_count: u64,
}

impl StreamStats {
    /// Flatten into the legacy seven-element numeric layout.
    pub fn to_array(&self) -> [f32; 7] {
        [
            self.available_frames as f32,
            self.latency_ms,
            if self.is_receiving { 1.0 } else { 0.0 },
            self.underruns as f32,
            self.drops as f32,
            self.usage_percent,
            self.resets as f32,
        ]
    }
}

// ---------------------------------------------------------------------------
// Flow events
// ---------------------------------------------------------------------------

/// Why the ring was forcibly emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResetReason {
    /// The periodic consistency check failed.
    Corruption,
    /// The stream stayed silent past the timeout.
    SilenceTimeout,
    /// `clear()` was called by the owner.
    Manual,
}

/// Notable transitions inside a `FlowController`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FlowEvent {
    /// A write did not fit. `evicted_frames` old frames were discarded to
    /// make room and `rejected_frames` of the new write were not stored.
    #[serde(rename_all = "camelCase")]
    Overrun {
        evicted_frames: u64,
        rejected_frames: u64,
    },
    /// Render path trimmed a backlog above the high-water mark.
    PreventiveDrop { frames: u64 },
    /// The ring ran dry.
    SilenceStarted,
    /// Audio flows again after a silence episode.
    Recovered { underruns: u64 },
    /// Ring and transient counters were zeroed.
    Reset { reason: ResetReason, resets: u64 },
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Output stream opened, not yet rendering.
    Opened,
    Started,
    Stopped,
    /// Stream torn down; the id is no longer valid.
    Closed,
    /// Backend reported a failure; the session needs to be reopened.
    Error,
}

/// Broadcast whenever a session changes lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub session: SessionId,
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. backend error message).
    pub detail: Option<String>,
}
