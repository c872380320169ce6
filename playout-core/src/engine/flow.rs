//! Self-healing streaming policy on top of [`RingBuffer`].
//!
//! ## Write path (`submit`, producer thread)
//!
//! ```text
//! 1. Stamp producer activity
//! 2. Not enough room → discard a fraction of the oldest buffered frames
//! 3. Write what fits; count the unwritten remainder as dropped
//! ```
//!
//! ## Read path (`render`, real-time callback)
//!
//! ```text
//! 1. Every N ticks: consistency check → forced reset + silence on failure
//! 2. Empty ring → silence, underrun, maybe stall reset (timeout + cooldown)
//! 3. Read what is buffered, pad the shortfall with silence
//! 4. Above the high-water mark → discard down to the target depth
//! ```
//!
//! The ring is guarded by a `parking_lot::Mutex` that is only ever held
//! around index arithmetic and bulk slice copies. Counters and the
//! available-frame mirror are atomics so observers never touch the lock.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    buffering::{Inconsistency, RingBuffer},
    clock::Clock,
    error::{PlayoutError, Result},
    ipc::events::{FlowEvent, ResetReason, StreamStats},
};

const DEFAULT_CHECK_INTERVAL: u64 = 100;
const NEVER: u64 = u64::MAX;

/// Tunable policy constants. The historical variants of this buffer
/// disagreed on most of these, so none of them are hard-coded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct FlowConfig {
    /// Fraction of the buffered frames discarded when a write does not fit.
    /// Default: 0.25.
    pub overrun_drop_ratio: f32,
    /// Fill level (fraction of capacity) above which the render path trims
    /// latency. Default: 0.75.
    pub high_water_ratio: f32,
    /// Fill level the preventive drop trims down to. Default: 0.5.
    pub target_depth_ratio: f32,
    /// Silence duration after which a latched-silent stream is reset.
    /// Default: 5000 ms.
    pub silence_timeout_ms: u64,
    /// Minimum spacing between two stall resets. Default: 10000 ms.
    pub reset_cooldown_ms: u64,
    /// Run the consistency check every this many render ticks (0 disables).
    /// Default: 100, or `PLAYOUT_CHECK_INTERVAL`.
    pub consistency_check_interval: u64,
    /// Producer counts as "receiving" if active within this window.
    /// Default: 2000 ms.
    pub receiving_window_ms: u64,
    /// Capacity of the flow event queue. Default: 64.
    pub event_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            overrun_drop_ratio: 0.25,
            high_water_ratio: 0.75,
            target_depth_ratio: 0.5,
            silence_timeout_ms: 5_000,
            reset_cooldown_ms: 10_000,
            consistency_check_interval: default_check_interval(),
            receiving_window_ms: 2_000,
            event_capacity: 64,
        }
    }
}

impl FlowConfig {
    /// Reject ratios outside `[0, 1]` and an empty event queue.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("overrunDropRatio", self.overrun_drop_ratio),
            ("highWaterRatio", self.high_water_ratio),
            ("targetDepthRatio", self.target_depth_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PlayoutError::invalid(format!(
                    "{name} must be within 0.0..=1.0 (got {value})"
                )));
            }
        }
        if self.event_capacity == 0 {
            return Err(PlayoutError::invalid("eventCapacity must be at least 1"));
        }
        Ok(())
    }
}

fn default_check_interval() -> u64 {
    static CHECK_INTERVAL: OnceLock<u64> = OnceLock::new();
    *CHECK_INTERVAL.get_or_init(|| {
        std::env::var("PLAYOUT_CHECK_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 10_000))
            .unwrap_or(DEFAULT_CHECK_INTERVAL)
    })
}

/// Per-controller policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowState {
    Normal,
    /// Inside a silence episode (ring ran dry and has not refilled yet).
    Silent,
    /// Only observable within the tick that detected corruption.
    CorruptionSuspected,
}

impl FlowState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Silent,
            2 => Self::CorruptionSuspected,
            _ => Self::Normal,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Silent => 1,
            Self::CorruptionSuspected => 2,
        }
    }
}

pub struct FlowDiagnostics {
    pub ticks: AtomicU64,
    pub underruns: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub resets: AtomicU64,
    pub frames_submitted: AtomicU64,
    pub frames_rendered: AtomicU64,
}

impl Default for FlowDiagnostics {
    fn default() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
        }
    }
}

impl FlowDiagnostics {
    /// Zero every counter except the reset tally.
    pub fn reset_transient(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
        self.frames_submitted.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSnapshot {
    pub ticks: u64,
    pub underruns: u64,
    pub dropped_frames: u64,
    pub resets: u64,
    pub frames_submitted: u64,
    pub frames_rendered: u64,
}

/// Owns one [`RingBuffer`] and every counter describing it.
pub struct FlowController {
    config: FlowConfig,
    ring: Mutex<RingBuffer>,
    clock: Arc<dyn Clock>,
    available: AtomicUsize,
    capacity: AtomicUsize,
    channels: AtomicUsize,
    state: AtomicU8,
    last_activity_ms: AtomicU64,
    last_reset_ms: AtomicU64,
    diagnostics: FlowDiagnostics,
    events_tx: Sender<FlowEvent>,
    events_rx: Receiver<FlowEvent>,
}

impl FlowController {
    /// Wrap `ring` with the given policy.
    ///
    /// # Errors
    /// Returns `PlayoutError::InvalidConfig` if `config` fails validation.
    pub fn new(config: FlowConfig, ring: RingBuffer, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(config.event_capacity);
        let now = clock.now_ms();

        Ok(Self {
            available: AtomicUsize::new(ring.available_frames()),
            capacity: AtomicUsize::new(ring.capacity_frames()),
            channels: AtomicUsize::new(ring.channels()),
            ring: Mutex::new(ring),
            clock,
            state: AtomicU8::new(FlowState::Normal.as_u8()),
            last_activity_ms: AtomicU64::new(now),
            last_reset_ms: AtomicU64::new(NEVER),
            diagnostics: FlowDiagnostics::default(),
            events_tx,
            events_rx,
            config,
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Buffered frames, read without taking the ring lock.
    pub fn available_frames(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn channels(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    pub fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn diagnostics(&self) -> FlowSnapshot {
        self.diagnostics.snapshot()
    }

    /// Receiver for flow events. All clones share one queue.
    pub fn subscribe(&self) -> Receiver<FlowEvent> {
        self.events_rx.clone()
    }

    /// Accept interleaved samples from the producer.
    ///
    /// Returns the number of whole frames stored. Frames that did not fit,
    /// and older frames evicted to make room, are counted as dropped.
    pub fn submit(&self, samples: &[f32]) -> usize {
        let mut ring = self.ring.lock();
        let requested = samples.len() / ring.channels();
        if requested == 0 {
            return 0;
        }

        self.last_activity_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);

        let mut evicted = 0;
        if ring.free_frames() < requested {
            let to_evict =
                (ring.available_frames() as f32 * self.config.overrun_drop_ratio) as usize;
            evicted = ring.discard(to_evict);
        }

        let written = ring.write(samples);
        let rejected = requested - written;
        let buffered = ring.available_frames();
        self.available.store(buffered, Ordering::Release);
        drop(ring);

        self.diagnostics
            .frames_submitted
            .fetch_add(written as u64, Ordering::Relaxed);

        let dropped = evicted + rejected;
        if dropped > 0 {
            self.diagnostics
                .dropped_frames
                .fetch_add(dropped as u64, Ordering::Relaxed);
            if written == 0 {
                warn!(requested, buffered, "ring buffer full: dropped whole write");
            } else {
                debug!(evicted, rejected, buffered, "ring buffer saturated");
            }
            self.publish(FlowEvent::Overrun {
                evicted_frames: evicted as u64,
                rejected_frames: rejected as u64,
            });
        }

        written
    }

    /// Fill `dest` for one hardware tick.
    ///
    /// Always fills the whole destination (buffered frames first, silence
    /// after) and never fails. Returns the number of frames taken from the
    /// ring.
    pub fn render(&self, dest: &mut [f32]) -> usize {
        let ticks = self.diagnostics.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let now = self.clock.now_ms();
        let mut ring = self.ring.lock();

        let interval = self.config.consistency_check_interval;
        if interval > 0 && ticks % interval == 0 {
            if let Err(fault) = ring.check_consistency() {
                self.set_state(FlowState::CorruptionSuspected);
                warn!(%fault, ticks, "ring buffer corruption detected, resetting");
                self.reset_locked(&mut ring, ResetReason::Corruption, now);
                drop(ring);
                dest.fill(0.0);
                return 0;
            }
        }

        let channels = ring.channels();
        let requested = dest.len() / channels;

        if ring.available_frames() == 0 {
            dest.fill(0.0);
            if requested == 0 {
                return 0;
            }
            self.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);

            let latched = self.state() == FlowState::Silent;
            let silent_for = now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed));
            if latched
                && silent_for > self.config.silence_timeout_ms
                && self.cooldown_elapsed(now)
            {
                warn!(silent_for_ms = silent_for, "prolonged silence, resetting ring buffer");
                self.reset_locked(&mut ring, ResetReason::SilenceTimeout, now);
            }
            drop(ring);

            self.set_state(FlowState::Silent);
            if !latched {
                self.publish(FlowEvent::SilenceStarted);
            }
            return 0;
        }

        let frames = ring.read(dest);
        dest[frames * channels..].fill(0.0);

        let capacity = ring.capacity_frames();
        let high_water = (capacity as f32 * self.config.high_water_ratio) as usize;
        let mut trimmed = 0;
        if ring.available_frames() > high_water {
            let target = ((capacity as f32 * self.config.target_depth_ratio) as usize).min(high_water);
            let excess = ring.available_frames() - target;
            trimmed = ring.discard(excess);
        }
        self.available
            .store(ring.available_frames(), Ordering::Release);
        drop(ring);

        if frames < requested {
            self.diagnostics.underruns.fetch_add(1, Ordering::Relaxed);
        }
        if frames > 0 {
            self.diagnostics
                .frames_rendered
                .fetch_add(frames as u64, Ordering::Relaxed);
            self.last_activity_ms.store(now, Ordering::Relaxed);
            if self.state() == FlowState::Silent {
                let underruns = self.diagnostics.underruns.load(Ordering::Relaxed);
                debug!(underruns, "audio recovered");
                self.set_state(FlowState::Normal);
                self.publish(FlowEvent::Recovered { underruns });
            }
        }
        if trimmed > 0 {
            self.diagnostics
                .dropped_frames
                .fetch_add(trimmed as u64, Ordering::Relaxed);
            if trimmed > 256 {
                debug!(trimmed, "preventive drop");
            }
            self.publish(FlowEvent::PreventiveDrop {
                frames: trimmed as u64,
            });
        }

        frames
    }

    /// Empty the ring and zero every counter except the reset tally.
    pub fn force_reset(&self, reason: ResetReason) {
        let now = self.clock.now_ms();
        let mut ring = self.ring.lock();
        self.reset_locked(&mut ring, reason, now);
    }

    pub fn clear(&self) {
        self.force_reset(ResetReason::Manual);
    }

    /// Run the ring's consistency check outside the render cadence.
    pub fn check_consistency(&self) -> std::result::Result<(), Inconsistency> {
        self.ring.lock().check_consistency()
    }

    /// Point-in-time statistics for observers on any thread.
    pub fn stats(&self, sample_rate: u32) -> StreamStats {
        let available = self.available_frames();
        let capacity = self.capacity_frames().max(1);
        let snap = self.diagnostics.snapshot();
        let since_activity = self
            .clock
            .now_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::Relaxed));

        StreamStats {
            available_frames: available,
            latency_ms: if sample_rate == 0 {
                0.0
            } else {
                available as f32 * 1_000.0 / sample_rate as f32
            },
            is_receiving: since_activity < self.config.receiving_window_ms,
            underruns: snap.underruns,
            drops: snap.dropped_frames,
            usage_percent: available as f32 / capacity as f32 * 100.0,
            resets: snap.resets,
            capacity_frames: capacity,
            callback_count: snap.ticks,
        }
    }

    /// Swap in a freshly built ring and hand back the old one.
    ///
    /// The caller allocates before and drops after, so the lock only covers
    /// the move itself.
    pub(crate) fn replace_ring(&self, replacement: RingBuffer) -> RingBuffer {
        let mut ring = self.ring.lock();
        let old = std::mem::replace(&mut *ring, replacement);
        self.available
            .store(ring.available_frames(), Ordering::Release);
        self.capacity
            .store(ring.capacity_frames(), Ordering::Release);
        self.channels.store(ring.channels(), Ordering::Release);
        old
    }

    fn reset_locked(&self, ring: &mut RingBuffer, reason: ResetReason, now: u64) {
        ring.clear();
        self.available.store(0, Ordering::Release);
        self.diagnostics.reset_transient();
        let resets = self.diagnostics.resets.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_reset_ms.store(now, Ordering::Relaxed);
        self.set_state(FlowState::Normal);
        warn!(?reason, resets, "ring buffer reset");
        self.publish(FlowEvent::Reset { reason, resets });
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        let last = self.last_reset_ms.load(Ordering::Relaxed);
        last == NEVER || now.saturating_sub(last) > self.config.reset_cooldown_ms
    }

    fn set_state(&self, state: FlowState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Never blocks: when the queue is full the oldest event is evicted.
    fn publish(&self, event: FlowEvent) {
        if let Err(TrySendError::Full(event)) = self.events_tx.try_send(event) {
            let _ = self.events_rx.try_recv();
            let _ = self.events_tx.try_send(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ring<R>(&self, f: impl FnOnce(&mut RingBuffer) -> R) -> R {
        f(&mut self.ring.lock())
    }
}
