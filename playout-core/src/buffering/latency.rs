//! Buffer depth derived from the hardware burst size.
//!
//! Depth is a latency/underrun trade-off that is only known once the device
//! reports its burst (`frames_per_burst`) at stream-open time. The adapter
//! keeps the ring at `burst × multiplier` frames and swaps in a new ring when
//! that target changes. Resizing allocates and is meant for setup and
//! reconfiguration, never for the render callback.

use tracing::info;

use crate::{
    buffering::{RingBuffer, DEFAULT_BURST_MULTIPLIER},
    engine::flow::FlowController,
    error::{PlayoutError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyAdapter {
    multiplier: usize,
}

impl Default for LatencyAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_BURST_MULTIPLIER)
    }
}

impl LatencyAdapter {
    /// A multiplier of 0 is treated as 1.
    pub fn new(multiplier: usize) -> Self {
        Self {
            multiplier: multiplier.max(1),
        }
    }

    pub fn multiplier(&self) -> usize {
        self.multiplier
    }

    pub fn target_frames(&self, burst_frames: usize) -> usize {
        burst_frames.saturating_mul(self.multiplier)
    }

    /// Resize `flow` to follow a newly reported burst size.
    ///
    /// Returns `Some(capacity)` if a new ring was installed, `None` if the
    /// current capacity already matches.
    ///
    /// # Errors
    /// `PlayoutError::InvalidConfig` when `burst_frames` is zero.
    pub fn adapt(&self, flow: &FlowController, burst_frames: usize) -> Result<Option<usize>> {
        if burst_frames == 0 {
            return Err(PlayoutError::invalid("frames per burst must be at least 1"));
        }
        let target = self.target_frames(burst_frames);
        if target == flow.capacity_frames() {
            return Ok(None);
        }
        self.reconfigure(flow, target, None)?;
        info!(
            burst_frames,
            multiplier = self.multiplier,
            capacity_frames = target,
            "ring buffer resized to follow device burst"
        );
        Ok(Some(target))
    }

    /// Install a fresh ring of `capacity_frames`, optionally changing the
    /// channel count. Buffered audio is discarded.
    ///
    /// The replacement is allocated before the flow lock is taken and the
    /// old ring is freed after it is released.
    pub fn reconfigure(
        &self,
        flow: &FlowController,
        capacity_frames: usize,
        channels: Option<usize>,
    ) -> Result<()> {
        let channels = channels.unwrap_or_else(|| flow.channels());
        let replacement = RingBuffer::new(capacity_frames, channels)?;
        let old = flow.replace_ring(replacement);
        drop(old);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{clock::ManualClock, engine::flow::FlowConfig};

    fn flow(capacity: usize, channels: usize) -> FlowController {
        FlowController::new(
            FlowConfig::default(),
            RingBuffer::new(capacity, channels).unwrap(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn target_is_burst_times_multiplier() {
        assert_eq!(LatencyAdapter::new(2).target_frames(192), 384);
        assert_eq!(LatencyAdapter::new(0).target_frames(192), 192);
        assert_eq!(LatencyAdapter::new(0).multiplier(), 1);
    }

    #[test]
    fn adapt_resizes_only_when_target_changes() {
        let flow = flow(2048, 2);
        let adapter = LatencyAdapter::new(2);

        assert_eq!(adapter.adapt(&flow, 96).unwrap(), Some(192));
        assert_eq!(flow.capacity_frames(), 192);
        assert_eq!(flow.channels(), 2);

        assert_eq!(adapter.adapt(&flow, 96).unwrap(), None);
        assert_eq!(flow.capacity_frames(), 192);
    }

    #[test]
    fn adapt_rejects_zero_burst() {
        let flow = flow(64, 1);
        assert!(LatencyAdapter::default().adapt(&flow, 0).is_err());
        assert_eq!(flow.capacity_frames(), 64);
    }

    #[test]
    fn reconfigure_discards_audio_and_changes_channels() {
        let flow = flow(64, 2);
        flow.submit(&[0.5; 40]);
        assert_eq!(flow.available_frames(), 20);

        LatencyAdapter::default().reconfigure(&flow, 128, Some(1)).unwrap();
        assert_eq!(flow.available_frames(), 0);
        assert_eq!(flow.capacity_frames(), 128);
        assert_eq!(flow.channels(), 1);

        assert_eq!(flow.submit(&[0.25; 3]), 3);
        let mut out = [0.0; 3];
        assert_eq!(flow.render(&mut out), 3);
        assert_eq!(out, [0.25; 3]);
    }

    #[test]
    fn reconfigure_rejects_zero_capacity_and_keeps_old_ring() {
        let flow = flow(64, 2);
        assert!(LatencyAdapter::default().reconfigure(&flow, 0, None).is_err());
        assert_eq!(flow.capacity_frames(), 64);
    }
}
