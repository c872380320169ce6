//! Fixed-capacity circular store of interleaved `f32` frames.
//!
//! ```text
//!  storage (capacity_frames × channels floats)
//!  ┌────────────┬──────────────────────┬────────────┐
//!  │ free       │ buffered (available) │ free       │
//!  └────────────┴──────────────────────┴────────────┘
//!               ▲ read_cursor          ▲ write_cursor
//! ```
//!
//! An explicit `available` counter is kept next to the cursors so the whole
//! capacity is usable and a full buffer is never confused with an empty one.
//! Every copy is at most two `copy_from_slice` calls split at the wrap point.

use thiserror::Error;

use crate::error::{PlayoutError, Result};

/// Internal state that failed the consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Inconsistency {
    #[error("available frames {available} outside 0..={capacity}")]
    AvailableOutOfRange { available: usize, capacity: usize },

    #[error("read cursor {cursor} outside 0..{capacity}")]
    ReadCursorOutOfRange { cursor: usize, capacity: usize },

    #[error("write cursor {cursor} outside 0..{capacity}")]
    WriteCursorOutOfRange { cursor: usize, capacity: usize },

    #[error("cursor distance {distance} disagrees with available frames {available}")]
    CursorMismatch { distance: usize, available: usize },
}

/// Single-owner ring of interleaved frames.
///
/// All mutation goes through `&mut self`; the owning `FlowController`
/// serialises the one producer and the one consumer.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Box<[f32]>,
    capacity_frames: usize,
    channels: usize,
    write_cursor: usize,
    read_cursor: usize,
    available: usize,
}

impl RingBuffer {
    /// Allocate a zeroed ring of `capacity_frames` frames.
    ///
    /// # Errors
    /// `PlayoutError::InvalidConfig` when either dimension is zero.
    pub fn new(capacity_frames: usize, channels: usize) -> Result<Self> {
        if capacity_frames == 0 {
            return Err(PlayoutError::invalid("ring capacity must be at least 1 frame"));
        }
        if channels == 0 {
            return Err(PlayoutError::invalid("channel count must be at least 1"));
        }
        let len = capacity_frames
            .checked_mul(channels)
            .ok_or_else(|| PlayoutError::invalid("ring capacity overflows usize"))?;

        Ok(Self {
            storage: vec![0.0; len].into_boxed_slice(),
            capacity_frames,
            channels,
            write_cursor: 0,
            read_cursor: 0,
            available: 0,
        })
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn available_frames(&self) -> usize {
        self.available
    }

    pub fn free_frames(&self) -> usize {
        self.capacity_frames.saturating_sub(self.available)
    }

    /// Copy as many whole frames from `samples` as fit.
    ///
    /// Trailing samples that do not make up a whole frame are ignored.
    /// Returns the number of frames written.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let requested = samples.len() / self.channels;
        let frames = requested.min(self.free_frames());
        if frames == 0 {
            return 0;
        }

        let ch = self.channels;
        let first = frames.min(self.capacity_frames - self.write_cursor);
        let start = self.write_cursor * ch;
        self.storage[start..start + first * ch].copy_from_slice(&samples[..first * ch]);

        let second = frames - first;
        if second > 0 {
            self.storage[..second * ch].copy_from_slice(&samples[first * ch..frames * ch]);
        }

        self.write_cursor = (self.write_cursor + frames) % self.capacity_frames;
        self.available += frames;
        frames
    }

    /// Copy up to `dest.len() / channels` of the oldest frames into `dest`.
    ///
    /// The part of `dest` past the returned frame count is left untouched.
    pub fn read(&mut self, dest: &mut [f32]) -> usize {
        let requested = dest.len() / self.channels;
        let frames = requested.min(self.available);
        if frames == 0 {
            return 0;
        }

        let ch = self.channels;
        let first = frames.min(self.capacity_frames - self.read_cursor);
        let start = self.read_cursor * ch;
        dest[..first * ch].copy_from_slice(&self.storage[start..start + first * ch]);

        let second = frames - first;
        if second > 0 {
            dest[first * ch..frames * ch].copy_from_slice(&self.storage[..second * ch]);
        }

        self.read_cursor = (self.read_cursor + frames) % self.capacity_frames;
        self.available -= frames;
        frames
    }

    /// Skip over up to `frames` of the oldest buffered frames without copying.
    pub fn discard(&mut self, frames: usize) -> usize {
        let n = frames.min(self.available);
        if n == 0 {
            return 0;
        }
        self.read_cursor = (self.read_cursor + n) % self.capacity_frames;
        self.available -= n;
        n
    }

    /// Zero the storage and rewind both cursors.
    pub fn clear(&mut self) {
        self.storage.fill(0.0);
        self.write_cursor = 0;
        self.read_cursor = 0;
        self.available = 0;
    }

    /// Verify counter and cursor bounds plus their mutual agreement.
    pub fn check_consistency(&self) -> std::result::Result<(), Inconsistency> {
        let capacity = self.capacity_frames;
        if self.available > capacity {
            return Err(Inconsistency::AvailableOutOfRange {
                available: self.available,
                capacity,
            });
        }
        if self.read_cursor >= capacity {
            return Err(Inconsistency::ReadCursorOutOfRange {
                cursor: self.read_cursor,
                capacity,
            });
        }
        if self.write_cursor >= capacity {
            return Err(Inconsistency::WriteCursorOutOfRange {
                cursor: self.write_cursor,
                capacity,
            });
        }
        let distance = (self.write_cursor + capacity - self.read_cursor) % capacity;
        if distance != self.available % capacity {
            return Err(Inconsistency::CursorMismatch {
                distance,
                available: self.available,
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cursors(&self) -> (usize, usize) {
        (self.read_cursor, self.write_cursor)
    }

    /// Overwrite the raw indices, bypassing every invariant.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, read_cursor: usize, write_cursor: usize, available: usize) {
        self.read_cursor = read_cursor;
        self.write_cursor = write_cursor;
        self.available = available;
    }
}
