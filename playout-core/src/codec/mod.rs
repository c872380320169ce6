//! Packet decoder abstraction.
//!
//! The `PacketDecoder` trait decouples sessions from any specific codec
//! (raw PCM16, raw float32, Opus, ...). Decoders are stateful, so `decode`
//! takes `&mut self` and the owning session serialises access through a
//! `parking_lot::Mutex<DecoderSlot>`.
//!
//! ## Raw payloads
//!
//! ```text
//! encoding   bytes/sample   scale        default order
//! pcm16      2              i16 / 32768  little (Pcm16Factory::default)
//! float32    4              as-is        little (F32Factory::default)
//! ```
//!
//! Network peers usually send big-endian; [`PayloadFormat`] defaults to
//! big-endian float32 for that reason.

pub mod float32;
pub mod pcm16;

pub use float32::{F32Decoder, F32Factory};
pub use pcm16::{Pcm16Decoder, Pcm16Factory};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PlayoutError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub(crate) fn read_i16(self, bytes: [u8; 2]) -> i16 {
        match self {
            Self::Little => i16::from_le_bytes(bytes),
            Self::Big => i16::from_be_bytes(bytes),
        }
    }

    pub(crate) fn read_f32(self, bytes: [u8; 4]) -> f32 {
        match self {
            Self::Little => f32::from_le_bytes(bytes),
            Self::Big => f32::from_be_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    Pcm16,
    Float32,
}

/// Wire format of the packets handed to `submit_packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PayloadFormat {
    /// Default: `float32`.
    pub encoding: SampleEncoding,
    /// Default: `big`.
    pub byte_order: ByteOrder,
}

impl Default for PayloadFormat {
    fn default() -> Self {
        Self {
            encoding: SampleEncoding::Float32,
            byte_order: ByteOrder::Big,
        }
    }
}

impl PayloadFormat {
    pub fn factory(&self) -> Arc<dyn DecoderFactory> {
        match self.encoding {
            SampleEncoding::Pcm16 => Arc::new(Pcm16Factory::new(self.byte_order)),
            SampleEncoding::Float32 => Arc::new(F32Factory::new(self.byte_order)),
        }
    }
}

/// Reject packets that are not a whole number of frames.
pub(crate) fn check_packet(
    codec: &str,
    packet: &[u8],
    bytes_per_sample: usize,
    channels: usize,
) -> Result<()> {
    if packet.len() % bytes_per_sample != 0 {
        return Err(PlayoutError::Codec(format!(
            "{codec} payload of {} bytes is not a multiple of {bytes_per_sample}",
            packet.len()
        )));
    }
    let samples = packet.len() / bytes_per_sample;
    if samples % channels != 0 {
        return Err(PlayoutError::Codec(format!(
            "{samples} samples do not divide into {channels} channels"
        )));
    }
    Ok(())
}

/// Contract for compressed or raw packet decoders.
pub trait PacketDecoder: Send + 'static {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;

    /// Decode one packet into interleaved `f32` samples.
    ///
    /// # Errors
    /// `PlayoutError::Codec` for malformed packets.
    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>>;

    /// Drop inter-packet state (e.g. after a discontinuity).
    fn reset(&mut self) {}
}

/// Builds decoders for a given stream shape.
pub trait DecoderFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn create(&self, sample_rate: u32, channels: usize) -> Result<Box<dyn PacketDecoder>>;
}

/// Holds at most one decoder and rebuilds it when the stream shape changes.
pub struct DecoderSlot {
    factory: Arc<dyn DecoderFactory>,
    current: Option<Box<dyn PacketDecoder>>,
    created: u64,
}

impl DecoderSlot {
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            factory,
            current: None,
            created: 0,
        }
    }

    /// Decode `packet`, creating a decoder for `(sample_rate, channels)`
    /// first if none exists or the existing one has another shape.
    pub fn decode(
        &mut self,
        sample_rate: u32,
        channels: usize,
        packet: &[u8],
    ) -> Result<Vec<f32>> {
        let matches = self
            .current
            .as_ref()
            .is_some_and(|d| d.sample_rate() == sample_rate && d.channels() == channels);

        if !matches {
            // Release the old decoder before building its replacement.
            self.current = None;
            let decoder = self.factory.create(sample_rate, channels)?;
            self.created += 1;
            debug!(codec = self.factory.name(), sample_rate, channels, "decoder created");
            self.current = Some(decoder);
        }

        match self.current.as_mut() {
            Some(decoder) => decoder.decode(packet),
            None => Ok(Vec::new()),
        }
    }

    /// Number of decoders built over the slot's lifetime.
    pub fn decoders_created(&self) -> u64 {
        self.created
    }

    pub fn reset(&mut self) {
        if let Some(decoder) = self.current.as_mut() {
            decoder.reset();
        }
    }

    /// Drop the current decoder, if any.
    pub fn release(&mut self) {
        self.current = None;
    }
}

impl std::fmt::Debug for DecoderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderSlot")
            .field("codec", &self.factory.name())
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> DecoderSlot {
        DecoderSlot::new(Arc::new(Pcm16Factory::default()))
    }

    #[test]
    fn decoder_is_reused_for_same_shape() {
        let mut slot = slot();
        slot.decode(48_000, 2, &[0, 0, 0, 0]).unwrap();
        slot.decode(48_000, 2, &[0, 0, 0, 0]).unwrap();
        assert_eq!(slot.decoders_created(), 1);
    }

    #[test]
    fn decoder_is_rebuilt_when_shape_changes() {
        let mut slot = slot();
        slot.decode(48_000, 2, &[0, 0, 0, 0]).unwrap();
        slot.decode(24_000, 2, &[0, 0, 0, 0]).unwrap();
        slot.decode(24_000, 1, &[0, 0]).unwrap();
        assert_eq!(slot.decoders_created(), 3);
    }

    #[test]
    fn release_forces_a_fresh_decoder() {
        let mut slot = slot();
        slot.decode(16_000, 1, &[0, 0]).unwrap();
        slot.release();
        slot.decode(16_000, 1, &[0, 0]).unwrap();
        assert_eq!(slot.decoders_created(), 2);
    }

    #[test]
    fn decode_errors_propagate() {
        let mut slot = slot();
        assert!(slot.decode(16_000, 1, &[0, 0, 0]).is_err());
    }

    #[test]
    fn payload_format_defaults_to_big_endian_float32() {
        let format: PayloadFormat = serde_json::from_str("{}").unwrap();
        assert_eq!(format, PayloadFormat::default());
        assert_eq!(format.factory().name(), "float32");

        let mut slot = DecoderSlot::new(format.factory());
        let out = slot.decode(48_000, 1, &0.5f32.to_be_bytes()).unwrap();
        assert_eq!(out, vec![0.5]);
    }

    #[test]
    fn payload_format_builds_pcm16_factory() {
        let format: PayloadFormat =
            serde_json::from_str(r#"{"encoding":"pcm16","byteOrder":"little"}"#).unwrap();
        assert_eq!(format.factory().name(), "pcm16");
        assert_eq!(format.byte_order, ByteOrder::Little);
    }
}
