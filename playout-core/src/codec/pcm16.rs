//! Raw signed 16-bit PCM, either byte order.

use super::{check_packet, ByteOrder, DecoderFactory, PacketDecoder};
use crate::error::{PlayoutError, Result};

pub struct Pcm16Decoder {
    sample_rate: u32,
    channels: usize,
    byte_order: ByteOrder,
}

impl Pcm16Decoder {
    /// Little-endian decoder.
    pub fn new(sample_rate: u32, channels: usize) -> Result<Self> {
        Self::with_byte_order(sample_rate, channels, ByteOrder::Little)
    }

    pub fn with_byte_order(
        sample_rate: u32,
        channels: usize,
        byte_order: ByteOrder,
    ) -> Result<Self> {
        if channels == 0 {
            return Err(PlayoutError::invalid("channel count must be at least 1"));
        }
        Ok(Self {
            sample_rate,
            channels,
            byte_order,
        })
    }
}

impl PacketDecoder for Pcm16Decoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        check_packet("PCM16", packet, 2, self.channels)?;
        let order = self.byte_order;
        Ok(packet
            .chunks_exact(2)
            .map(|b| order.read_i16([b[0], b[1]]) as f32 / 32768.0)
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pcm16Factory {
    byte_order: ByteOrder,
}

impl Pcm16Factory {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }
}

impl Default for Pcm16Factory {
    fn default() -> Self {
        Self::new(ByteOrder::Little)
    }
}

impl DecoderFactory for Pcm16Factory {
    fn name(&self) -> &str {
        "pcm16"
    }

    fn create(&self, sample_rate: u32, channels: usize) -> Result<Box<dyn PacketDecoder>> {
        Ok(Box::new(Pcm16Decoder::with_byte_order(
            sample_rate,
            channels,
            self.byte_order,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn decodes_little_endian_full_scale() {
        let mut decoder = Pcm16Decoder::new(48_000, 1).unwrap();
        let bytes = [0x00, 0x80, 0xff, 0x7f, 0x00, 0x00, 0x00, 0x40];
        let out = decoder.decode(&bytes).unwrap();
        assert_eq!(out.len(), 4);
        assert_relative_eq!(out[0], -1.0);
        assert_relative_eq!(out[1], 32767.0 / 32768.0);
        assert_relative_eq!(out[2], 0.0);
        assert_relative_eq!(out[3], 0.5);
    }

    #[test]
    fn rejects_odd_byte_count() {
        let mut decoder = Pcm16Decoder::new(48_000, 1).unwrap();
        assert!(matches!(
            decoder.decode(&[0, 0, 0]),
            Err(PlayoutError::Codec(_))
        ));
    }

    #[test]
    fn rejects_partial_frames() {
        let mut decoder = Pcm16Decoder::new(48_000, 2).unwrap();
        assert!(matches!(
            decoder.decode(&[0, 0, 0, 0, 0, 0]),
            Err(PlayoutError::Codec(_))
        ));
    }

    #[test]
    fn empty_packet_decodes_to_nothing() {
        let mut decoder = Pcm16Decoder::new(48_000, 2).unwrap();
        assert!(decoder.decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn decodes_big_endian_samples() {
        let mut decoder = Pcm16Decoder::with_byte_order(48_000, 2, ByteOrder::Big).unwrap();
        let out = decoder.decode(&[0x40, 0x00, 0xc0, 0x00]).unwrap();
        assert_relative_eq!(out[0], 0.5);
        assert_relative_eq!(out[1], -0.5);
    }

    #[test]
    fn factory_carries_byte_order() {
        let mut decoder = Pcm16Factory::new(ByteOrder::Big).create(48_000, 1).unwrap();
        assert_relative_eq!(decoder.decode(&[0x20, 0x00]).unwrap()[0], 0.25);
    }

    #[test]
    fn factory_rejects_zero_channels() {
        assert!(Pcm16Factory::default().create(48_000, 0).is_err());
    }
}
