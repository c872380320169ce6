//! Raw IEEE-754 float32 samples, passed through unscaled.

use super::{check_packet, ByteOrder, DecoderFactory, PacketDecoder};
use crate::error::{PlayoutError, Result};

pub struct F32Decoder {
    sample_rate: u32,
    channels: usize,
    byte_order: ByteOrder,
}

impl F32Decoder {
    pub fn new(sample_rate: u32, channels: usize, byte_order: ByteOrder) -> Result<Self> {
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

impl PacketDecoder for F32Decoder {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>> {
        check_packet("float32", packet, 4, self.channels)?;
        let order = self.byte_order;
        Ok(packet
            .chunks_exact(4)
            .map(|b| order.read_f32([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct F32Factory {
    byte_order: ByteOrder,
}

impl F32Factory {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }
}

impl Default for F32Factory {
    fn default() -> Self {
        Self::new(ByteOrder::Little)
    }
}

impl DecoderFactory for F32Factory {
    fn name(&self) -> &str {
        "float32"
    }

    fn create(&self, sample_rate: u32, channels: usize) -> Result<Box<dyn PacketDecoder>> {
        Ok(Box::new(F32Decoder::new(sample_rate, channels, self.byte_order)?))
    }
}
