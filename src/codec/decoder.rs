//! Opus decoder for inbound microphone audio

use bytes::Bytes;
use opus::{Channels, Decoder};

use crate::codec::pcm;
use crate::error::CodecError;

/// Per-client Opus decoder producing s16le PCM for the playback process
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
    /// Packets rejected by libopus
    decode_failures: u64,
}

impl OpusDecoder {
    /// Create a decoder; `frame_size` is the expected samples per channel
    pub fn new(sample_rate: u32, channels: u16, frame_size: usize) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(CodecError::DecoderInit(
                format!("Unsupported channel count: {}", channels)
            )),
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // Room for the longest Opus frame (120 ms)
        let max_frame = (sample_rate as usize * 120 / 1000).max(frame_size);
        let decode_buffer = vec![0i16; max_frame * channels as usize];

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_size,
            decode_buffer,
            frames_decoded: 0,
            decode_failures: 0,
        })
    }

    /// Decode one packet to interleaved s16le bytes
    pub fn decode(&mut self, packet: &[u8]) -> Result<Bytes, CodecError> {
        if packet.is_empty() {
            self.decode_failures += 1;
            return Err(CodecError::DecodingFailed("empty packet".into()));
        }

        let samples = match self.decoder.decode(packet, &mut self.decode_buffer, false) {
            Ok(samples) => samples,
            Err(e) => {
                self.decode_failures += 1;
                return Err(CodecError::DecodingFailed(e.to_string()));
            }
        };

        self.frames_decoded += 1;
        let total = samples * self.channels as usize;
        Ok(pcm::samples_to_le_bytes(&self.decode_buffer[..total]))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Get frame size in samples (per channel)
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OpusEncoder;
    use crate::config::OpusConfig;

    #[test]
    fn test_decoder_creation() {
        assert!(OpusDecoder::new(48000, 2, 960).is_ok());
        assert!(OpusDecoder::new(48000, 3, 960).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = OpusEncoder::new(48000, 2, 960, &OpusConfig::default()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 2, 960).unwrap();

        // 440 Hz sine, same on both channels
        let mut samples = Vec::with_capacity(encoder.samples_per_frame());
        for i in 0..encoder.frame_size() {
            let t = i as f32 / 48000.0;
            let val = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            samples.push(val);
            samples.push(val);
        }

        let packet = encoder.encode(&samples).unwrap();
        let pcm = decoder.decode(&packet).unwrap();

        // 960 samples * 2 channels * 2 bytes
        assert_eq!(pcm.len(), 3840);
        assert_eq!(decoder.frames_decoded(), 1);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let mut decoder = OpusDecoder::new(48000, 2, 960).unwrap();

        assert!(decoder.decode(&[]).is_err());
        // Code 3 TOC with a zero frame count is invalid
        assert!(decoder.decode(&[0xFF, 0x00]).is_err());
        assert_eq!(decoder.decode_failures(), 2);
    }
}
