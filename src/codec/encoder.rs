//! In-process Opus encoder
//!
//! Raw-packet backend for the stream pipeline: each exact-size capture chunk
//! becomes one Opus packet with no container around it.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::pcm;
use crate::config::{AppConfig, OpusApplication, OpusConfig};
use crate::error::CodecError;

/// Opus encoder wrapper fed with s16le capture chunks
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    bitrate: u32,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder
    pub fn new(
        sample_rate: u32,
        channels: u16,
        frame_size: usize,
        config: &OpusConfig,
    ) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => return Err(CodecError::EncoderInit(
                format!("Unsupported channel count: {}", channels)
            )),
        };

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(sample_rate, opus_channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, config)?;

        Ok(Self {
            encoder,
            sample_rate,
            channels,
            frame_size,
            bitrate: config.bitrate,
            // Max Opus packet is about 1275 bytes
            encode_buffer: vec![0u8; 4000],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encoder matching the capture format and frame duration
    pub fn from_config(config: &AppConfig) -> Result<Self, CodecError> {
        Self::new(
            config.audio.sample_rate,
            config.audio.channels,
            config.opus_frame_size(),
            &config.opus,
        )
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder.set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder.set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        Ok(())
    }

    /// Encode interleaved samples; length must be `frame_size * channels`
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self.encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Encode one s16le chunk straight from the capture stream
    pub fn encode_pcm(&mut self, chunk: &[u8]) -> Result<Bytes, CodecError> {
        let samples = pcm::samples_from_le_bytes(chunk);
        self.encode(&samples)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Frame size in samples per channel
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Total samples per frame across all channels
    pub fn samples_per_frame(&self) -> usize {
        self.frame_size * self.channels as usize
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_from_defaults() {
        let encoder = OpusEncoder::from_config(&AppConfig::default()).unwrap();
        assert_eq!(encoder.sample_rate(), 48000);
        assert_eq!(encoder.channels(), 2);
        assert_eq!(encoder.frame_size(), 960);
        assert_eq!(encoder.samples_per_frame(), 1920);
    }

    #[test]
    fn test_encode_chunk() {
        let config = AppConfig::default();
        let mut encoder = OpusEncoder::from_config(&config).unwrap();

        let chunk = vec![0u8; config.opus_frame_bytes()];
        let packet = encoder.encode_pcm(&chunk).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < chunk.len());

        let stats = encoder.stats();
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.bytes_produced, packet.len() as u64);
    }

    #[test]
    fn test_wrong_chunk_size() {
        let mut encoder = OpusEncoder::from_config(&AppConfig::default()).unwrap();
        let err = encoder.encode(&[0i16; 100]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrameSize(100)));
    }

    #[test]
    fn test_rejects_surround() {
        assert!(OpusEncoder::new(48000, 6, 960, &OpusConfig::default()).is_err());
    }
}
