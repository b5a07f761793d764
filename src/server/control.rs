//! Control router
//!
//! Text frames from a client are parsed once into a [`ControlMessage`] and
//! answered with exactly one [`ServerEvent`], sent to that client only.
//! Anything that does not parse is ignored.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, ClientRegistry, Outbound};
use crate::codec::OpusDecoder;
use crate::config::{AppConfig, OpusConfig, StreamMode, WireFormat};
use crate::constants::BYTES_PER_SAMPLE;
use crate::protocol::{CodecInfo, ControlMessage, ServerEvent, StreamCodec};
use crate::recording::RecordingController;

/// Stream parameters reported in `codec_info`
#[derive(Debug, Clone)]
struct StreamParams {
    sample_rate: u32,
    channels: u16,
    /// Samples per channel in one PCM frame
    pcm_frame_size: usize,
    /// Samples per channel in one Opus frame
    opus_frame_size: usize,
    opus_bitrate: u32,
}

impl StreamParams {
    fn codec_info(&self, codec: StreamCodec) -> CodecInfo {
        match codec {
            StreamCodec::Pcm => CodecInfo {
                codec,
                sample_rate: self.sample_rate,
                channels: self.channels,
                frame_size: self.pcm_frame_size,
                bitrate: self.sample_rate * self.channels as u32 * (BYTES_PER_SAMPLE as u32 * 8),
            },
            StreamCodec::Opus => CodecInfo {
                codec,
                sample_rate: self.sample_rate,
                channels: self.channels,
                frame_size: self.opus_frame_size,
                bitrate: self.opus_bitrate,
            },
        }
    }
}

/// Dispatches control messages to codec negotiation and the recorder
pub struct ControlRouter {
    registry: Arc<ClientRegistry>,
    recorder: Arc<RecordingController>,
    mode: StreamMode,
    stream: StreamParams,
    mic: StreamParams,
    allow_compressed_mic: bool,
}

impl ControlRouter {
    pub fn new(config: &AppConfig, registry: Arc<ClientRegistry>, recorder: Arc<RecordingController>) -> Self {
        let stream = StreamParams {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            pcm_frame_size: config.capture_read_bytes() / config.audio.bytes_per_sample_frame(),
            opus_frame_size: config.opus_frame_size(),
            opus_bitrate: config.opus.bitrate,
        };
        let mic_frame_size = OpusConfig::frame_size_from_ms(config.mic.sample_rate, config.opus.frame_duration_ms);
        let mic = StreamParams {
            sample_rate: config.mic.sample_rate,
            channels: config.mic.channels,
            pcm_frame_size: mic_frame_size,
            opus_frame_size: mic_frame_size,
            opus_bitrate: config.opus.bitrate,
        };

        Self {
            registry,
            recorder,
            mode: config.stream.mode,
            stream,
            mic,
            allow_compressed_mic: config.mic.allow_compressed,
        }
    }

    /// Whether the pipeline produces `codec` in this mode
    pub fn is_available(&self, codec: StreamCodec) -> bool {
        match codec {
            StreamCodec::Pcm => self.mode.uses_pcm(),
            StreamCodec::Opus => self.mode.uses_opus(),
        }
    }

    /// Parameters of the outbound stream for `codec`
    pub fn codec_info(&self, codec: StreamCodec) -> CodecInfo {
        self.stream.codec_info(codec)
    }

    /// Handle one text frame and send the reply back to `client`
    pub async fn route(&self, client: ClientId, text: &str) {
        let Some(event) = self.dispatch(client, text).await else {
            return;
        };

        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize reply");
                return;
            }
        };

        // An unreachable client is reaped by the next broadcast
        if let Err(e) = self.registry.send_to(client, Outbound::Text(json)) {
            debug!(client = %client, error = %e, "Reply not delivered");
        }
    }

    /// Parse and handle one text frame. `None` for anything unparseable.
    pub async fn dispatch(&self, client: ClientId, text: &str) -> Option<ServerEvent> {
        match ControlMessage::parse(text) {
            Ok(message) => Some(self.handle(client, message).await),
            Err(e) => {
                debug!(client = %client, error = %e, "Ignoring control message");
                None
            }
        }
    }

    pub async fn handle(&self, client: ClientId, message: ControlMessage) -> ServerEvent {
        match message {
            ControlMessage::Negotiate { version, codec } => self.negotiate(client, version, codec),
            ControlMessage::MicCodec { codec } => self.set_mic_codec(client, codec),
            ControlMessage::StartRecording => match self.recorder.start_recording().await {
                Ok(filename) => ServerEvent::RecordingStarted { filename },
                Err(e) => {
                    warn!(client = %client, error = %e, "start_recording failed");
                    ServerEvent::RecordingError { error: e.code() }
                }
            },
            ControlMessage::StopRecording => match self.recorder.stop_recording().await {
                Ok(filename) => ServerEvent::RecordingStopped { filename },
                Err(e) => ServerEvent::RecordingError { error: e.code() },
            },
            ControlMessage::RecordingStatus => {
                let status = self.recorder.status().await;
                ServerEvent::RecordingStatus {
                    recording: status.recording,
                    filename: status.filename,
                }
            }
        }
    }

    fn negotiate(&self, client: ClientId, version: u32, requested: StreamCodec) -> ServerEvent {
        let wire_format = if version >= 2 { WireFormat::Framed } else { WireFormat::Bare };
        if self.registry.set_wire_format(client, wire_format).is_err() {
            debug!(client = %client, "Negotiation from a client that already left");
        }

        let current = self.registry.codec(client).unwrap_or_else(|| self.registry.default_codec());
        let effective = if !self.is_available(requested) {
            warn!(client = %client, codec = %requested, mode = ?self.mode, "Codec not produced in this mode");
            current
        } else {
            match self.registry.set_codec(client, requested) {
                Ok(previous) => {
                    info!(client = %client, "Codec {} -> {} ({:?})", previous, requested, wire_format);
                    requested
                }
                Err(_) => current,
            }
        };

        ServerEvent::CodecInfo(self.codec_info(effective))
    }

    fn set_mic_codec(&self, client: ClientId, requested: StreamCodec) -> ServerEvent {
        let effective = match requested {
            StreamCodec::Opus if self.allow_compressed_mic => {
                match OpusDecoder::new(self.mic.sample_rate, self.mic.channels, self.mic.opus_frame_size) {
                    Ok(decoder) => match self.registry.install_mic_decoder(client, decoder) {
                        Ok(()) => StreamCodec::Opus,
                        Err(e) => {
                            debug!(client = %client, error = %e, "Mic codec change from a client that already left");
                            StreamCodec::Pcm
                        }
                    },
                    Err(e) => {
                        warn!(client = %client, error = %e, "Mic decoder unavailable");
                        self.clear_mic(client);
                        StreamCodec::Pcm
                    }
                }
            }
            StreamCodec::Opus => {
                info!(client = %client, "Compressed mic audio disabled, staying on pcm");
                self.clear_mic(client);
                StreamCodec::Pcm
            }
            StreamCodec::Pcm => {
                self.clear_mic(client);
                StreamCodec::Pcm
            }
        };

        info!(client = %client, codec = %effective, "Mic codec set");
        ServerEvent::CodecInfo(self.mic.codec_info(effective))
    }

    fn clear_mic(&self, client: ClientId) {
        if let Err(e) = self.registry.clear_mic_decoder(client) {
            debug!(client = %client, error = %e, "Mic codec change from a client that already left");
        }
    }
}
