//! JSON control channel
//!
//! Inbound text frames are parsed once into [`ControlMessage`]; everything
//! downstream matches on the enum. Outbound replies are [`ServerEvent`]s.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::frame::FrameType;

/// Codec a client receives (or, for the mic, sends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCodec {
    Pcm,
    Opus,
}

impl StreamCodec {
    /// Case-insensitive parse of `"pcm"` / `"opus"`
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pcm" => Some(StreamCodec::Pcm),
            "opus" => Some(StreamCodec::Opus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamCodec::Pcm => "pcm",
            StreamCodec::Opus => "opus",
        }
    }

    /// Frame type carrying this codec on the wire
    pub fn frame_type(&self) -> FrameType {
        match self {
            StreamCodec::Pcm => FrameType::Pcm,
            StreamCodec::Opus => FrameType::Opus,
        }
    }
}

impl std::fmt::Display for StreamCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized client → server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `{"version":2,"codec":"pcm"}`
    Negotiate { version: u32, codec: StreamCodec },
    StartRecording,
    StopRecording,
    RecordingStatus,
    /// `{"action":"mic_codec","codec":"opus"}`
    MicCodec { codec: StreamCodec },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Negotiate { version: u32, codec: String },
    Action(WireAction),
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WireAction {
    StartRecording,
    StopRecording,
    RecordingStatus,
    MicCodec { codec: String },
}

impl ControlMessage {
    /// Parse a text frame. Unknown actions and codecs are parse failures.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireMessage =
            serde_json::from_str(text).map_err(|e| ProtocolError::ControlParse(e.to_string()))?;

        let codec = |name: &str| {
            StreamCodec::parse(name)
                .ok_or_else(|| ProtocolError::ControlParse(format!("unknown codec {:?}", name)))
        };

        Ok(match wire {
            WireMessage::Negotiate { version, codec: name } => ControlMessage::Negotiate {
                version,
                codec: codec(&name)?,
            },
            WireMessage::Action(WireAction::StartRecording) => ControlMessage::StartRecording,
            WireMessage::Action(WireAction::StopRecording) => ControlMessage::StopRecording,
            WireMessage::Action(WireAction::RecordingStatus) => ControlMessage::RecordingStatus,
            WireMessage::Action(WireAction::MicCodec { codec: name }) => {
                ControlMessage::MicCodec { codec: codec(&name)? }
            }
        })
    }
}

/// Parameters of the codec a client is being served
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub codec: StreamCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one frame
    pub frame_size: usize,
    /// Bits per second
    pub bitrate: u32,
}

/// Server → client reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    RecordingStarted { filename: String },
    RecordingStopped { filename: String },
    RecordingError { error: String },
    RecordingStatus { recording: bool, filename: Option<String> },
    CodecInfo(CodecInfo),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_parse_actions() {
        assert_eq!(
            ControlMessage::parse(r#"{"action":"start_recording"}"#).unwrap(),
            ControlMessage::StartRecording
        );
        assert_eq!(
            ControlMessage::parse(r#"{"action":"stop_recording"}"#).unwrap(),
            ControlMessage::StopRecording
        );
        assert_eq!(
            ControlMessage::parse(r#"{"action":"recording_status","extra":1}"#).unwrap(),
            ControlMessage::RecordingStatus
        );
        assert_eq!(
            ControlMessage::parse(r#"{"action":"mic_codec","codec":"opus"}"#).unwrap(),
            ControlMessage::MicCodec { codec: StreamCodec::Opus }
        );
    }

    #[test]
    fn test_parse_negotiation() {
        assert_eq!(
            ControlMessage::parse(r#"{"version":2,"codec":"PCM"}"#).unwrap(),
            ControlMessage::Negotiate { version: 2, codec: StreamCodec::Pcm }
        );
        assert_eq!(
            ControlMessage::parse(r#"{"version":1,"codec":"opus"}"#).unwrap(),
            ControlMessage::Negotiate { version: 1, codec: StreamCodec::Opus }
        );
    }

    #[test]
    fn test_parse_rejects() {
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"action":"reboot"}"#,
            r#"{"version":2,"codec":"mp3"}"#,
            r#"{"action":"mic_codec"}"#,
            r#"{"hello":"world"}"#,
        ] {
            let err = ControlMessage::parse(text).unwrap_err();
            assert!(matches!(err, ProtocolError::ControlParse(_)), "{}", text);
        }
    }

    #[test]
    fn test_event_shapes() {
        let event = ServerEvent::RecordingStatus { recording: false, filename: None };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "recording_status", "recording": false, "filename": null}));

        let event = ServerEvent::RecordingError { error: "already_recording".into() };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"event": "recording_error", "error": "already_recording"}));

        let event = ServerEvent::CodecInfo(CodecInfo {
            codec: StreamCodec::Opus,
            sample_rate: 48000,
            channels: 2,
            frame_size: 960,
            bitrate: 64000,
        });
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "codec_info",
                "codec": "opus",
                "sample_rate": 48000,
                "channels": 2,
                "frame_size": 960,
                "bitrate": 64000
            })
        );
    }
}
