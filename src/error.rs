//! Error types for the audio relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supervised subprocess errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {name}: {source}")]
    SpawnFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited unexpectedly ({status})")]
    Crash { name: String, status: String },

    #[error("{name} has no {pipe} pipe")]
    MissingPipe { name: String, pipe: &'static str },

    #[error("IO error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Wire and container protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Truncated page: expected {expected} bytes, got {got}")]
    TruncatedPage { expected: usize, got: usize },

    #[error("Oversized page: {size} bytes exceeds limit of {limit}")]
    OversizedPage { size: usize, limit: usize },

    #[error("Payload too large for a frame: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unparseable control message: {0}")]
    ControlParse(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(#[source] ProcessError),

    #[error("Playback unavailable: {0}")]
    PlaybackUnavailable(#[source] ProcessError),

    #[error("Audio server not ready after {0} attempts")]
    ServerNotReady(u32),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Mic playback is not running")]
    PlaybackClosed,
}

/// Client transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Client not registered")]
    UnknownClient,

    #[error("Timeout")]
    Timeout,
}

/// Recording state machine errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Recorder failed to start: {0}")]
    Spawn(#[from] ProcessError),

    #[error("Recordings directory unavailable: {0}")]
    Directory(#[source] std::io::Error),
}

impl RecordingError {
    /// Error string sent to clients in `recording_error` events
    pub fn code(&self) -> String {
        match self {
            RecordingError::AlreadyRecording => "already_recording".to_string(),
            RecordingError::NotRecording => "not_recording".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_error_codes() {
        assert_eq!(RecordingError::AlreadyRecording.code(), "already_recording");
        assert_eq!(RecordingError::NotRecording.code(), "not_recording");

        let spawn = RecordingError::Spawn(ProcessError::SpawnFailure {
            name: "recorder".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no ffmpeg"),
        });
        assert!(spawn.code().contains("no ffmpeg"));
    }

    #[test]
    fn test_conversions() {
        let err: Error = ProtocolError::MalformedFrame("short".into()).into();
        assert!(matches!(err, Error::Protocol(ProtocolError::MalformedFrame(_))));

        let err: Error = RecordingError::NotRecording.into();
        assert!(err.to_string().contains("No recording"));
    }
}
