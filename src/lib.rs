//! # Audio Relay
//!
//! Near-real-time duplex audio relay between a PulseAudio monitor source and
//! many WebSocket clients, with server-side screen + audio recording.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               RELAY HOST                                  │
//! │                                                                           │
//! │  ┌──────────────┐   s16le    ┌──────────────────────────────────────┐    │
//! │  │ pacat        │──────────▶ │ Stream Pipeline (audio::pipeline)    │    │
//! │  │ --record     │  exact     │                                      │    │
//! │  │ (capture)    │  chunks    │   PCM chunk ──────────────┐          │    │
//! │  └──────────────┘            │       │                   │          │    │
//! │                              │       ▼                   │          │    │
//! │                              │  ┌──────────┐  Ogg  ┌─────┴──────┐   │    │
//! │                              │  │ ffmpeg   │─────▶ │ Demuxer    │   │    │
//! │                              │  │ libopus  │ pages │ (codec::   │   │    │
//! │                              │  └──────────┘       │  demux)    │   │    │
//! │                              │                     └─────┬──────┘   │    │
//! │                              └───────────────────────────┼──────────┘    │
//! │                                                          │ Frame         │
//! │                                                          ▼               │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │             Client Registry & Broadcaster (clients)                │  │
//! │  │   snapshot ─▶ try_send per client ─▶ remove failed after the pass  │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! │        │ binary frames        ▲ text control         ▲ binary mic        │
//! │        ▼                      │                      │                   │
//! │  ┌────────────────────────────┴──────────────────────┴───────────────┐   │
//! │  │            WebSocket connections (server::websocket)              │   │
//! │  └───────────────────────────────────────────────────────────────────┘   │
//! │          │ control                              │ mic audio              │
//! │          ▼                                      ▼                        │
//! │  ┌──────────────────┐   ┌────────────────┐  ┌──────────────────────┐     │
//! │  │ Control Router   │──▶│ Recording      │  │ Mic Injector         │     │
//! │  │ (server::control)│   │ Controller     │  │ (audio::playback)    │     │
//! │  └──────────────────┘   │ ffmpeg x11grab │  │ Opus decode ─▶ queue │     │
//! │                         └────────────────┘  │ ─▶ pacat --playback  │     │
//! │                                             └──────────────────────┘     │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clients;
pub mod codec;
pub mod config;
pub mod error;
pub mod process;
pub mod protocol;
pub mod recording;
pub mod relay;
pub mod server;

pub use error::{Error, Result};
pub use relay::Relay;

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// s16le
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 64_000;

    /// Default Opus frame duration in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: f32 = 20.0;

    /// Sample rates libopus accepts
    pub const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

    /// Frame durations libopus accepts
    pub const OPUS_FRAME_DURATIONS_MS: [f32; 6] = [2.5, 5.0, 10.0, 20.0, 40.0, 60.0];

    /// Read size for pass-through PCM (~85 ms at 48 kHz stereo)
    pub const DEFAULT_PCM_CHUNK_BYTES: usize = 16384;

    /// Default WebSocket port
    pub const DEFAULT_WS_PORT: u16 = 10006;

    /// Sanity bound on the payload of one container page
    pub const MAX_PAGE_BYTES: usize = 65535;

    /// Null sink whose monitor is captured
    pub const DEFAULT_NULL_SINK: &str = "webcode_null";

    /// Null sink fed by client microphones
    pub const DEFAULT_INPUT_SINK: &str = "webcode_input";

    /// PulseAudio native socket of the desktop user
    pub const DEFAULT_PULSE_SERVER: &str = "unix:/run/user/1000/pulse/native";
}
