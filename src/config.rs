//! Application configuration
//!
//! Loaded from TOML. Every section falls back to defaults that match the
//! reference deployment (PulseAudio null sink `webcode_null`, mic sink
//! `webcode_input`, WebSocket on port 10006).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub stream: StreamConfig,
    pub opus: OpusConfig,
    pub mic: MicConfig,
    pub recording: RecordingConfig,
    pub pulse: PulseConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, the per-user config file, or defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Per-user config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "audio-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        for (what, channels) in [("audio", self.audio.channels), ("mic", self.mic.channels)] {
            if !(1..=2).contains(&channels) {
                return Err(Error::Config(format!(
                    "{}.channels must be 1 or 2, got {}",
                    what, channels
                )));
            }
        }

        if self.stream.mode.uses_opus() || self.mic.allow_compressed {
            if !OPUS_SAMPLE_RATES.contains(&self.audio.sample_rate) {
                return Err(Error::Config(format!(
                    "Opus does not support a sample rate of {} Hz",
                    self.audio.sample_rate
                )));
            }
            if self.mic.allow_compressed && !OPUS_SAMPLE_RATES.contains(&self.mic.sample_rate) {
                return Err(Error::Config(format!(
                    "Opus does not support a mic sample rate of {} Hz",
                    self.mic.sample_rate
                )));
            }
            if !OPUS_FRAME_DURATIONS_MS.contains(&self.opus.frame_duration_ms) {
                return Err(Error::Config(format!(
                    "Invalid Opus frame duration: {} ms",
                    self.opus.frame_duration_ms
                )));
            }
        }

        let chunk = self.audio.pcm_chunk_bytes;
        if chunk == 0 || chunk > u16::MAX as usize || chunk % self.audio.bytes_per_sample_frame() != 0 {
            return Err(Error::Config(format!(
                "audio.pcm_chunk_bytes must be a non-zero multiple of {} no larger than {}, got {}",
                self.audio.bytes_per_sample_frame(),
                u16::MAX,
                chunk
            )));
        }

        if self.opus_frame_bytes() > u16::MAX as usize {
            return Err(Error::Config("Opus frame does not fit a PCM frame".into()));
        }

        // A lacing table cannot describe more than 255 * 255 bytes, so any
        // limit at or above 65025 never drops a page
        if self.stream.max_page_bytes == 0 {
            return Err(Error::Config("stream.max_page_bytes must be non-zero".into()));
        }

        if self.pulse.provision {
            let monitor = format!("{}.monitor", self.pulse.null_sink);
            if self.audio.monitor_source != monitor {
                return Err(Error::Config(format!(
                    "audio.monitor_source {:?} does not match provisioned sink {:?}",
                    self.audio.monitor_source, monitor
                )));
            }
            if self.mic.sink != self.pulse.input_sink {
                return Err(Error::Config(format!(
                    "mic.sink {:?} does not match provisioned sink {:?}",
                    self.mic.sink, self.pulse.input_sink
                )));
            }
        }

        if !is_geometry(&self.recording.default_geometry) {
            return Err(Error::Config(format!(
                "recording.default_geometry must look like 1920x1080, got {:?}",
                self.recording.default_geometry
            )));
        }

        Ok(())
    }

    /// Samples per channel in one encoder frame
    pub fn opus_frame_size(&self) -> usize {
        OpusConfig::frame_size_from_ms(self.audio.sample_rate, self.opus.frame_duration_ms)
    }

    /// Bytes of s16le capture data in one encoder frame
    pub fn opus_frame_bytes(&self) -> usize {
        self.opus_frame_size() * self.audio.bytes_per_sample_frame()
    }

    /// Exact read size used on the capture stream for the configured mode
    pub fn capture_read_bytes(&self) -> usize {
        match self.stream.mode {
            StreamMode::Passthrough => self.audio.pcm_chunk_bytes,
            StreamMode::Transcoded | StreamMode::Dual => self.opus_frame_bytes(),
        }
    }

    /// Environment applied to every audio subprocess
    pub fn pulse_env(&self) -> Vec<(String, String)> {
        self.pulse
            .server
            .as_ref()
            .map(|server| vec![("PULSE_SERVER".to_string(), server.clone())])
            .unwrap_or_default()
    }
}

/// `WxH` with both sides numeric
pub fn is_geometry(value: &str) -> bool {
    match value.split_once('x') {
        Some((w, h)) => {
            !w.is_empty()
                && !h.is_empty()
                && w.bytes().all(|b| b.is_ascii_digit())
                && h.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// WebSocket / HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Upper bound on a single socket write
    pub send_timeout_ms: u64,
    /// Outbound messages buffered per client before it counts as failed
    pub client_queue: usize,
    /// Wire format for clients that never negotiate
    pub default_wire_format: WireFormat,
    /// Optional directory of static client files
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_WS_PORT)),
            send_timeout_ms: 2000,
            client_queue: 64,
            default_wire_format: WireFormat::Framed,
            static_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Outbound framing for binary audio messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `[type:u16][length:u16]` header followed by the payload
    Framed,
    /// Payload bytes only
    Bare,
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Monitor source the capture process records from
    pub monitor_source: String,
    pub capture_program: String,
    pub latency_msec: u32,
    /// Extra arguments appended to the capture command
    pub capture_args: Vec<String>,
    /// Read size in pass-through mode
    pub pcm_chunk_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            monitor_source: format!("{}.monitor", DEFAULT_NULL_SINK),
            capture_program: "pacat".to_string(),
            latency_msec: 10,
            capture_args: vec![
                "--property=buffer_time=25000".to_string(),
                "--property=fragment_time=8533".to_string(),
            ],
            pcm_chunk_bytes: DEFAULT_PCM_CHUNK_BYTES,
        }
    }
}

impl AudioConfig {
    /// Bytes in one interleaved s16le sample frame
    pub fn bytes_per_sample_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }
}

/// Which encoded streams the pipeline produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Raw PCM chunks only
    Passthrough,
    /// Opus packets only
    Transcoded,
    /// PCM to pcm clients and Opus to opus clients
    Dual,
}

impl StreamMode {
    pub fn uses_opus(&self) -> bool {
        matches!(self, StreamMode::Transcoded | StreamMode::Dual)
    }

    pub fn uses_pcm(&self) -> bool {
        matches!(self, StreamMode::Passthrough | StreamMode::Dual)
    }
}

/// Opus encoder backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    /// External ffmpeg subprocess emitting an Ogg stream
    Ffmpeg,
    /// In-process libopus emitting raw packets
    Libopus,
}

/// How codec packets are cut out of Ogg pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacketExtraction {
    TocHeuristic,
    Lacing,
}

/// Stream pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub mode: StreamMode,
    pub encoder: EncoderBackend,
    pub packet_extraction: PacketExtraction,
    /// Pages with a larger payload are dropped. Ogg lacing caps a page at
    /// 65025 bytes, so only smaller values have an effect.
    pub max_page_bytes: usize,
    pub restart_on_exit: bool,
    pub restart_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::Dual,
            encoder: EncoderBackend::Ffmpeg,
            packet_extraction: PacketExtraction::TocHeuristic,
            max_page_bytes: MAX_PAGE_BYTES,
            restart_on_exit: true,
            restart_delay_ms: 1000,
        }
    }
}

/// Opus application profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpusApplication {
    Voip,
    Audio,
    LowDelay,
}

impl OpusApplication {
    /// Name understood by ffmpeg's `-application`
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            OpusApplication::Voip => "voip",
            OpusApplication::Audio => "audio",
            OpusApplication::LowDelay => "lowdelay",
        }
    }
}

/// Opus encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusConfig {
    pub application: OpusApplication,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub vbr: bool,
    pub frame_duration_ms: f32,
    /// Program used by the ffmpeg backend
    pub encoder_program: String,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            application: OpusApplication::Voip,
            bitrate: DEFAULT_BITRATE,
            vbr: true,
            frame_duration_ms: DEFAULT_FRAME_SIZE_MS,
            encoder_program: "ffmpeg".to_string(),
        }
    }
}

impl OpusConfig {
    /// Samples per channel for a frame duration
    pub fn frame_size_from_ms(sample_rate: u32, ms: f32) -> usize {
        (sample_rate as f32 * ms / 1000.0) as usize
    }
}

/// Inbound microphone path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicConfig {
    pub enabled: bool,
    /// Sink the playback process writes into
    pub sink: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub latency_msec: u32,
    pub playback_program: String,
    /// Whether clients may switch their mic to Opus
    pub allow_compressed: bool,
    /// Chunks buffered for the playback writer
    pub queue_depth: usize,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sink: DEFAULT_INPUT_SINK.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            latency_msec: 20,
            playback_program: "pacat".to_string(),
            allow_compressed: true,
            queue_depth: 64,
        }
    }
}

/// Screen + audio recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub directory: PathBuf,
    pub extension: String,
    pub program: String,
    /// X11 display to grab
    pub display: String,
    /// Used when the display size cannot be queried
    pub default_geometry: String,
    pub framerate: u32,
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub stop_timeout_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/home/ubuntu/recordings"),
            extension: "mp4".to_string(),
            program: "ffmpeg".to_string(),
            display: std::env::var("DISPLAY").unwrap_or_else(|_| ":1".to_string()),
            default_geometry: std::env::var("VNC_RESOLUTION")
                .ok()
                .filter(|v| is_geometry(v))
                .unwrap_or_else(|| "1920x1080".to_string()),
            framerate: 30,
            video_codec: "libx264".to_string(),
            preset: "fast".to_string(),
            crf: 23,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            stop_timeout_secs: 10,
        }
    }
}

impl RecordingConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// PulseAudio connection and provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Value for `PULSE_SERVER`
    pub server: Option<String>,
    /// Create sinks and sources at startup
    pub provision: bool,
    pub ready_retries: u32,
    pub sink_retries: u32,
    pub null_sink: String,
    pub input_sink: String,
    /// Non-monitor source wrapping the input sink's monitor
    pub mic_source: String,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            server: Some(DEFAULT_PULSE_SERVER.to_string()),
            provision: true,
            ready_retries: 30,
            sink_retries: 10,
            null_sink: DEFAULT_NULL_SINK.to_string(),
            input_sink: DEFAULT_INPUT_SINK.to_string(),
            mic_source: "webcode_mic".to_string(),
        }
    }
}
