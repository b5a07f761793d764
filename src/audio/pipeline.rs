//! Stream pipeline: capture, encode, broadcast
//!
//! One task drives the whole outbound path. Each exact-size capture chunk is
//!
//! - broadcast as a PCM frame to `pcm` clients (pass-through and dual mode),
//! - fed to the Opus stage (transcoded and dual mode).
//!
//! The Opus stage is either the in-process encoder, which turns the chunk
//! into one packet on the spot, or an external ffmpeg writing an Ogg stream
//! that a separate demux task turns back into packets for `opus` clients.
//! If the external encoder dies the Opus stream ends but PCM keeps flowing.

use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::capture::{capture_spec, AudioCapture};
use crate::clients::ClientRegistry;
use crate::codec::{OggDemuxer, OpusEncoder};
use crate::config::{AppConfig, EncoderBackend, StreamMode};
use crate::error::Result;
use crate::process::supervisor::check_exit;
use crate::process::{ProcessSpec, StderrMode, StopMethod, SupervisedProcess};
use crate::protocol::{Frame, StreamCodec};

/// Why a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    Shutdown,
    /// Capture reached end of stream
    CaptureEnded,
    /// The encoder died and nothing else was being streamed
    EncoderExited,
}

/// Counters shared with the status endpoint
#[derive(Debug, Default)]
pub struct PipelineStats {
    pcm_frames: AtomicU64,
    opus_frames: AtomicU64,
    dropped_clients: AtomicU64,
    runs: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub pcm_frames: u64,
    pub opus_frames: u64,
    pub dropped_clients: u64,
    pub runs: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            pcm_frames: self.pcm_frames.load(Ordering::Relaxed),
            opus_frames: self.opus_frames.load(Ordering::Relaxed),
            dropped_clients: self.dropped_clients.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
        }
    }
}

/// ffmpeg reading s16le on stdin and writing Ogg Opus on stdout,
/// one packet per page
pub fn encoder_spec(config: &AppConfig) -> ProcessSpec {
    let opus = &config.opus;
    let page_duration_us = (opus.frame_duration_ms * 1000.0) as u64;

    ProcessSpec::new("encoder", &opus.encoder_program)
        .args([
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            config.audio.sample_rate.to_string(),
            "-ac".to_string(),
            config.audio.channels.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:a".to_string(),
            "libopus".to_string(),
            "-application".to_string(),
            opus.application.ffmpeg_name().to_string(),
            "-frame_duration".to_string(),
            format!("{}", opus.frame_duration_ms),
            "-b:a".to_string(),
            opus.bitrate.to_string(),
            "-vbr".to_string(),
            if opus.vbr { "on" } else { "off" }.to_string(),
            "-page_duration".to_string(),
            page_duration_us.to_string(),
            "-flush_packets".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "opus".to_string(),
            "pipe:1".to_string(),
        ])
        .envs(config.pulse_env())
        .piped_stdin()
        .piped_stdout()
        .stderr(StderrMode::Debug)
        .stop_with(StopMethod::CloseStdin)
}

enum OpusStage {
    Disabled,
    InProcess(OpusEncoder),
    External {
        process: SupervisedProcess,
        stdin: Option<ChildStdin>,
        demux: JoinHandle<()>,
    },
}

impl OpusStage {
    fn is_running(&self) -> bool {
        match self {
            OpusStage::Disabled => false,
            OpusStage::InProcess(_) => true,
            OpusStage::External { stdin, .. } => stdin.is_some(),
        }
    }
}

/// The capture → encode → broadcast loop
pub struct StreamPipeline {
    config: AppConfig,
    registry: Arc<ClientRegistry>,
    capture: ProcessSpec,
    encoder: ProcessSpec,
    stop_timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl StreamPipeline {
    pub fn new(config: &AppConfig, registry: Arc<ClientRegistry>) -> Self {
        Self {
            capture: capture_spec(config),
            encoder: encoder_spec(config),
            config: config.clone(),
            registry,
            stop_timeout: Duration::from_secs(2),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Replace the capture command
    pub fn with_capture(mut self, spec: ProcessSpec) -> Self {
        self.capture = spec;
        self
    }

    /// Replace the external encoder command
    pub fn with_encoder(mut self, spec: ProcessSpec) -> Self {
        self.encoder = spec;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    fn mode(&self) -> StreamMode {
        self.config.stream.mode
    }

    /// Run until shutdown, end of capture, or loss of the only stream.
    ///
    /// Capture failing to start is an error. Every process started here is
    /// stopped before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<PipelineExit> {
        self.stats.runs.fetch_add(1, Ordering::Relaxed);

        let mut capture = AudioCapture::start(self.capture.clone(), self.config.capture_read_bytes())?;
        let mut opus = match self.start_opus_stage() {
            Ok(stage) => stage,
            Err(e) => {
                let _ = capture.stop(self.stop_timeout).await;
                return Err(e);
            }
        };

        info!(
            mode = ?self.mode(),
            encoder = ?self.config.stream.encoder,
            chunk_bytes = capture.chunk_bytes(),
            "Stream pipeline running"
        );

        let exit = loop {
            if *shutdown.borrow() {
                break Ok(PipelineExit::Shutdown);
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(PipelineExit::Shutdown);
                    }
                }
                chunk = capture.read_chunk() => match chunk {
                    Ok(Some(chunk)) => {
                        self.dispatch(chunk, &mut opus).await;
                        if !self.mode().uses_pcm() && !opus.is_running() {
                            break Ok(PipelineExit::EncoderExited);
                        }
                    }
                    Ok(None) => break Ok(PipelineExit::CaptureEnded),
                    Err(e) => break Err(e),
                }
            }
        };

        self.stop_opus_stage(opus).await;

        match exit {
            Ok(PipelineExit::CaptureEnded) => {
                info!(chunks = capture.chunks_read(), "Capture stream ended");
                capture.finish(self.stop_timeout).await?;
                Ok(PipelineExit::CaptureEnded)
            }
            Ok(other) => {
                capture.stop(self.stop_timeout).await?;
                Ok(other)
            }
            Err(e) => {
                let _ = capture.stop(self.stop_timeout).await;
                Err(e)
            }
        }
    }

    fn start_opus_stage(&self) -> Result<OpusStage> {
        if !self.mode().uses_opus() {
            return Ok(OpusStage::Disabled);
        }

        match self.config.stream.encoder {
            EncoderBackend::Libopus => Ok(OpusStage::InProcess(OpusEncoder::from_config(&self.config)?)),
            EncoderBackend::Ffmpeg => {
                let mut process = SupervisedProcess::spawn(self.encoder.clone())?;
                let stdin = process.take_stdin()?;
                let stdout = process.take_stdout()?;

                let demuxer = OggDemuxer::from_config(BufReader::new(stdout), &self.config.stream);
                let demux = tokio::spawn(forward_packets(
                    demuxer,
                    self.registry.clone(),
                    self.stats.clone(),
                ));

                Ok(OpusStage::External {
                    process,
                    stdin: Some(stdin),
                    demux,
                })
            }
        }
    }

    async fn dispatch(&self, chunk: Bytes, opus: &mut OpusStage) {
        if self.mode().uses_pcm() {
            broadcast_payload(&self.registry, &self.stats, StreamCodec::Pcm, chunk.clone());
        }

        match opus {
            OpusStage::Disabled => {}
            OpusStage::InProcess(encoder) => match encoder.encode_pcm(&chunk) {
                Ok(packet) => broadcast_payload(&self.registry, &self.stats, StreamCodec::Opus, packet),
                Err(e) => warn!(error = %e, "Dropping chunk the encoder rejected"),
            },
            OpusStage::External { process, stdin, .. } => {
                let Some(input) = stdin.as_mut() else {
                    return;
                };
                let written = tokio::time::timeout(self.stop_timeout, input.write_all(&chunk)).await;
                let failure = match written {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "encoder stalled".to_string(),
                };
                let alive = process.is_alive();
                warn!(pid = ?process.pid(), alive, error = %failure, "Encoder input closed, Opus stream ended");
                *stdin = None;
            }
        }
    }

    async fn stop_opus_stage(&self, opus: OpusStage) {
        let OpusStage::External { mut process, stdin, demux } = opus else {
            return;
        };

        // End of input lets the encoder flush its last pages
        drop(stdin);

        let abort = demux.abort_handle();
        if tokio::time::timeout(self.stop_timeout, demux).await.is_err() {
            debug!("Demuxer still running, aborting");
            abort.abort();
        }

        match process.terminate(self.stop_timeout).await {
            Ok(status) => {
                if let Err(e) = check_exit(process.name(), status) {
                    warn!(error = %e, "Encoder exited abnormally");
                }
            }
            Err(e) => warn!(error = %e, "Failed to stop encoder"),
        }
    }
}

fn broadcast_payload(registry: &ClientRegistry, stats: &PipelineStats, codec: StreamCodec, payload: Bytes) {
    let frame = match Frame::new(codec.frame_type(), payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Dropping unframeable payload");
            return;
        }
    };

    let report = registry.broadcast(&frame, |c| c == codec);
    let counter = match codec {
        StreamCodec::Pcm => &stats.pcm_frames,
        StreamCodec::Opus => &stats.opus_frames,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    if !report.removed.is_empty() {
        stats
            .dropped_clients
            .fetch_add(report.removed.len() as u64, Ordering::Relaxed);
    }
}

/// Demux task: encoder stdout to `opus` clients
async fn forward_packets<R>(mut demuxer: OggDemuxer<R>, registry: Arc<ClientRegistry>, stats: Arc<PipelineStats>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match demuxer.next_packet().await {
            Ok(Some(packet)) => broadcast_payload(&registry, &stats, StreamCodec::Opus, packet.data),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Encoder output unreadable");
                break;
            }
        }
    }

    let demux_stats = demuxer.stats();
    info!(
        pages = demux_stats.pages,
        packets = demux_stats.packets,
        skipped_bytes = demux_stats.skipped_bytes,
        "Encoder output ended"
    );
}
