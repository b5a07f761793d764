//! Raw audio capture from a PulseAudio monitor source
//!
//! `pacat --record` writes interleaved s16le to stdout. The stream is read in
//! exact-size chunks: one encoder frame in transcoded and dual mode, a
//! fixed PCM chunk in pass-through mode. Capture is not restarted here; a
//! crash ends the stream and is reported to whoever drives the pipeline.

use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::ChildStdout;
use tracing::info;

use crate::config::AppConfig;
use crate::error::{AudioError, Error, ProcessError, Result};
use crate::process::supervisor::check_exit;
use crate::process::{ProcessSpec, StderrMode, StopMethod, SupervisedProcess};

/// Command line for the capture process
pub fn capture_spec(config: &AppConfig) -> ProcessSpec {
    let audio = &config.audio;
    ProcessSpec::new("capture", &audio.capture_program)
        .args([
            "--record".to_string(),
            "-d".to_string(),
            audio.monitor_source.clone(),
            "--format=s16le".to_string(),
            format!("--rate={}", audio.sample_rate),
            format!("--channels={}", audio.channels),
            format!("--latency-msec={}", audio.latency_msec),
        ])
        .args(audio.capture_args.iter().cloned())
        .envs(config.pulse_env())
        .piped_stdout()
        .stderr(StderrMode::Debug)
        .stop_with(StopMethod::Kill)
}

/// Running capture process and its stdout
pub struct AudioCapture {
    process: SupervisedProcess,
    reader: BufReader<ChildStdout>,
    chunk_bytes: usize,
    /// Chunks read so far
    chunks: u64,
}

impl AudioCapture {
    /// Spawn the capture process. Failure to launch is `CaptureUnavailable`.
    pub fn start(spec: ProcessSpec, chunk_bytes: usize) -> Result<Self> {
        let mut process = SupervisedProcess::spawn(spec).map_err(AudioError::CaptureUnavailable)?;
        let stdout = process.take_stdout().map_err(AudioError::CaptureUnavailable)?;

        info!(pid = ?process.pid(), chunk_bytes, "Capture started");

        Ok(Self {
            process,
            reader: BufReader::with_capacity(chunk_bytes.max(8192), stdout),
            chunk_bytes,
            chunks: 0,
        })
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn chunks_read(&self) -> u64 {
        self.chunks
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Read exactly one chunk. `Ok(None)` once the stream ends, including
    /// when it ends partway through a chunk.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.chunk_bytes);
        match self.reader.read_exact(&mut buf).await {
            Ok(_) => {
                self.chunks += 1;
                Ok(Some(buf.freeze()))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::Process(ProcessError::Io {
                name: self.process.name().to_string(),
                source: e,
            })),
        }
    }

    /// Reap the process after its stream ended; a failing exit is `Crash`.
    pub async fn finish(&mut self, timeout: Duration) -> Result<()> {
        let status = match tokio::time::timeout(timeout, self.process.wait()).await {
            Ok(status) => status?,
            Err(_) => self.process.terminate(Duration::ZERO).await?,
        };
        check_exit(self.process.name(), status)?;
        Ok(())
    }

    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.process.terminate(timeout).await?;
        info!(chunks = self.chunks, "Capture stopped");
        Ok(())
    }
}
