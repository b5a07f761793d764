//! Microphone injection into the virtual input sink
//!
//! Binary messages from clients are mic audio. They are decoded per client
//! (see [`ClientRegistry::decode_mic`]) and queued for a single writer task
//! that owns the playback process's stdin, so chunks from concurrent
//! clients are never interleaved mid-write.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, ClientRegistry};
use crate::config::AppConfig;
use crate::error::AudioError;
use crate::process::{ProcessSpec, StderrMode, StopMethod, SupervisedProcess};

/// Command line for the playback process
pub fn playback_spec(config: &AppConfig) -> ProcessSpec {
    let mic = &config.mic;
    ProcessSpec::new("mic-playback", &mic.playback_program)
        .args([
            "--playback".to_string(),
            "-d".to_string(),
            mic.sink.clone(),
            "--format=s16le".to_string(),
            format!("--rate={}", mic.sample_rate),
            format!("--channels={}", mic.channels),
            format!("--latency-msec={}", mic.latency_msec),
        ])
        .envs(config.pulse_env())
        .piped_stdin()
        .stderr(StderrMode::Debug)
        .stop_with(StopMethod::CloseStdin)
}

#[derive(Debug, Default)]
struct InjectorStats {
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
    dropped: AtomicU64,
}

/// Owns the playback process and its writer task
pub struct MicInjector {
    queue: Mutex<Option<mpsc::Sender<Bytes>>>,
    running: tokio::sync::Mutex<Option<(SupervisedProcess, JoinHandle<()>)>>,
    stats: std::sync::Arc<InjectorStats>,
}

impl MicInjector {
    /// Spawn the playback process and its writer
    pub fn start(spec: ProcessSpec, queue_depth: usize) -> Result<Self, AudioError> {
        let mut process = SupervisedProcess::spawn(spec).map_err(AudioError::PlaybackUnavailable)?;
        let stdin = process.take_stdin().map_err(AudioError::PlaybackUnavailable)?;

        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let stats = std::sync::Arc::new(InjectorStats::default());
        let writer = tokio::spawn(write_loop(stdin, rx, stats.clone()));

        info!(pid = ?process.pid(), "Mic playback started");

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            running: tokio::sync::Mutex::new(Some((process, writer))),
            stats,
        })
    }

    /// Queue raw PCM for playback. A full queue drops the chunk.
    pub fn submit(&self, pcm: Bytes) -> Result<(), AudioError> {
        let queue = self.queue.lock();
        let sender = queue.as_ref().ok_or(AudioError::PlaybackClosed)?;

        match sender.try_send(pcm) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Mic queue full, dropping chunk");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(AudioError::PlaybackClosed),
        }
    }

    /// Decode one inbound binary message from `client` and queue it
    pub fn handle_inbound(&self, registry: &ClientRegistry, client: ClientId, data: Bytes) {
        let Some(pcm) = registry.decode_mic(client, data) else {
            return;
        };
        if pcm.is_empty() {
            return;
        }
        if let Err(e) = self.submit(pcm) {
            debug!(client = %client, error = %e, "Mic audio not played");
        }
    }

    pub fn chunks_written(&self) -> u64 {
        self.stats.chunks_written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Flush queued audio and stop the playback process
    pub async fn stop(&self, timeout: Duration) {
        // Dropping the sender ends the writer once the queue is drained
        self.queue.lock().take();

        let Some((mut process, writer)) = self.running.lock().await.take() else {
            return;
        };

        let abort = writer.abort_handle();
        if tokio::time::timeout(timeout, writer).await.is_err() {
            abort.abort();
        }

        if let Err(e) = process.terminate(timeout).await {
            warn!(error = %e, "Failed to stop mic playback");
        }
        info!(
            chunks = self.chunks_written(),
            bytes = self.stats.bytes_written.load(Ordering::Relaxed),
            dropped = self.dropped(),
            "Mic playback stopped"
        );
    }
}

async fn write_loop(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Bytes>, stats: std::sync::Arc<InjectorStats>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!(error = %e, "Mic playback input closed");
            return;
        }
        stats.chunks_written.fetch_add(1, Ordering::Relaxed);
        stats.bytes_written.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
    let _ = stdin.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireFormat;
    use crate::protocol::StreamCodec;
    use std::sync::Arc;

    fn sink_to(path: &std::path::Path) -> ProcessSpec {
        ProcessSpec::new("mic-playback", "sh")
            .args(["-c".to_string(), format!("cat > '{}'", path.display())])
            .piped_stdin()
            .stop_with(StopMethod::CloseStdin)
    }

    #[test]
    fn test_playback_command() {
        let spec = playback_spec(&AppConfig::default());
        assert_eq!(
            spec.command_line(),
            "pacat --playback -d webcode_input --format=s16le --rate=48000 --channels=2 --latency-msec=20"
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mic.raw");
        let injector = Arc::new(MicInjector::start(sink_to(&out), 256).unwrap());

        let mut tasks = Vec::new();
        for value in 1u8..=4 {
            let injector = injector.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    injector.submit(Bytes::from(vec![value; 1000])).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        injector.stop(Duration::from_secs(5)).await;

        let written = std::fs::read(&out).unwrap();
        assert_eq!(written.len(), 4 * 20 * 1000);
        for chunk in written.chunks(1000) {
            assert!(chunk.iter().all(|&b| b == chunk[0]));
        }
        assert_eq!(injector.chunks_written(), 80);
    }

    #[tokio::test]
    async fn test_inbound_raw_and_bad_opus() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mic.raw");
        let injector = MicInjector::start(sink_to(&out), 16).unwrap();

        let registry = ClientRegistry::new(StreamCodec::Opus, WireFormat::Framed);
        let (tx, _rx) = mpsc::channel(4);
        let raw_client = registry.register(tx.clone(), None);
        let opus_client = registry.register(tx, None);
        registry
            .install_mic_decoder(opus_client, crate::codec::OpusDecoder::new(48000, 2, 960).unwrap())
            .unwrap();

        injector.handle_inbound(&registry, raw_client, Bytes::from_static(&[1, 2, 3, 4]));
        // Undecodable packet is dropped without touching the stream
        injector.handle_inbound(&registry, opus_client, Bytes::from_static(&[0xFF, 0x00]));
        injector.stop(Duration::from_secs(5)).await;

        assert_eq!(std::fs::read(&out).unwrap(), vec![1, 2, 3, 4]);
        assert!(registry.contains(opus_client));
    }

    #[tokio::test]
    async fn test_submit_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let injector = MicInjector::start(sink_to(&dir.path().join("x")), 4).unwrap();
        injector.stop(Duration::from_secs(5)).await;
        assert!(matches!(
            injector.submit(Bytes::from_static(&[0, 0])),
            Err(AudioError::PlaybackClosed)
        ));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let spec = ProcessSpec::new("mic-playback", "/nonexistent/pacat").piped_stdin();
        assert!(matches!(
            MicInjector::start(spec, 4),
            Err(AudioError::PlaybackUnavailable(_))
        ));
    }
}
