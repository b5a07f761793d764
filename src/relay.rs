//! Shared relay state and lifecycle
//!
//! [`Relay`] owns every long-lived component and is handed to the HTTP and
//! WebSocket handlers as axum state. Shutdown runs in a fixed order: the
//! stream pipeline is signalled, the recorder is finalized, mic playback is
//! drained and stopped, then every client socket is closed.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audio::pipeline::PipelineStatsSnapshot;
use crate::audio::{MicInjector, PipelineExit, PipelineStats, StreamPipeline};
use crate::clients::ClientRegistry;
use crate::config::{AppConfig, EncoderBackend, StreamMode};
use crate::error::Result;
use crate::protocol::StreamCodec;
use crate::recording::RecordingController;
use crate::server::ControlRouter;

/// Snapshot served by `/api/status`
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub clients: usize,
    pub pcm_clients: usize,
    pub opus_clients: usize,
    pub mode: StreamMode,
    pub encoder: EncoderBackend,
    pub recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_file: Option<String>,
    pub uptime_seconds: u64,
    pub pipeline: PipelineStatsSnapshot,
    pub mic_enabled: bool,
    pub mic_chunks_written: u64,
    pub mic_chunks_dropped: u64,
}

pub struct Relay {
    config: AppConfig,
    registry: Arc<ClientRegistry>,
    recorder: Arc<RecordingController>,
    router: ControlRouter,
    mic: Option<MicInjector>,
    pipeline_stats: Arc<PipelineStats>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn new(config: AppConfig) -> Self {
        let recorder = Arc::new(RecordingController::new(&config));
        Self::with_recorder(config, recorder)
    }

    /// Build around an already configured recorder
    pub fn with_recorder(config: AppConfig, recorder: Arc<RecordingController>) -> Self {
        let registry = Arc::new(ClientRegistry::new(
            default_codec(config.stream.mode),
            config.server.default_wire_format,
        ));
        let router = ControlRouter::new(&config, registry.clone(), recorder.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            recorder,
            router,
            mic: None,
            pipeline_stats: Arc::new(PipelineStats::default()),
            started_at: Instant::now(),
            shutdown,
        }
    }

    /// Attach a running mic injector
    pub fn with_mic(mut self, mic: MicInjector) -> Self {
        self.mic = Some(mic);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<RecordingController> {
        &self.recorder
    }

    pub fn router(&self) -> &ControlRouter {
        &self.router
    }

    pub fn mic(&self) -> Option<&MicInjector> {
        self.mic.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// A pipeline wired to this relay's clients and counters
    pub fn pipeline(&self) -> StreamPipeline {
        StreamPipeline::new(&self.config, self.registry.clone()).with_stats(self.pipeline_stats.clone())
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn shutdown_signal(&self) {
        let mut rx = self.subscribe_shutdown();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    pub async fn status(&self) -> RelayStatus {
        let (pcm_clients, opus_clients) = self.registry.codec_counts();
        let recording = self.recorder.status().await;

        RelayStatus {
            clients: self.registry.len(),
            pcm_clients,
            opus_clients,
            mode: self.config.stream.mode,
            encoder: self.config.stream.encoder,
            recording: recording.recording,
            recording_file: recording.filename,
            uptime_seconds: self.uptime().as_secs(),
            pipeline: self.pipeline_stats.snapshot(),
            mic_enabled: self.mic.is_some(),
            mic_chunks_written: self.mic.as_ref().map_or(0, |m| m.chunks_written()),
            mic_chunks_dropped: self.mic.as_ref().map_or(0, |m| m.dropped()),
        }
    }

    /// Run the stream pipeline, restarting it after it ends if configured.
    ///
    /// Returns when shutdown is triggered, or when a run ends and restarts
    /// are disabled.
    pub async fn run_pipeline(&self) -> Result<()> {
        let pipeline = self.pipeline();
        let delay = Duration::from_millis(self.config.stream.restart_delay_ms);

        loop {
            let outcome = pipeline.run(self.subscribe_shutdown()).await;
            match &outcome {
                Ok(PipelineExit::Shutdown) => return Ok(()),
                Ok(exit) => info!(?exit, "Stream pipeline ended"),
                Err(e) => error!(error = %e, "Stream pipeline failed"),
            }

            if !self.config.stream.restart_on_exit {
                return outcome.map(|_| ());
            }
            if self.is_shutting_down() {
                return Ok(());
            }

            info!("Restarting stream pipeline in {:?}", delay);
            let mut rx = self.subscribe_shutdown();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = rx.wait_for(|stop| *stop) => return Ok(()),
            }
        }
    }

    /// Stop everything in order. Safe to call more than once.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.shutdown.send_replace(true);

        self.recorder.shutdown().await;

        if let Some(mic) = &self.mic {
            mic.stop(Duration::from_secs(2)).await;
        }

        let clients = self.registry.len();
        self.registry.close_all();
        if clients > 0 {
            warn!(clients, "Closed remaining client connections");
        }
        info!("Relay stopped");
    }
}

/// Codec assigned to clients that never ask for one
fn default_codec(mode: StreamMode) -> StreamCodec {
    match mode {
        StreamMode::Passthrough => StreamCodec::Pcm,
        StreamMode::Transcoded | StreamMode::Dual => StreamCodec::Opus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::Outbound;
    use tokio::sync::mpsc;

    fn quiet_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.mic.enabled = false;
        config.pulse.server = None;
        config
    }

    #[test]
    fn test_default_codec_follows_mode() {
        assert_eq!(default_codec(StreamMode::Passthrough), StreamCodec::Pcm);
        assert_eq!(default_codec(StreamMode::Transcoded), StreamCodec::Opus);
        assert_eq!(default_codec(StreamMode::Dual), StreamCodec::Opus);
    }

    #[tokio::test]
    async fn test_status() {
        let mut config = quiet_config();
        config.stream.mode = StreamMode::Passthrough;
        let relay = Relay::new(config);

        let (tx, _rx) = mpsc::channel(4);
        relay.registry().register(tx, None);

        let status = relay.status().await;
        assert_eq!(status.clients, 1);
        assert_eq!(status.pcm_clients, 1);
        assert_eq!(status.opus_clients, 0);
        assert!(!status.recording);
        assert!(!status.mic_enabled);
        assert_eq!(status.pipeline.runs, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let relay = Relay::new(quiet_config());
        let (tx, mut rx) = mpsc::channel(4);
        relay.registry().register(tx, None);

        relay.shutdown().await;

        assert!(relay.is_shutting_down());
        assert!(relay.registry().is_empty());
        assert_eq!(rx.recv().await, Some(Outbound::Close));

        // Second call is a no-op
        relay.shutdown().await;
        relay.shutdown_signal().await;
    }

    #[tokio::test]
    async fn test_pipeline_without_restart() {
        let mut config = quiet_config();
        config.stream.mode = StreamMode::Passthrough;
        // Exits at once with no output
        config.audio.capture_program = "true".into();
        config.stream.restart_on_exit = false;
        let relay = Relay::new(config);

        tokio::time::timeout(Duration::from_secs(5), relay.run_pipeline())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.status().await.pipeline.runs, 1);
    }

    #[tokio::test]
    async fn test_pipeline_restarts_until_shutdown() {
        let mut config = quiet_config();
        config.stream.mode = StreamMode::Passthrough;
        config.audio.capture_program = "true".into();
        config.stream.restart_on_exit = true;
        config.stream.restart_delay_ms = 10;
        let relay = Arc::new(Relay::new(config));

        let runner = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run_pipeline().await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        relay.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(relay.status().await.pipeline.runs >= 2);
    }

    #[tokio::test]
    async fn test_missing_capture_program_is_an_error() {
        let mut config = quiet_config();
        config.stream.mode = StreamMode::Passthrough;
        config.audio.capture_program = "/nonexistent/capture-tool".into();
        config.stream.restart_on_exit = false;
        let relay = Relay::new(config);

        assert!(relay.run_pipeline().await.is_err());
    }
}
