//! Screen + audio recording state machine
//!
//! ```text
//!            start_recording            stop_recording             recorder exited
//!   ┌──────┐ ─────────────────▶ ┌───────────┐ ─────────────▶ ┌──────────┐ ──────────────▶ ┌──────┐
//!   │ Idle │                    │ Recording │                │ Stopping │                 │ Idle │
//!   └──────┘                    └───────────┘                └──────────┘                 └──────┘
//! ```
//!
//! The whole state lives in one async mutex, so two concurrent starts cannot
//! both succeed. The recorder is finalized outside the lock: `status` stays
//! responsive while it flushes, and a start during `Stopping` is refused.
//! A recorder that exits on its own is treated as idle.

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{AppConfig, RecordingConfig};
use crate::error::RecordingError;
use crate::process::{ProcessSpec, StderrMode, StopMethod, SupervisedProcess};
use crate::recording::display::{DisplayInfo, XdpyInfo};

/// Builds the recorder command for one session
pub trait RecorderCommand: Send + Sync {
    fn build(&self, output: &Path, geometry: &str) -> ProcessSpec;
}

/// ffmpeg grabbing the X display and the audio monitor
pub struct FfmpegRecorder {
    config: RecordingConfig,
    audio_source: String,
    env: Vec<(String, String)>,
}

impl FfmpegRecorder {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut env = config.pulse_env();
        env.push(("DISPLAY".to_string(), config.recording.display.clone()));
        Self {
            config: config.recording.clone(),
            audio_source: config.audio.monitor_source.clone(),
            env,
        }
    }
}

impl RecorderCommand for FfmpegRecorder {
    fn build(&self, output: &Path, geometry: &str) -> ProcessSpec {
        let c = &self.config;
        ProcessSpec::new("recorder", &c.program)
            .args([
                "-y".to_string(),
                "-f".to_string(),
                "x11grab".to_string(),
                "-framerate".to_string(),
                c.framerate.to_string(),
                "-video_size".to_string(),
                geometry.to_string(),
                "-i".to_string(),
                format!("{}.0+0,0", c.display),
                "-f".to_string(),
                "pulse".to_string(),
                "-i".to_string(),
                self.audio_source.clone(),
                "-c:v".to_string(),
                c.video_codec.clone(),
                "-preset".to_string(),
                c.preset.clone(),
                "-crf".to_string(),
                c.crf.to_string(),
                "-c:a".to_string(),
                c.audio_codec.clone(),
                "-b:a".to_string(),
                c.audio_bitrate.clone(),
                "-movflags".to_string(),
                "+faststart".to_string(),
                output.display().to_string(),
            ])
            .envs(self.env.clone())
            .piped_stdin()
            .stderr(StderrMode::Diagnostics)
            .stop_with(StopMethod::Quit)
    }
}

/// Snapshot returned by [`RecordingController::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingStatus {
    pub recording: bool,
    pub filename: Option<String>,
}

enum RecorderState {
    Idle,
    Recording {
        filename: String,
        process: SupervisedProcess,
    },
    /// The recorder is being finalized by `stop_recording`
    Stopping,
}

/// Owns the single recording session
pub struct RecordingController {
    state: Mutex<RecorderState>,
    directory: PathBuf,
    extension: String,
    display: String,
    default_geometry: String,
    stop_timeout: Duration,
    display_info: Arc<dyn DisplayInfo>,
    command: Box<dyn RecorderCommand>,
}

impl RecordingController {
    pub fn new(config: &AppConfig) -> Self {
        let recording = &config.recording;
        Self {
            state: Mutex::new(RecorderState::Idle),
            directory: recording.directory.clone(),
            extension: recording.extension.clone(),
            display: recording.display.clone(),
            default_geometry: recording.default_geometry.clone(),
            stop_timeout: recording.stop_timeout(),
            display_info: Arc::new(XdpyInfo::new()),
            command: Box::new(FfmpegRecorder::from_config(config)),
        }
    }

    pub fn with_command(mut self, command: Box<dyn RecorderCommand>) -> Self {
        self.command = command;
        self
    }

    pub fn with_display_info(mut self, display_info: Arc<dyn DisplayInfo>) -> Self {
        self.display_info = display_info;
        self
    }

    /// `recording_<YYYYMMDD_HHMMSS>.<ext>` for the current local time
    pub fn timestamped_filename(&self) -> String {
        format!("recording_{}.{}", Local::now().format("%Y%m%d_%H%M%S"), self.extension)
    }

    /// Start a session and return its file name
    pub async fn start_recording(&self) -> Result<String, RecordingError> {
        let mut state = self.state.lock().await;

        match &mut *state {
            RecorderState::Idle => {}
            RecorderState::Stopping => return Err(RecordingError::AlreadyRecording),
            RecorderState::Recording { filename, process } => {
                if process.is_alive() {
                    return Err(RecordingError::AlreadyRecording);
                }
                warn!(filename = %filename, "Recorder exited on its own");
                *state = RecorderState::Idle;
            }
        }

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(RecordingError::Directory)?;

        let filename = self.timestamped_filename();
        let path = self.directory.join(&filename);

        let geometry = match self.display_info.geometry(&self.display).await {
            Some(geometry) => geometry,
            None => {
                info!(fallback = %self.default_geometry, "Display size unknown, using default");
                self.default_geometry.clone()
            }
        };

        let process = SupervisedProcess::spawn(self.command.build(&path, &geometry))?;
        info!(path = %path.display(), geometry = %geometry, pid = ?process.pid(), "Recording started");

        *state = RecorderState::Recording {
            filename: filename.clone(),
            process,
        };
        Ok(filename)
    }

    /// Stop the session and return the file name it was started with
    pub async fn stop_recording(&self) -> Result<String, RecordingError> {
        let (filename, mut process) = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, RecorderState::Stopping) {
                RecorderState::Recording { filename, mut process } => {
                    if !process.is_alive() {
                        warn!(filename = %filename, "Recorder had already exited");
                        *state = RecorderState::Idle;
                        return Err(RecordingError::NotRecording);
                    }
                    (filename, process)
                }
                other => {
                    *state = other;
                    return Err(RecordingError::NotRecording);
                }
            }
        };

        match process.terminate(self.stop_timeout).await {
            Ok(status) => info!(filename = %filename, %status, "Recording saved"),
            Err(e) => error!(filename = %filename, error = %e, "Recorder did not stop cleanly"),
        }

        *self.state.lock().await = RecorderState::Idle;
        Ok(filename)
    }

    pub async fn status(&self) -> RecordingStatus {
        let mut state = self.state.lock().await;
        match &mut *state {
            RecorderState::Recording { filename, process } => {
                if process.is_alive() {
                    RecordingStatus {
                        recording: true,
                        filename: Some(filename.clone()),
                    }
                } else {
                    RecordingStatus {
                        recording: false,
                        filename: None,
                    }
                }
            }
            _ => RecordingStatus {
                recording: false,
                filename: None,
            },
        }
    }

    /// Stop any active session
    pub async fn shutdown(&self) {
        match self.stop_recording().await {
            Ok(filename) => info!(filename = %filename, "Recording stopped for shutdown"),
            Err(RecordingError::NotRecording) => {}
            Err(e) => warn!(error = %e, "Stopping recording failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes the geometry to the output file, then waits for `q`
    struct ShellRecorder;

    impl RecorderCommand for ShellRecorder {
        fn build(&self, output: &Path, geometry: &str) -> ProcessSpec {
            ProcessSpec::new("recorder", "sh")
                .args([
                    "-c".to_string(),
                    "printf %s \"$1\" > \"$0\"; read cmd".to_string(),
                    output.display().to_string(),
                    geometry.to_string(),
                ])
                .piped_stdin()
                .stop_with(StopMethod::Quit)
        }
    }

    /// Ignores `q` and has to be killed
    struct StubbornRecorder;

    impl RecorderCommand for StubbornRecorder {
        fn build(&self, _output: &Path, _geometry: &str) -> ProcessSpec {
            ProcessSpec::new("recorder", "sleep")
                .arg("30")
                .piped_stdin()
                .stop_with(StopMethod::Quit)
        }
    }

    struct BrokenRecorder;

    impl RecorderCommand for BrokenRecorder {
        fn build(&self, _output: &Path, _geometry: &str) -> ProcessSpec {
            ProcessSpec::new("recorder", "/nonexistent/ffmpeg")
        }
    }

    struct FixedDisplay(Option<&'static str>);

    #[async_trait::async_trait]
    impl DisplayInfo for FixedDisplay {
        async fn geometry(&self, _display: &str) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn controller(dir: &Path, command: Box<dyn RecorderCommand>, geometry: Option<&'static str>) -> RecordingController {
        let mut config = AppConfig::default();
        config.recording.directory = dir.join("recordings");
        config.recording.default_geometry = "1280x720".to_string();
        config.recording.stop_timeout_secs = 1;
        RecordingController::new(&config)
            .with_command(command)
            .with_display_info(Arc::new(FixedDisplay(geometry)))
    }

    fn assert_timestamped(filename: &str) {
        let stamp = filename
            .strip_prefix("recording_")
            .and_then(|rest| rest.strip_suffix(".mp4"))
            .unwrap();
        assert_eq!(stamp.len(), 15);
        for (i, c) in stamp.chars().enumerate() {
            if i == 8 {
                assert_eq!(c, '_');
            } else {
                assert!(c.is_ascii_digit(), "{}", filename);
            }
        }
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(ShellRecorder), Some("2560x1440"));

        assert_eq!(recorder.status().await, RecordingStatus { recording: false, filename: None });

        let filename = recorder.start_recording().await.unwrap();
        assert_timestamped(&filename);

        let status = recorder.status().await;
        assert!(status.recording);
        assert_eq!(status.filename.as_deref(), Some(filename.as_str()));

        // Second start is rejected and leaves the session alone
        assert!(matches!(
            recorder.start_recording().await,
            Err(RecordingError::AlreadyRecording)
        ));
        assert_eq!(recorder.status().await.filename.as_deref(), Some(filename.as_str()));

        assert_eq!(recorder.stop_recording().await.unwrap(), filename);
        assert!(!recorder.status().await.recording);

        let written = std::fs::read_to_string(dir.path().join("recordings").join(&filename)).unwrap();
        assert_eq!(written, "2560x1440");
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(ShellRecorder), None);
        assert!(matches!(
            recorder.stop_recording().await,
            Err(RecordingError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_default_geometry_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(ShellRecorder), None);

        let filename = recorder.start_recording().await.unwrap();
        recorder.stop_recording().await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("recordings").join(&filename)).unwrap();
        assert_eq!(written, "1280x720");
    }

    #[tokio::test]
    async fn test_stubborn_recorder_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(StubbornRecorder), None);

        let filename = recorder.start_recording().await.unwrap();
        let started = std::time::Instant::now();
        assert_eq!(recorder.stop_recording().await.unwrap(), filename);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!recorder.status().await.recording);
    }

    #[tokio::test]
    async fn test_status_responsive_while_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(controller(dir.path(), Box::new(StubbornRecorder), None));

        let filename = recorder.start_recording().await.unwrap();
        let stopping = {
            let recorder = recorder.clone();
            tokio::spawn(async move { recorder.stop_recording().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The stubborn recorder holds stop_recording for the full timeout
        let status = tokio::time::timeout(Duration::from_millis(300), recorder.status())
            .await
            .unwrap();
        assert!(!status.recording);
        assert!(matches!(
            recorder.start_recording().await,
            Err(RecordingError::AlreadyRecording)
        ));
        assert!(matches!(
            recorder.stop_recording().await,
            Err(RecordingError::NotRecording)
        ));

        assert_eq!(stopping.await.unwrap().unwrap(), filename);
        let next = recorder.start_recording().await.unwrap();
        assert!(recorder.status().await.recording);
        recorder.shutdown().await;
        assert!(next.starts_with("recording_"));
    }

    #[tokio::test]
    async fn test_spawn_failure_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(BrokenRecorder), None);

        let err = recorder.start_recording().await.unwrap_err();
        assert!(matches!(err, RecordingError::Spawn(_)));
        assert!(!recorder.status().await.recording);
        // The directory is still created
        assert!(dir.path().join("recordings").is_dir());
    }

    #[tokio::test]
    async fn test_concurrent_starts() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = controller(dir.path(), Box::new(ShellRecorder), None);

        let (a, b) = tokio::join!(recorder.start_recording(), recorder.start_recording());
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

        recorder.shutdown().await;
        assert!(!recorder.status().await.recording);
    }

    #[test]
    fn test_ffmpeg_command() {
        let mut config = AppConfig::default();
        config.recording.display = ":1".to_string();
        let spec = FfmpegRecorder::from_config(&config).build(Path::new("/tmp/out.mp4"), "1920x1080");

        let line = spec.command_line();
        assert!(line.contains("-f x11grab -framerate 30 -video_size 1920x1080 -i :1.0+0,0"));
        assert!(line.contains("-f pulse -i webcode_null.monitor"));
        assert!(line.contains("-c:v libx264 -preset fast -crf 23 -c:a aac -b:a 192k"));
        assert!(line.ends_with("-movflags +faststart /tmp/out.mp4"));
        assert!(spec.env.contains(&("DISPLAY".to_string(), ":1".to_string())));
        assert_eq!(spec.stop, StopMethod::Quit);
    }
}
