//! Audio subsystem: capture, stream pipeline, mic playback, PulseAudio setup

pub mod capture;
pub mod pipeline;
pub mod playback;
pub mod pulse;

pub use capture::AudioCapture;
pub use pipeline::{PipelineExit, PipelineStats, StreamPipeline};
pub use playback::MicInjector;
pub use pulse::PulseAudio;
