//! Server-side screen + audio recording

pub mod controller;
pub mod display;

pub use controller::{FfmpegRecorder, RecorderCommand, RecordingController, RecordingStatus};
pub use display::{DisplayInfo, XdpyInfo};
