//! External process supervision

pub mod supervisor;

pub use supervisor::{ProcessSpec, StderrMode, StopMethod, SupervisedProcess};
