//! Client registry and broadcaster

pub mod client;
pub mod registry;

pub use client::{ClientId, ClientInfo, Outbound};
pub use registry::{BroadcastReport, ClientRegistry};
