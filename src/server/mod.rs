//! WebSocket endpoint, control router and status API

pub mod control;
pub mod handlers;
pub mod server;
pub mod websocket;

pub use control::ControlRouter;
pub use server::{create_router, RelayServer};
