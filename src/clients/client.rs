//! Per-client types shared by the registry and the WebSocket transport

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::config::WireFormat;
use crate::protocol::StreamCodec;

/// Opaque connection handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell clients apart in logs
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

/// A message queued for a client's socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
    Close,
}

/// Read-only view of one registered client
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub codec: StreamCodec,
    pub wire_format: WireFormat,
    pub mic_codec: StreamCodec,
    pub remote: Option<SocketAddr>,
    pub connected_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
    }
}
