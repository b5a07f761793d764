//! Client registry and best-effort broadcaster
//!
//! The registry is the one piece of state touched by every connection task
//! and by the broadcast loop. All mutations go through a single `RwLock`, so
//! a broadcast pass sees either the state before a renegotiation or the
//! state after it, never a mix.
//!
//! A broadcast pass:
//! 1. snapshots the matching clients under the read lock,
//! 2. enqueues the frame on each client's bounded queue with `try_send`,
//! 3. removes every client whose queue was full or closed under the write lock.
//!
//! Nothing in the pass waits on a socket, so a stalled client cannot hold up
//! delivery to the others.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::clients::client::{ClientId, ClientInfo, Outbound};
use crate::codec::OpusDecoder;
use crate::config::WireFormat;
use crate::error::NetworkError;
use crate::protocol::{Frame, StreamCodec};

struct ClientEntry {
    codec: StreamCodec,
    wire_format: WireFormat,
    outbound: mpsc::Sender<Outbound>,
    remote: Option<SocketAddr>,
    connected_at: Instant,
    mic_codec: StreamCodec,
    /// Present only when the client's mic sends Opus
    mic_decoder: Option<Arc<Mutex<OpusDecoder>>>,
}

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<ClientId>,
}

/// Connected clients and their negotiated state
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    default_codec: StreamCodec,
    default_wire_format: WireFormat,
}

impl ClientRegistry {
    pub fn new(default_codec: StreamCodec, default_wire_format: WireFormat) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            default_codec,
            default_wire_format,
        }
    }

    pub fn default_codec(&self) -> StreamCodec {
        self.default_codec
    }

    /// Add a client with the default codec and wire format
    pub fn register(&self, outbound: mpsc::Sender<Outbound>, remote: Option<SocketAddr>) -> ClientId {
        let id = ClientId::new();
        let entry = ClientEntry {
            codec: self.default_codec,
            wire_format: self.default_wire_format,
            outbound,
            remote,
            connected_at: Instant::now(),
            mic_codec: StreamCodec::Pcm,
            mic_decoder: None,
        };

        let total = {
            let mut clients = self.clients.write();
            clients.insert(id, entry);
            clients.len()
        };
        info!(client = %id, remote = ?remote, total, "Client registered");
        id
    }

    /// Remove a client together with its codec and decoder state.
    /// Returns false if it was already gone.
    pub fn unregister(&self, id: ClientId) -> bool {
        let (removed, total) = {
            let mut clients = self.clients.write();
            let removed = clients.remove(&id).is_some();
            (removed, clients.len())
        };
        if removed {
            info!(client = %id, total, "Client unregistered");
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    pub fn codec(&self, id: ClientId) -> Option<StreamCodec> {
        self.clients.read().get(&id).map(|c| c.codec)
    }

    pub fn wire_format(&self, id: ClientId) -> Option<WireFormat> {
        self.clients.read().get(&id).map(|c| c.wire_format)
    }

    pub fn mic_codec(&self, id: ClientId) -> Option<StreamCodec> {
        self.clients.read().get(&id).map(|c| c.mic_codec)
    }

    /// Change the outbound codec; affects frames broadcast after this call.
    /// Returns the previous codec.
    pub fn set_codec(&self, id: ClientId, codec: StreamCodec) -> Result<StreamCodec, NetworkError> {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(&id).ok_or(NetworkError::UnknownClient)?;
        Ok(std::mem::replace(&mut entry.codec, codec))
    }

    pub fn set_wire_format(&self, id: ClientId, wire_format: WireFormat) -> Result<(), NetworkError> {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(&id).ok_or(NetworkError::UnknownClient)?;
        entry.wire_format = wire_format;
        Ok(())
    }

    /// Switch the client's mic to raw PCM, dropping any decoder
    pub fn clear_mic_decoder(&self, id: ClientId) -> Result<(), NetworkError> {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(&id).ok_or(NetworkError::UnknownClient)?;
        entry.mic_codec = StreamCodec::Pcm;
        entry.mic_decoder = None;
        Ok(())
    }

    /// Switch the client's mic to Opus using `decoder`
    pub fn install_mic_decoder(&self, id: ClientId, decoder: OpusDecoder) -> Result<(), NetworkError> {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(&id).ok_or(NetworkError::UnknownClient)?;
        entry.mic_codec = StreamCodec::Opus;
        entry.mic_decoder = Some(Arc::new(Mutex::new(decoder)));
        Ok(())
    }

    /// Turn one inbound mic message into PCM for playback.
    ///
    /// Raw clients get their bytes back untouched. Opus clients get the
    /// decoded packet; a packet that fails to decode is logged and dropped.
    pub fn decode_mic(&self, id: ClientId, data: Bytes) -> Option<Bytes> {
        let decoder = {
            let clients = self.clients.read();
            clients.get(&id)?.mic_decoder.clone()
        };

        let Some(decoder) = decoder else {
            return Some(data);
        };

        let result = decoder.lock().decode(&data);
        match result {
            Ok(pcm) => Some(pcm),
            Err(e) => {
                debug!(client = %id, bytes = data.len(), error = %e, "Dropping mic packet");
                None
            }
        }
    }

    /// Queue a message for one client. Failures are reported, not acted on.
    pub fn send_to(&self, id: ClientId, message: Outbound) -> Result<(), NetworkError> {
        let sender = {
            let clients = self.clients.read();
            clients.get(&id).ok_or(NetworkError::UnknownClient)?.outbound.clone()
        };
        sender
            .try_send(message)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    /// Send `frame` to every client whose codec satisfies `predicate`.
    ///
    /// Clients that cannot take the frame are removed after the pass.
    pub fn broadcast<P>(&self, frame: &Frame, predicate: P) -> BroadcastReport
    where
        P: Fn(StreamCodec) -> bool,
    {
        let targets: Vec<(ClientId, WireFormat, mpsc::Sender<Outbound>)> = {
            let clients = self.clients.read();
            clients
                .iter()
                .filter(|(_, c)| predicate(c.codec))
                .map(|(id, c)| (*id, c.wire_format, c.outbound.clone()))
                .collect()
        };

        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let mut framed: Option<Bytes> = None;
        let mut report = BroadcastReport::default();

        for (id, wire_format, sender) in targets {
            let data = match wire_format {
                WireFormat::Framed => framed.get_or_insert_with(|| frame.encode()).clone(),
                WireFormat::Bare => frame.payload().clone(),
            };

            match sender.try_send(Outbound::Binary(data)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(client = %id, "Send queue full, disconnecting");
                    report.removed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "Connection gone, removing");
                    report.removed.push(id);
                }
            }
        }

        if !report.removed.is_empty() {
            let mut clients = self.clients.write();
            for id in &report.removed {
                clients.remove(id);
            }
        }

        report
    }

    /// Clients currently receiving each codec: `(pcm, opus)`
    pub fn codec_counts(&self) -> (usize, usize) {
        let clients = self.clients.read();
        clients.values().fold((0, 0), |(pcm, opus), c| match c.codec {
            StreamCodec::Pcm => (pcm + 1, opus),
            StreamCodec::Opus => (pcm, opus + 1),
        })
    }

    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read();
        clients
            .iter()
            .map(|(id, c)| ClientInfo {
                id: *id,
                codec: c.codec,
                wire_format: c.wire_format,
                mic_codec: c.mic_codec,
                remote: c.remote,
                connected_secs: c.connected_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Queue a close for every client and empty the registry
    pub fn close_all(&self) {
        let drained: Vec<(ClientId, ClientEntry)> = self.clients.write().drain().collect();
        for (id, entry) in drained {
            if entry.outbound.try_send(Outbound::Close).is_err() {
                debug!(client = %id, "Close not queued");
            }
        }
    }
}
