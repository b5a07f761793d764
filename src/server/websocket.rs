//! WebSocket connections
//!
//! Each connection is split in two tasks:
//! - the writer owns the socket sink and drains the client's bounded queue,
//!   with every write bounded by the send timeout;
//! - the reader routes text frames to the control router and binary frames
//!   to the mic injector.
//!
//! When either task ends the other is aborted and the client unregistered.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clients::{ClientId, Outbound};
use crate::relay::Relay;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, relay))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, relay: Arc<Relay>) {
    let server = &relay.config().server;
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(server.client_queue.max(1));

    let id = relay.registry().register(tx, Some(remote));

    let mut writer = tokio::spawn(write_loop(sink, rx, server.send_timeout(), id));
    let mut reader = tokio::spawn(read_loop(stream, id, relay.clone()));

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    relay.registry().unregister(id);
    info!(client = %id, remote = %remote, "Client disconnected");
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    send_timeout: Duration,
    id: ClientId,
) {
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Binary(data) => Message::Binary(data.to_vec()),
            Outbound::Text(text) => Message::Text(text),
            Outbound::Close => {
                let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
                break;
            }
        };

        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client = %id, error = %e, "Send failed");
                break;
            }
            Err(_) => {
                warn!(client = %id, "Send timed out after {:?}", send_timeout);
                break;
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, id: ClientId, relay: Arc<Relay>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => relay.router().route(id, &text).await,
            Ok(Message::Binary(data)) => match relay.mic() {
                Some(mic) => mic.handle_inbound(relay.registry(), id, Bytes::from(data)),
                None => debug!(client = %id, "Mic input disabled, dropping audio"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(client = %id, error = %e, "Receive failed");
                break;
            }
        }
    }
}
