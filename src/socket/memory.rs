//! In-process socket pair.
//!
//! [`pair`] returns a [`MemoryConnector`] for the transport and a
//! [`MemoryServer`] that plays the remote side. Every successful `connect`
//! hands the server a [`ServerConnection`]; dropping that connection ends the
//! client's stream without a close frame (an abnormal drop), while
//! [`ServerConnection::close`] performs a clean close.
//!
//! Used by the crate's tests and by embedders who want to drive a
//! `GraphQLSocket` without a network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, SocketFrame, SocketPair, SocketSink, SocketSource};

/// State shared between the connector and the server.
#[derive(Debug, Default)]
struct Gate {
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

/// Create a connected (connector, server) pair.
#[must_use]
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Gate::default());
    (
        MemoryConnector {
            accept_tx,
            gate: Arc::clone(&gate),
        },
        MemoryServer { accept_rx, gate },
    )
}

/// Client side: a [`Connector`] that dials the paired [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    gate: Arc<Gate>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str, protocols: &[String]) -> Result<SocketPair> {
        self.gate.attempts.fetch_add(1, Ordering::SeqCst);
        if self.gate.refusing.load(Ordering::SeqCst) {
            return Err(anyhow!("connection to {address} refused"));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let connection = ServerConnection {
            address: address.to_string(),
            protocols: protocols.to_vec(),
            incoming: from_client,
            outgoing: to_client,
        };
        self.accept_tx
            .send(connection)
            .map_err(|err| anyhow!("memory server for {address} is gone: {err}"))?;

        Ok((
            Box::new(MemorySink { tx: to_server }),
            Box::new(MemorySource { rx: from_server }),
        ))
    }
}

/// Client write half.
#[derive(Debug)]
struct MemorySink {
    tx: mpsc::UnboundedSender<SocketFrame>,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.tx
            .send(SocketFrame::Text(text.to_string()))
            .map_err(|err| anyhow!("memory socket closed by peer: {err}"))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        self.tx
            .send(SocketFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|err| anyhow!("memory socket closed by peer: {err}"))
    }
}

/// Client read half.
#[derive(Debug)]
struct MemorySource {
    rx: mpsc::UnboundedReceiver<SocketFrame>,
}

#[async_trait]
impl SocketSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<SocketFrame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Server side of a [`pair`].
#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
    gate: Arc<Gate>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    ///
    /// Returns `None` once every connector clone has been dropped.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Refuse (or stop refusing) new connection attempts.
    pub fn set_refusing(&self, refusing: bool) {
        self.gate.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `connect` calls made so far, refused ones included.
    pub fn connect_attempts(&self) -> usize {
        self.gate.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted connection, seen from the server.
#[derive(Debug)]
pub struct ServerConnection {
    address: String,
    protocols: Vec<String>,
    incoming: mpsc::UnboundedReceiver<SocketFrame>,
    outgoing: mpsc::UnboundedSender<SocketFrame>,
}

impl ServerConnection {
    /// Address the client dialled.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sub-protocols the client offered.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Next frame sent by the client, `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<SocketFrame> {
        self.incoming.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<SocketFrame> {
        self.incoming.try_recv().ok()
    }

    /// Next client frame parsed as JSON.
    ///
    /// Returns `None` if the client is gone or the frame is not JSON text.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        match self.recv().await? {
            SocketFrame::Text(text) => serde_json::from_str(&text).ok(),
            SocketFrame::Binary(_) | SocketFrame::Close { .. } => None,
        }
    }

    /// Push a text frame to the client.
    ///
    /// Returns `false` if the client side has gone away.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(SocketFrame::Text(text.into())).is_ok()
    }

    /// Push a JSON value to the client as a text frame.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Push a binary frame to the client.
    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.outgoing.send(SocketFrame::Binary(data)).is_ok()
    }

    /// Close cleanly with a close frame.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.outgoing.send(SocketFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Drop the connection without a close frame.
    ///
    /// The client observes the stream ending (code 1006).
    pub fn drop_connection(self) {}
}
