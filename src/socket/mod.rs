//! Duplex socket collaborator.
//!
//! The transport never talks to a concrete socket. It asks a [`Connector`]
//! for a fresh ([`SocketSink`], [`SocketSource`]) pair on every connection
//! attempt, writes through the sink and reads frames from the source until
//! it ends.
//!
//! Two implementations ship with the crate:
//!
//! - [`ws::WsConnector`]: WebSocket over `tokio-tungstenite`
//! - [`memory::MemoryConnector`]: in-process channels, paired with a
//!   [`memory::MemoryServer`] that plays the remote side

// Rust guideline compliant 2026-02

pub mod memory;
pub mod ws;

use anyhow::Result;
use async_trait::async_trait;

/// A frame received from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Close handshake from the remote side.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a socket connection.
#[async_trait]
pub trait SocketSink: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Start the close handshake with the given code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of a socket connection.
#[async_trait]
pub trait SocketSource: Send {
    /// Receive the next frame, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<SocketFrame>>;
}

/// Boxed (writer, reader) halves returned by a [`Connector`].
pub type SocketPair = (Box<dyn SocketSink>, Box<dyn SocketSource>);

/// Opens socket connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection to `address`, offering `protocols` as
    /// sub-protocols.
    async fn connect(&self, address: &str, protocols: &[String]) -> Result<SocketPair>;
}
