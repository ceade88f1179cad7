//! WebSocket connector.
//!
//! Thin wrapper around `tokio-tungstenite` providing the [`SocketSink`] and
//! [`SocketSource`] halves the transport drives. Ping/pong frames are
//! answered by tungstenite and never surface to the transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;

use super::{Connector, SocketFrame, SocketPair, SocketSink, SocketSource};

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// [`Connector`] that opens real WebSocket connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, address: &str, protocols: &[String]) -> Result<SocketPair> {
        let (writer, reader) = connect(address, protocols).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl SocketSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketSource for WsReader {
    async fn recv(&mut self) -> Option<Result<SocketFrame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(SocketFrame::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(SocketFrame::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(SocketFrame::Close { code, reason }));
                }
                Some(Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => {}
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL, offering the given sub-protocols.
///
/// Protocols are sent as a single comma-separated `Sec-WebSocket-Protocol`
/// header; an empty list sends no header.
///
/// # Errors
///
/// Returns an error if the URL is invalid, a protocol name is not a valid
/// header value, or the WebSocket handshake fails.
pub async fn connect(url: &str, protocols: &[String]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    if !protocols.is_empty() {
        let joined = protocols.join(", ");
        let value = tungstenite::http::HeaderValue::from_str(&joined)
            .with_context(|| format!("invalid sub-protocol list: {joined}"))?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL, value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket connect to {url} failed"))?;

    log::debug!("[socket] Connected to {}", url);

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
