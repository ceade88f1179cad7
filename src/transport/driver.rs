//! Transport driver task.
//!
//! One task per transport. It serializes every socket frame, command and
//! reconnect timer, and dispatches all events, so listeners always run on
//! this task and in order.
//!
//! # Architecture
//!
//! ```text
//! run()
//!  └─ loop
//!      ├─ open_socket()      connect, racing the command queue
//!      ├─ run_connection()   select! { frame, command } until the socket ends
//!      └─ handle_close()     lifecycle decides: stop | reconnect | abort
//!          └─ wait_retry()   sleep_until(deadline), racing the command queue
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::lifecycle::{CloseOutcome, Lifecycle, OpenSignal};
use super::{
    CloseInfo, ConnectionState, Shared, TransportEvent, TransportOptions, NORMAL_CLOSURE,
};
use crate::socket::{Connector, SocketFrame, SocketSink, SocketSource};

/// Requests from the handles to the driver.
#[derive(Debug)]
pub(super) enum Command {
    /// Write a text frame on the connection opened at `epoch`.
    Send { epoch: u64, text: String },
    /// Close the socket and stop.
    Close { code: u16, reason: String },
}

/// Result of one connection attempt.
enum Connect {
    Opened(Box<dyn SocketSink>, Box<dyn SocketSource>),
    Failed(String),
    /// Close requested before the handshake finished.
    Cancelled(CloseInfo),
}

pub(super) struct Driver<C> {
    connector: C,
    options: TransportOptions,
    lifecycle: Lifecycle,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: Connector> Driver<C> {
    pub(super) fn new(
        connector: C,
        options: TransportOptions,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            connector,
            lifecycle: Lifecycle::new(options.retry),
            options,
            shared,
            commands,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            if !self.shared.is_active() {
                // Closed before this attempt started
                self.finish_stopped(CloseInfo::new(NORMAL_CLOSURE, "", false));
                break;
            }

            self.shared.set_state(ConnectionState::Connecting);
            log::info!("[transport] Connecting to {}", self.options.address);

            let close = match self.open_socket().await {
                Connect::Opened(sink, source) => self.run_connection(sink, source).await,
                Connect::Failed(error) => {
                    log::warn!("[transport] Connection failed: {}", error);
                    self.shared.emit(TransportEvent::Error(error));
                    CloseInfo::abnormal("connection failed")
                }
                Connect::Cancelled(info) => info,
            };

            if !self.handle_close(close).await {
                break;
            }
        }
        log::debug!("[transport] Driver for {} exited", self.options.address);
    }

    async fn open_socket(&mut self) -> Connect {
        let mut connect = self
            .connector
            .connect(&self.options.address, &self.options.protocols);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok((sink, source)) => Connect::Opened(sink, source),
                        Err(e) => Connect::Failed(format!("{e:#}")),
                    };
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send { .. }) => {
                        self.shared.emit(TransportEvent::Error(
                            "cannot send while connecting".to_string(),
                        ));
                    }
                    Some(Command::Close { code, reason }) => {
                        return Connect::Cancelled(CloseInfo::new(code, reason, false));
                    }
                    None => {
                        self.shared.active.store(false, Ordering::SeqCst);
                        return Connect::Cancelled(CloseInfo::new(NORMAL_CLOSURE, "", false));
                    }
                },
            }
        }
    }

    /// Mark the new connection open; returns its epoch.
    fn on_open(&mut self) -> u64 {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_state(ConnectionState::Open);
        let signal = self.lifecycle.on_open();
        log::info!(
            "[transport] Connected to {} ({})",
            self.options.address,
            match signal {
                OpenSignal::Start => "start",
                OpenSignal::Reopen => "reopen",
            }
        );

        self.shared.emit(match signal {
            OpenSignal::Start => TransportEvent::Start,
            OpenSignal::Reopen => TransportEvent::Reopen,
        });
        self.shared.emit(TransportEvent::Open);
        epoch
    }

    /// Pump one open connection until it ends.
    async fn run_connection(
        &mut self,
        mut sink: Box<dyn SocketSink>,
        mut source: Box<dyn SocketSource>,
    ) -> CloseInfo {
        let epoch = self.on_open();

        loop {
            tokio::select! {
                frame = source.recv() => match frame {
                    Some(Ok(SocketFrame::Text(text))) => {
                        log::trace!("[transport] Received {} bytes", text.len());
                        self.shared.emit(TransportEvent::Message(text));
                    }
                    Some(Ok(SocketFrame::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        self.shared.emit(TransportEvent::Message(text));
                    }
                    Some(Ok(SocketFrame::Close { code, reason })) => {
                        log::info!("[transport] Server closed connection (code {})", code);
                        return CloseInfo::new(code, reason, true);
                    }
                    Some(Err(e)) => {
                        log::warn!("[transport] Read error: {:#}", e);
                        self.shared.emit(TransportEvent::Error(format!("{e:#}")));
                        return CloseInfo::abnormal("read error");
                    }
                    None => {
                        log::warn!("[transport] Stream ended without close frame");
                        return CloseInfo::abnormal("stream ended");
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Send { epoch: stamped, .. }) if stamped != epoch => {
                        log::debug!("[transport] Dropping send queued for an earlier connection");
                        self.shared.emit(TransportEvent::Error(
                            "send was queued for a connection that closed".to_string(),
                        ));
                    }
                    Some(Command::Send { text, .. }) => {
                        if let Err(e) = sink.send_text(&text).await {
                            log::warn!("[transport] Send failed: {:#}", e);
                            self.shared.emit(TransportEvent::Error(format!("{e:#}")));
                            return CloseInfo::abnormal("send failed");
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        if let Err(e) = sink.close(code, &reason).await {
                            log::debug!("[transport] Close handshake failed: {:#}", e);
                        }
                        return CloseInfo::new(code, reason, true);
                    }
                    None => {
                        self.shared.active.store(false, Ordering::SeqCst);
                        if let Err(e) = sink.close(NORMAL_CLOSURE, "").await {
                            log::debug!("[transport] Close handshake failed: {:#}", e);
                        }
                        return CloseInfo::new(NORMAL_CLOSURE, "", true);
                    }
                },
            }
        }
    }

    /// Emit the close sequence and decide whether to keep running.
    async fn handle_close(&mut self, info: CloseInfo) -> bool {
        let intentional = !self.shared.is_active();

        match self.lifecycle.on_close(intentional) {
            CloseOutcome::Stopped => {
                self.finish_stopped(info);
                false
            }
            CloseOutcome::Reconnect { attempt, delay } => {
                log::warn!(
                    "[transport] Disconnected ({}), reconnecting in {}ms (attempt {})",
                    info,
                    delay.as_millis(),
                    attempt
                );
                self.shared.set_state(ConnectionState::Reconnecting {
                    attempt,
                    next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                self.shared.emit(TransportEvent::Disconnected(info.clone()));
                self.shared.emit(TransportEvent::Close(info));
                self.wait_retry(delay).await
            }
            CloseOutcome::Aborted => {
                log::error!(
                    "[transport] Disconnected ({}), giving up after {} attempts",
                    info,
                    self.lifecycle.attempt()
                );
                self.shared.set_state(ConnectionState::Closed);
                self.shared.emit(TransportEvent::Disconnected(info.clone()));
                self.shared.emit(TransportEvent::Abort(info.clone()));
                self.shared.emit(TransportEvent::Close(info));
                false
            }
        }
    }

    fn finish_stopped(&mut self, info: CloseInfo) {
        log::info!("[transport] Stopped ({})", info);
        self.shared.set_state(ConnectionState::Closed);
        self.shared.emit(TransportEvent::Stop(info.clone()));
        self.shared.emit(TransportEvent::Close(info));
    }

    /// Wait out the reconnect delay.
    ///
    /// Returns `false` if a close request cancelled the wait.
    async fn wait_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => {
                    let info = match command {
                        Some(Command::Send { .. }) => {
                            self.shared.emit(TransportEvent::Error(
                                "cannot send while disconnected".to_string(),
                            ));
                            continue;
                        }
                        Some(Command::Close { code, reason }) => CloseInfo::new(code, reason, true),
                        None => {
                            self.shared.active.store(false, Ordering::SeqCst);
                            CloseInfo::new(NORMAL_CLOSURE, "", true)
                        }
                    };
                    log::debug!("[transport] Reconnect cancelled by close");
                    self.lifecycle.on_close(true);
                    self.finish_stopped(info);
                    return false;
                }
            }
        }
    }
}
