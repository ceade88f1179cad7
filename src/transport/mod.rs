//! Resilient transport.
//!
//! Keeps one logical connection alive across unexpected drops. A background
//! driver task owns the socket, the reconnect timer and the command queue;
//! callers hold a [`ResilientTransport`] (or cloned [`TransportSender`]s) and
//! observe the lifecycle through events.
//!
//! # Events
//!
//! | Event          | When                                                    |
//! |----------------|---------------------------------------------------------|
//! | `Start`        | first successful open                                   |
//! | `Reopen`       | every later open, after a reconnect                     |
//! | `Open`         | every open, after `Start`/`Reopen`                      |
//! | `Stop`         | close requested through [`ResilientTransport::close`]   |
//! | `Disconnected` | connection lost without a close request                 |
//! | `Abort`        | retry budget exhausted, transport gives up              |
//! | `Close`        | every close, always last                                |
//! | `Error`        | socket or send error                                    |
//! | `Message`      | inbound text frame                                      |
//!
//! # Early events
//!
//! The driver starts connecting as soon as the transport is spawned.
//! Register listeners on the [`TransportBuilder`] to be sure to see the
//! first `Start`.
//!
//! # Example
//!
//! ```ignore
//! let builder = ResilientTransport::builder(TransportOptions::new("ws://localhost:4000/graphql"));
//! builder.add_event_listener(TransportEventKind::Message, |event| {
//!     if let TransportEvent::Message(text) = event {
//!         println!("{text}");
//!     }
//! });
//! let transport = builder.connect();
//! transport.wait_open().await?;
//! transport.send("hello")?;
//! ```

// Rust guideline compliant 2026-02

mod driver;
pub mod lifecycle;

pub use lifecycle::{RetryLimit, RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::events::{DefaultAction, Event, EventTarget, ListenerId};
use crate::socket::ws::WsConnector;
use crate::socket::Connector;

use driver::{Command, Driver};

/// Close code for a normal, requested closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Details of a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Whether the close handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// Close details with the given values.
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// Close without a close frame (code 1006).
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason, false)
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

/// Discriminant of a [`TransportEvent`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    /// See [`TransportEvent::Start`].
    Start,
    /// See [`TransportEvent::Reopen`].
    Reopen,
    /// See [`TransportEvent::Open`].
    Open,
    /// See [`TransportEvent::Stop`].
    Stop,
    /// See [`TransportEvent::Disconnected`].
    Disconnected,
    /// See [`TransportEvent::Abort`].
    Abort,
    /// See [`TransportEvent::Close`].
    Close,
    /// See [`TransportEvent::Error`].
    Error,
    /// See [`TransportEvent::Message`].
    Message,
}

/// Lifecycle and traffic events emitted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// First successful open.
    Start,
    /// Open after a reconnect.
    Reopen,
    /// Any successful open.
    Open,
    /// Requested close.
    Stop(CloseInfo),
    /// Unrequested close.
    Disconnected(CloseInfo),
    /// Retry budget exhausted.
    Abort(CloseInfo),
    /// Any close; always the last event of a close sequence.
    Close(CloseInfo),
    /// Socket or send error.
    Error(String),
    /// Inbound text (binary frames are decoded as lossy UTF-8).
    Message(String),
}

impl TransportEvent {
    /// Close details for close-family events.
    pub fn close_info(&self) -> Option<&CloseInfo> {
        match self {
            Self::Stop(info) | Self::Disconnected(info) | Self::Abort(info) | Self::Close(info) => {
                Some(info)
            }
            _ => None,
        }
    }
}

impl Event for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            Self::Start => TransportEventKind::Start,
            Self::Reopen => TransportEventKind::Reopen,
            Self::Open => TransportEventKind::Open,
            Self::Stop(_) => TransportEventKind::Stop,
            Self::Disconnected(_) => TransportEventKind::Disconnected,
            Self::Abort(_) => TransportEventKind::Abort,
            Self::Close(_) => TransportEventKind::Close,
            Self::Error(_) => TransportEventKind::Error,
            Self::Message(_) => TransportEventKind::Message,
        }
    }
}

/// WebSocket-style ready state of the current socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Handshake in progress.
    Connecting,
    /// Open; sends are accepted.
    Open,
    /// Close requested, not yet complete.
    Closing,
    /// No socket (closed, aborted, or waiting to reconnect).
    Closed,
}

/// Detailed connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to connect.
    Connecting,
    /// Connected.
    Open,
    /// Close requested while open.
    Closing,
    /// Waiting to reconnect after a disconnect.
    Reconnecting {
        /// Current reconnection attempt number.
        attempt: u32,
        /// Milliseconds until the attempt starts.
        next_retry_ms: u64,
    },
    /// Stopped or aborted; the driver has exited.
    Closed,
}

impl ConnectionState {
    /// Collapse into a [`ReadyState`].
    pub fn ready_state(self) -> ReadyState {
        match self {
            Self::Connecting => ReadyState::Connecting,
            Self::Open => ReadyState::Open,
            Self::Closing => ReadyState::Closing,
            Self::Reconnecting { .. } | Self::Closed => ReadyState::Closed,
        }
    }
}

/// Errors returned by transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket is not open.
    NotOpen,
    /// The transport was closed by the caller.
    Closed,
    /// The transport stopped (aborted or its driver exited).
    Stopped,
    /// A value could not be serialized.
    Encode(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "socket is not open"),
            Self::Closed => write!(f, "transport closed"),
            Self::Stopped => write!(f, "transport stopped"),
            Self::Encode(msg) => write!(f, "failed to encode message: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Socket address, e.g. `ws://localhost:4000/graphql`.
    pub address: String,
    /// Sub-protocols offered on every connection.
    pub protocols: Vec<String>,
    /// Reconnect policy.
    pub retry: RetryPolicy,
}

impl TransportOptions {
    /// Options with default retry policy and no sub-protocols.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocols: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the sub-protocols.
    pub fn protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set the reconnect policy.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// State shared between the handles and the driver task.
#[derive(Debug)]
struct Shared {
    events: EventTarget<TransportEvent>,
    state: watch::Sender<ConnectionState>,
    /// Cleared synchronously by `close()`; a close seen while this is false
    /// was requested.
    active: AtomicBool,
    /// Bumped by the driver before each open; sends are stamped with it so a
    /// frame queued for a dead connection never reaches the next one.
    epoch: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            events: EventTarget::new(),
            state,
            active: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: TransportEvent) -> bool {
        log::trace!("[transport] Emitting {:?}", event.kind());
        self.events.dispatch_event(&event)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Cloneable handle for sending through, or closing, a transport.
///
/// Safe to capture in event listeners.
#[derive(Debug, Clone)]
pub struct TransportSender {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TransportSender {
    /// Send a text frame.
    ///
    /// Fails unless the socket is open; nothing is queued for later.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        // Read before the state so a reopen in between stamps the old epoch
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        if !self.shared.is_active() {
            return Err(TransportError::Closed);
        }
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        self.commands
            .send(Command::Send {
                epoch,
                text: text.into(),
            })
            .map_err(|_closed| TransportError::Stopped)
    }

    /// Serialize `value` as JSON and send it.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(value).map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send(text)
    }

    /// Close the transport; no reconnect follows.
    ///
    /// Takes effect immediately for `is_active` and `send`. The driver then
    /// closes the socket (or cancels a pending reconnect) and emits `Stop`
    /// followed by `Close`. Calling it again is a no-op.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            log::debug!("[transport] Already closed, ignoring close({})", code);
            return;
        }
        log::info!("[transport] Closing (code {}, reason {:?})", code, reason);

        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if self
            .commands
            .send(Command::Close {
                code,
                reason: reason.to_string(),
            })
            .is_err()
        {
            log::debug!("[transport] Driver already exited");
        }
    }

    /// Ready state of the current socket.
    pub fn ready_state(&self) -> ReadyState {
        self.shared.connection_state().ready_state()
    }

    /// Detailed connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    /// `false` once `close` has been called.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Wait until the socket is open.
    ///
    /// Resolves immediately if it already is. Fails with
    /// [`TransportError::Closed`] if the transport is (or becomes) closed by
    /// the caller, and with [`TransportError::Stopped`] if it aborts.
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state == ConnectionState::Open && self.shared.is_active() {
                return Ok(());
            }
            if !self.shared.is_active() {
                return Err(TransportError::Closed);
            }
            if state == ConnectionState::Closed {
                return Err(TransportError::Stopped);
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Stopped);
            }
        }
    }

    /// Wait until the transport has stopped or aborted.
    ///
    /// Resolves once the driver has finished its close sequence, so a close
    /// frame requested by [`close`](Self::close) has been written.
    pub async fn wait_closed(&self) {
        let mut rx = self.shared.state.subscribe();
        if rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .is_err()
        {
            log::debug!("[transport] State channel closed while waiting for close");
        }
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Weak handle that does not keep the transport alive.
    ///
    /// Use it in listeners registered on the same transport.
    pub fn downgrade(&self) -> WeakTransportSender {
        WeakTransportSender {
            shared: Arc::downgrade(&self.shared),
            commands: self.commands.downgrade(),
        }
    }
}

/// Non-owning [`TransportSender`].
#[derive(Debug, Clone)]
pub struct WeakTransportSender {
    shared: Weak<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl WeakTransportSender {
    /// The sender, if the transport still has an owner.
    pub fn upgrade(&self) -> Option<TransportSender> {
        Some(TransportSender {
            shared: self.shared.upgrade()?,
            commands: self.commands.upgrade()?,
        })
    }
}

/// Configures listeners before the driver starts.
#[derive(Debug)]
pub struct TransportBuilder {
    options: TransportOptions,
    sender: TransportSender,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl TransportBuilder {
    /// Sender for the transport being built, usable inside listeners.
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// See [`ResilientTransport::add_event_listener`].
    pub fn add_event_listener<F>(&self, kind: TransportEventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.sender.shared.events.add_event_listener(kind, callback)
    }

    /// See [`ResilientTransport::add_event_listener_with`].
    pub fn add_event_listener_with<F>(&self, kind: TransportEventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) -> DefaultAction + Send + Sync + 'static,
    {
        self.sender.shared.events.add_event_listener_with(kind, callback)
    }

    /// Start the driver with a WebSocket connector.
    pub fn connect(self) -> ResilientTransport {
        self.spawn(WsConnector)
    }

    /// Start the driver with the given connector.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<C: Connector>(self, connector: C) -> ResilientTransport {
        log::info!("[transport] Starting transport to {}", self.options.address);

        let driver = Driver::new(
            connector,
            self.options.clone(),
            Arc::clone(&self.sender.shared),
            self.commands,
        );
        tokio::spawn(driver.run());

        ResilientTransport {
            sender: self.sender,
            options: self.options,
        }
    }
}

/// Owner handle of a resilient connection.
///
/// Dropping it closes the transport with code 1000.
#[derive(Debug)]
pub struct ResilientTransport {
    sender: TransportSender,
    options: TransportOptions,
}

impl ResilientTransport {
    /// Builder for a transport that has not started connecting yet.
    pub fn builder(options: TransportOptions) -> TransportBuilder {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        TransportBuilder {
            options,
            sender: TransportSender {
                shared: Arc::new(Shared::new()),
                commands: commands_tx,
            },
            commands: commands_rx,
        }
    }

    /// Connect over WebSocket.
    pub fn connect(options: TransportOptions) -> Self {
        Self::builder(options).connect()
    }

    /// Connect through the given connector.
    pub fn with_connector<C: Connector>(options: TransportOptions, connector: C) -> Self {
        Self::builder(options).spawn(connector)
    }

    /// Register a listener for one event kind.
    ///
    /// Events that fired before registration are not replayed.
    pub fn add_event_listener<F>(&self, kind: TransportEventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.sender.shared.events.add_event_listener(kind, callback)
    }

    /// Register a listener that may prevent the default action.
    pub fn add_event_listener_with<F>(&self, kind: TransportEventKind, callback: F) -> ListenerId
    where
        F: Fn(&TransportEvent) -> DefaultAction + Send + Sync + 'static,
    {
        self.sender.shared.events.add_event_listener_with(kind, callback)
    }

    /// Unregister a listener.
    pub fn remove_event_listener(&self, kind: TransportEventKind, id: ListenerId) -> bool {
        self.sender.shared.events.remove_event_listener(kind, id)
    }

    /// Dispatch an event to this transport's listeners.
    ///
    /// Returns `false` if a listener prevented the default action.
    pub fn dispatch_event(&self, event: &TransportEvent) -> bool {
        self.sender.shared.events.dispatch_event(event)
    }

    /// See [`TransportSender::send`].
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.sender.send(text)
    }

    /// See [`TransportSender::send_json`].
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        self.sender.send_json(value)
    }

    /// See [`TransportSender::close`].
    pub fn close(&self, code: u16, reason: &str) {
        self.sender.close(code, reason);
    }

    /// See [`TransportSender::ready_state`].
    pub fn ready_state(&self) -> ReadyState {
        self.sender.ready_state()
    }

    /// See [`TransportSender::connection_state`].
    pub fn connection_state(&self) -> ConnectionState {
        self.sender.connection_state()
    }

    /// See [`TransportSender::is_active`].
    pub fn is_active(&self) -> bool {
        self.sender.is_active()
    }

    /// See [`TransportSender::wait_open`].
    pub async fn wait_open(&self) -> Result<(), TransportError> {
        self.sender.wait_open().await
    }

    /// See [`TransportSender::wait_closed`].
    pub async fn wait_closed(&self) {
        self.sender.wait_closed().await;
    }

    /// A cloneable sender for this transport.
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// The options this transport was built with.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }
}

impl Drop for ResilientTransport {
    fn drop(&mut self) {
        self.sender.close(NORMAL_CLOSURE, "");
    }
}
