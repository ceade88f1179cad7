//! GraphQL operation multiplexer.
//!
//! [`GraphQLSocket`] runs many queries and subscriptions over one
//! [`ResilientTransport`]. It assigns each operation an id, encodes the
//! start/cancel envelopes, and routes inbound envelopes back to the handler
//! that started the operation.
//!
//! # Reconnects
//!
//! On every close, each subscription's disconnect handler and each pending
//! query's disconnect handler runs once; pending queries are then forgotten.
//! Subscriptions are kept, and when the transport reopens they are sent
//! again in id order with their original ids, so the server resumes them
//! under the same id.
//!
//! When the transport stops or gives up, subscriptions are dropped after
//! their disconnect handlers ran, so channel receivers see the end of the
//! stream.
//!
//! # Reentrancy
//!
//! Handlers run on the transport's driver task after the operation table
//! lock has been released. A handler may subscribe, query or unsubscribe.
//!
//! # Example
//!
//! ```ignore
//! let client = GraphQLSocket::connect(TransportOptions::new("ws://localhost:4000/graphql"));
//! client.wait_open().await?;
//!
//! let id = client.subscribe(RequestOptions::body("subscription { ticks }"), |response| {
//!     println!("{:?}", response.data);
//! })?;
//!
//! let response = client.query_async(RequestOptions::name("Viewer")).await?;
//! client.unsubscribe(id);
//! ```

// Rust guideline compliant 2026-02

mod operations;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::config::ClientConfig;
use crate::protocol::{
    Descriptor, DescriptorError, InboundEnvelope, OperationId, OperationKind, OutboundEnvelope,
    RequestOptions, Response,
};
use crate::socket::ws::WsConnector;
use crate::socket::Connector;
use crate::transport::{
    CloseInfo, ConnectionState, ReadyState, ResilientTransport, TransportError,
    TransportEvent, TransportEventKind, TransportOptions, TransportSender, WeakTransportSender,
    NORMAL_CLOSURE,
};

use operations::{
    DisconnectHandler, OperationTable, PendingQuery, QueryCallback, Routed, Subscription,
    ValueHandler,
};

/// Errors returned by multiplexer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexError {
    /// The request named no operation, or named it twice.
    InvalidDescriptor(DescriptorError),
    /// The transport refused the send.
    Transport(TransportError),
    /// The envelope could not be serialized.
    Encode(String),
    /// The connection closed before the query's result arrived.
    Disconnected(CloseInfo),
    /// The server completed the query without sending a value.
    Completed,
}

impl fmt::Display for MultiplexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDescriptor(e) => write!(f, "invalid operation: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(msg) => write!(f, "failed to encode operation: {msg}"),
            Self::Disconnected(info) => write!(f, "disconnected before result ({info})"),
            Self::Completed => write!(f, "operation completed without a result"),
        }
    }
}

impl std::error::Error for MultiplexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidDescriptor(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for MultiplexError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<DescriptorError> for MultiplexError {
    fn from(e: DescriptorError) -> Self {
        Self::InvalidDescriptor(e)
    }
}

fn lock(table: &Mutex<OperationTable>) -> MutexGuard<'_, OperationTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Query/subscription client over a resilient socket.
///
/// Dropping the client closes the underlying transport.
#[derive(Debug)]
pub struct GraphQLSocket {
    transport: ResilientTransport,
    table: Arc<Mutex<OperationTable>>,
}

impl GraphQLSocket {
    /// Connect over WebSocket.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(options: TransportOptions) -> Self {
        Self::with_connector(options, WsConnector)
    }

    /// Connect over WebSocket using a loaded configuration.
    ///
    /// `host` supplies the host for the default address when the
    /// configuration has no URL.
    pub fn from_config<F>(config: &ClientConfig, host: F) -> anyhow::Result<Self>
    where
        F: FnOnce() -> Option<String>,
    {
        Ok(Self::connect(config.transport_options(host)?))
    }

    /// Connect through the given connector.
    pub fn with_connector<C: Connector>(options: TransportOptions, connector: C) -> Self {
        let builder = ResilientTransport::builder(options);
        let table = Arc::new(Mutex::new(OperationTable::new()));

        {
            let table = Arc::clone(&table);
            builder.add_event_listener(TransportEventKind::Message, move |event| {
                if let TransportEvent::Message(text) = event {
                    route_message(&table, text);
                }
            });
        }
        {
            let table = Arc::clone(&table);
            let sender = builder.sender().downgrade();
            builder.add_event_listener(TransportEventKind::Reopen, move |_| {
                if let Some(sender) = sender.upgrade() {
                    replay_subscriptions(&table, &sender);
                }
            });
        }
        {
            let table = Arc::clone(&table);
            let sender = builder.sender().downgrade();
            builder.add_event_listener(TransportEventKind::Close, move |event| {
                if let Some(info) = event.close_info() {
                    notify_disconnect(&table, info);
                }
                // No reconnect follows a stop or an abort
                let finished = sender
                    .upgrade()
                    .map_or(true, |sender| sender.connection_state() == ConnectionState::Closed);
                if finished {
                    let cleared = lock(&table).clear_subscriptions();
                    if cleared > 0 {
                        log::info!(
                            "[multiplexer] Transport finished; dropped {} subscriptions",
                            cleared
                        );
                    }
                }
            });
        }

        Self {
            transport: builder.spawn(connector),
            table,
        }
    }

    /// Start a subscription.
    ///
    /// `on_value` runs for every value the server sends until the
    /// subscription is cancelled or completed.
    pub fn subscribe<F>(
        &self,
        options: impl Into<RequestOptions>,
        on_value: F,
    ) -> Result<OperationId, MultiplexError>
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        let on_value: ValueHandler = Arc::new(on_value);
        self.start_subscription(options.into(), |_| on_value, None)
    }

    /// Start a subscription that is also told about every disconnect.
    ///
    /// The subscription survives disconnects and resumes after a reconnect;
    /// `on_disconnect` runs once per close.
    pub fn subscribe_with_disconnect<F, D>(
        &self,
        options: impl Into<RequestOptions>,
        on_value: F,
        on_disconnect: D,
    ) -> Result<OperationId, MultiplexError>
    where
        F: Fn(Response) + Send + Sync + 'static,
        D: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        let on_value: ValueHandler = Arc::new(on_value);
        self.start_subscription(options.into(), |_| on_value, Some(Arc::new(on_disconnect)))
    }

    /// Start a subscription whose values arrive on a channel.
    ///
    /// The channel closes when the subscription is cancelled, completed by
    /// the server, cleared by [`close`](Self::close), or when the transport
    /// gives up. Dropping the receiver cancels the subscription the next time
    /// a value arrives for it.
    pub fn subscribe_channel(
        &self,
        options: impl Into<RequestOptions>,
    ) -> Result<(OperationId, mpsc::UnboundedReceiver<Response>), MultiplexError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let table = Arc::downgrade(&self.table);
        let sender = self.transport.sender().downgrade();

        let id = self.start_subscription(
            options.into(),
            move |id| {
                let handler: ValueHandler = Arc::new(move |response: Response| {
                    if tx.send(response).is_err() {
                        cancel_abandoned(&table, &sender, id);
                    }
                });
                handler
            },
            None,
        )?;
        Ok((id, rx))
    }

    /// Send a query; `on_result` runs at most once.
    pub fn query<F>(
        &self,
        options: impl Into<RequestOptions>,
        on_result: F,
    ) -> Result<OperationId, MultiplexError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.start_query(
            options.into(),
            Box::new(move |outcome| {
                if let Ok(response) = outcome {
                    on_result(response);
                }
            }),
        )
    }

    /// Send a query; exactly one of `on_result` and `on_disconnect` runs,
    /// unless the server completes the query without a value.
    pub fn query_with_disconnect<F, D>(
        &self,
        options: impl Into<RequestOptions>,
        on_result: F,
        on_disconnect: D,
    ) -> Result<OperationId, MultiplexError>
    where
        F: FnOnce(Response) + Send + 'static,
        D: FnOnce(&CloseInfo) + Send + 'static,
    {
        self.start_query(
            options.into(),
            Box::new(move |outcome| match outcome {
                Ok(response) => on_result(response),
                Err(info) => on_disconnect(&info),
            }),
        )
    }

    /// Send a query and wait for its result.
    pub async fn query_async(
        &self,
        options: impl Into<RequestOptions>,
    ) -> Result<Response, MultiplexError> {
        let (tx, rx) = oneshot::channel();
        self.start_query(
            options.into(),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;

        match rx.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(info)) => Err(MultiplexError::Disconnected(info)),
            // Callback dropped unused: the server completed the query
            Err(_completed) => Err(MultiplexError::Completed),
        }
    }

    /// Cancel a subscription.
    ///
    /// Sends one `subCancel` and forgets the subscription. Returns `false`
    /// (and sends nothing) if the id is not a live subscription.
    pub fn unsubscribe(&self, id: OperationId) -> bool {
        if !cancel_subscription(&self.table, &self.transport.sender(), id) {
            log::warn!("[multiplexer] Invalid subscription id: {}", id);
            return false;
        }
        true
    }

    /// Close the connection and forget every subscription.
    ///
    /// No cancellations are sent. Pending queries are failed through the
    /// transport's close event.
    pub fn close(&self) {
        let cleared = lock(&self.table).clear_subscriptions();
        log::info!("[multiplexer] Closing; dropped {} subscriptions", cleared);
        self.transport.close(NORMAL_CLOSURE, "");
    }

    /// Wait until the underlying socket is open.
    pub async fn wait_open(&self) -> Result<(), MultiplexError> {
        Ok(self.transport.wait_open().await?)
    }

    /// Wait until the underlying transport has stopped or aborted.
    pub async fn wait_closed(&self) {
        self.transport.wait_closed().await;
    }

    /// Ready state of the underlying socket.
    pub fn ready_state(&self) -> ReadyState {
        self.transport.ready_state()
    }

    /// `false` once the client has been closed.
    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        lock(&self.table).subscription_count()
    }

    /// Number of queries still waiting for a result.
    pub fn query_count(&self) -> usize {
        lock(&self.table).query_count()
    }

    /// Ids of live subscriptions, ascending.
    pub fn subscription_ids(&self) -> Vec<OperationId> {
        lock(&self.table).subscription_ids()
    }

    /// The underlying transport, e.g. to observe lifecycle events.
    pub fn transport(&self) -> &ResilientTransport {
        &self.transport
    }

    /// `make_handler` receives the allocated id before the start frame is
    /// sent.
    fn start_subscription<H>(
        &self,
        options: RequestOptions,
        make_handler: H,
        on_disconnect: Option<DisconnectHandler>,
    ) -> Result<OperationId, MultiplexError>
    where
        H: FnOnce(OperationId) -> ValueHandler,
    {
        let descriptor = resolve(options, OperationKind::Subscription)?;

        let (id, envelope) = {
            let mut table = lock(&self.table);
            let id = table.allocate_id();
            let envelope = OutboundEnvelope::subscribe(id, &descriptor);
            table.track_subscription(
                id,
                Subscription {
                    descriptor,
                    on_value: make_handler(id),
                    on_disconnect,
                },
            );
            (id, envelope)
        };

        if let Err(e) = self.send_envelope(&envelope) {
            lock(&self.table).remove_subscription(id);
            log::warn!("[multiplexer] Subscription {} not started: {}", id, e);
            return Err(e);
        }

        log::debug!("[multiplexer] Started subscription {}", id);
        Ok(id)
    }

    fn start_query(
        &self,
        options: RequestOptions,
        complete: QueryCallback,
    ) -> Result<OperationId, MultiplexError> {
        let descriptor = resolve(options, OperationKind::Query)?;

        let (id, envelope) = {
            let mut table = lock(&self.table);
            let id = table.allocate_id();
            let envelope = OutboundEnvelope::query(id, &descriptor);
            table.track_query(
                id,
                PendingQuery {
                    descriptor,
                    complete,
                },
            );
            (id, envelope)
        };

        if let Err(e) = self.send_envelope(&envelope) {
            lock(&self.table).remove_query(id);
            log::warn!("[multiplexer] Query {} not sent: {}", id, e);
            return Err(e);
        }

        log::debug!("[multiplexer] Sent query {}", id);
        Ok(id)
    }

    fn send_envelope(&self, envelope: &OutboundEnvelope) -> Result<(), MultiplexError> {
        let text = envelope
            .encode()
            .map_err(|e| MultiplexError::Encode(e.to_string()))?;
        self.transport.send(text)?;
        Ok(())
    }
}

/// Resolve caller options, logging rejections.
fn resolve(options: RequestOptions, kind: OperationKind) -> Result<Descriptor, MultiplexError> {
    Descriptor::try_from(options).map_err(|e| {
        log::warn!("[multiplexer] Rejected {}: {}", kind, e);
        MultiplexError::InvalidDescriptor(e)
    })
}

fn route_message(table: &Mutex<OperationTable>, text: &str) {
    let envelope = match InboundEnvelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("[multiplexer] Dropping malformed message: {}", e);
            return;
        }
    };

    let routed = lock(table).route(envelope);
    // Lock released here

    match routed {
        Routed::Subscription(_, on_value, response) => on_value(response),
        Routed::Query(_, complete, response) => complete(Ok(response)),
        Routed::Completed(id, Some(kind)) => {
            log::debug!("[multiplexer] Server completed {} {}", kind, id);
        }
        Routed::Completed(id, None) => {
            log::debug!("[multiplexer] Completion for unknown id {}", id);
        }
        Routed::Unknown(id) => {
            log::warn!("[multiplexer] Invalid operation id: {}", id);
        }
    }
}

/// Forget a subscription and tell the server; `false` if it was not live.
fn cancel_subscription(
    table: &Mutex<OperationTable>,
    sender: &TransportSender,
    id: OperationId,
) -> bool {
    if !lock(table).remove_subscription(id) {
        return false;
    }

    match sender.send_json(&OutboundEnvelope::cancel(id)) {
        Ok(()) => log::debug!("[multiplexer] Cancelled subscription {}", id),
        Err(e) => log::debug!("[multiplexer] Cancel for {} not sent: {}", id, e),
    }
    true
}

/// Cancel a channel subscription whose receiver was dropped.
fn cancel_abandoned(
    table: &Weak<Mutex<OperationTable>>,
    sender: &WeakTransportSender,
    id: OperationId,
) {
    let (Some(table), Some(sender)) = (table.upgrade(), sender.upgrade()) else {
        return;
    };
    if cancel_subscription(&table, &sender, id) {
        log::info!("[multiplexer] Receiver for subscription {} dropped, cancelled", id);
    }
}

fn replay_subscriptions(table: &Mutex<OperationTable>, sender: &TransportSender) {
    let envelopes = lock(table).replay_envelopes();
    if envelopes.is_empty() {
        return;
    }

    log::info!("[multiplexer] Resubscribing {} subscriptions", envelopes.len());
    for envelope in envelopes {
        let result = envelope
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))
            .and_then(|text| sender.send(text));
        if let Err(e) = result {
            log::warn!("[multiplexer] Failed to resubscribe {}: {}", envelope.id, e);
        }
    }
}

fn notify_disconnect(table: &Mutex<OperationTable>, info: &CloseInfo) {
    let batch = lock(table).take_disconnect_batch();
    log::debug!(
        "[multiplexer] Connection closed ({}); notifying {} handlers",
        info,
        batch.len()
    );
    batch.notify(info);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::memory;
    use crate::transport::{RetryLimit, RetryPolicy};
    use serde_json::json;
    use std::time::Duration;

    fn options() -> TransportOptions {
        TransportOptions::new("memory://graphql").retry_policy(RetryPolicy::new(
            Duration::from_millis(100),
            RetryLimit::Unlimited,
        ))
    }

    #[test]
    fn test_error_display_and_source() {
        let err = MultiplexError::from(DescriptorError::Missing);
        assert!(err.to_string().starts_with("invalid operation"));
        assert!(std::error::Error::source(&err).is_some());

        let err = MultiplexError::Disconnected(CloseInfo::abnormal("stream ended"));
        assert_eq!(
            err.to_string(),
            "disconnected before result (code 1006: stream ended)"
        );
        assert!(std::error::Error::source(&err).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_descriptor_consumes_no_id() {
        let (connector, mut server) = memory::pair();
        let client = GraphQLSocket::with_connector(options(), connector);
        client.wait_open().await.unwrap();
        let mut conn = server.accept().await.unwrap();

        let err = client.subscribe(RequestOptions::default(), |_| {}).unwrap_err();
        assert_eq!(err, MultiplexError::InvalidDescriptor(DescriptorError::Missing));

        let id = client
            .subscribe(RequestOptions::body("subscription { a }"), |_| {})
            .unwrap();
        assert_eq!(id, OperationId(0));
        assert_eq!(
            conn.recv_json().await.unwrap(),
            json!({"type": "sub", "query": "subscription { a }", "id": 0})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_consumes_id_without_tracking() {
        let (connector, server) = memory::pair();
        server.set_refusing(true);
        let client = GraphQLSocket::with_connector(options(), connector);

        let err = client
            .query(RequestOptions::body("{ a }"), |_| {})
            .unwrap_err();
        assert_eq!(err, MultiplexError::Transport(TransportError::NotOpen));
        assert_eq!(client.query_count(), 0);

        server.set_refusing(false);
        client.wait_open().await.unwrap();
        let id = client.query(RequestOptions::body("{ a }"), |_| {}).unwrap();
        assert_eq!(id, OperationId(1));
    }

    /// A handler may start new operations from inside the driver task.
    #[tokio::test(start_paused = true)]
    async fn test_handler_can_reenter_client() {
        let (connector, mut server) = memory::pair();
        let client = Arc::new(GraphQLSocket::with_connector(options(), connector));
        client.wait_open().await.unwrap();
        let mut conn = server.accept().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let inner = Arc::downgrade(&client);
            client
                .subscribe(RequestOptions::name("Ticks"), move |_| {
                    if let Some(client) = inner.upgrade() {
                        let _ = tx.send(client.unsubscribe(OperationId(0)));
                    }
                })
                .unwrap();
        }
        conn.recv_json().await.unwrap();

        conn.send_json(&json!({"id": 0, "done": false, "value": {"data": 1}}));
        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(
            conn.recv_json().await.unwrap(),
            json!({"type": "subCancel", "id": 0})
        );
        assert_eq!(client.subscription_count(), 0);
    }
}
