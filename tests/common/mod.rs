//! Shared helpers for the end-to-end tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::time::Duration;

use gqlsocket::events::Event;
use gqlsocket::transport::TransportBuilder;
use gqlsocket::{RetryLimit, RetryPolicy, TransportEvent, TransportEventKind, TransportOptions};
use tokio::sync::mpsc;

/// Every transport event kind.
pub const ALL_KINDS: [TransportEventKind; 9] = [
    TransportEventKind::Start,
    TransportEventKind::Reopen,
    TransportEventKind::Open,
    TransportEventKind::Stop,
    TransportEventKind::Disconnected,
    TransportEventKind::Abort,
    TransportEventKind::Close,
    TransportEventKind::Error,
    TransportEventKind::Message,
];

/// Retry delay used throughout the tests.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Options for the in-memory address with a short retry delay.
pub fn options(limit: RetryLimit) -> TransportOptions {
    TransportOptions::new("memory://graphql").retry_policy(RetryPolicy::new(RETRY_DELAY, limit))
}

/// Collects transport events in dispatch order.
#[derive(Debug)]
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventLog {
    /// Listen to every kind on a builder before it is spawned.
    pub fn attach(builder: &TransportBuilder) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in ALL_KINDS {
            let tx = tx.clone();
            builder.add_event_listener(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        Self { rx }
    }

    /// Events up to and including the first one of `kind`.
    pub async fn until(&mut self, kind: TransportEventKind) -> Vec<TransportEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let done = event.kind() == kind;
            seen.push(event);
            if done {
                return seen;
            }
        }
        panic!("event stream ended before {kind:?}; saw {seen:?}");
    }

    /// Kinds up to and including the first one of `kind`.
    pub async fn kinds_until(&mut self, kind: TransportEventKind) -> Vec<TransportEventKind> {
        self.until(kind).await.iter().map(Event::kind).collect()
    }

    /// Events already dispatched and not yet consumed.
    pub fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Let the driver run long enough for any pending reconnect to fire.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(30)).await;
}
