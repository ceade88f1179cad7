//! gqlsocket - resilient WebSocket transport with GraphQL operation
//! multiplexing.
//!
//! This crate keeps one logical socket connection alive across unexpected
//! drops and runs many GraphQL-style queries and subscriptions over it.
//!
//! # Architecture
//!
//! - **Events** - per-instance listener registry with snapshot dispatch
//! - **Socket** - `Connector` seam with WebSocket and in-memory implementations
//! - **Transport** - reconnecting connection driven by a background task
//! - **Multiplexer** - operation ids, wire envelopes, routing, replay
//!
//! # Modules
//!
//! - [`events`] - event listener registry
//! - [`socket`] - socket collaborator traits and implementations
//! - [`protocol`] - wire envelopes and descriptors
//! - [`transport`] - resilient transport and lifecycle state machine
//! - [`multiplexer`] - `GraphQLSocket` client
//! - [`config`] - configuration loading

// Library modules
pub mod config;
pub mod events;
pub mod multiplexer;
pub mod protocol;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use config::ClientConfig;
pub use events::{DefaultAction, Event, EventRegistry, EventTarget, ListenerId};
pub use multiplexer::{GraphQLSocket, MultiplexError};
pub use protocol::{Descriptor, OperationId, RequestOptions, Response};
pub use transport::{
    CloseInfo, ConnectionState, ReadyState, ResilientTransport, RetryLimit, RetryPolicy,
    TransportError, TransportEvent, TransportEventKind, TransportOptions, TransportSender,
};
