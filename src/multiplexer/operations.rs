//! Operation table.
//!
//! Tracks live subscriptions and pending queries by id. Purely synchronous;
//! the caller holds it behind a mutex and invokes any handler it hands back
//! only after releasing the lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::protocol::{
    Descriptor, InboundEnvelope, OperationId, OperationKind, OutboundEnvelope, Response,
};
use crate::transport::CloseInfo;

/// Subscription value handler (many-shot).
pub(crate) type ValueHandler = Arc<dyn Fn(Response) + Send + Sync>;

/// Disconnect handler.
pub(crate) type DisconnectHandler = Arc<dyn Fn(&CloseInfo) + Send + Sync>;

/// Query completion (single-shot): the result, or the close that lost it.
pub(crate) type QueryCallback = Box<dyn FnOnce(Result<Response, CloseInfo>) + Send>;

pub(crate) struct Subscription {
    pub(crate) descriptor: Descriptor,
    pub(crate) on_value: ValueHandler,
    pub(crate) on_disconnect: Option<DisconnectHandler>,
}

pub(crate) struct PendingQuery {
    pub(crate) descriptor: Descriptor,
    pub(crate) complete: QueryCallback,
}

/// Where an inbound envelope went.
pub(crate) enum Routed {
    /// Deliver the value to a subscription handler.
    Subscription(OperationId, ValueHandler, Response),
    /// Complete a query; its record has been removed.
    Query(OperationId, QueryCallback, Response),
    /// The server finished an operation; its record (if any) was removed.
    Completed(OperationId, Option<OperationKind>),
    /// Value for an id nobody is waiting for.
    Unknown(OperationId),
}

impl fmt::Debug for Routed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription(id, _, _) => f.debug_tuple("Subscription").field(id).finish(),
            Self::Query(id, _, _) => f.debug_tuple("Query").field(id).finish(),
            Self::Completed(id, kind) => f.debug_tuple("Completed").field(id).field(kind).finish(),
            Self::Unknown(id) => f.debug_tuple("Unknown").field(id).finish(),
        }
    }
}

/// Handlers to notify about a lost connection.
pub(crate) struct DisconnectBatch {
    subscriptions: Vec<DisconnectHandler>,
    queries: Vec<QueryCallback>,
}

impl DisconnectBatch {
    /// Invoke subscription handlers, then query handlers.
    pub(crate) fn notify(self, info: &CloseInfo) {
        for handler in self.subscriptions {
            handler(info);
        }
        for complete in self.queries {
            complete(Err(info.clone()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len() + self.queries.len()
    }
}

/// Live operations of one client.
#[derive(Default)]
pub(crate) struct OperationTable {
    next_id: u64,
    subscriptions: BTreeMap<OperationId, Subscription>,
    queries: BTreeMap<OperationId, PendingQuery>,
}

impl fmt::Debug for OperationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTable")
            .field("next_id", &self.next_id)
            .field("subscriptions", &self.subscriptions.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl OperationTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Next id; never handed out twice.
    pub(crate) fn allocate_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn track_subscription(&mut self, id: OperationId, subscription: Subscription) {
        self.subscriptions.insert(id, subscription);
    }

    pub(crate) fn track_query(&mut self, id: OperationId, query: PendingQuery) {
        self.queries.insert(id, query);
    }

    /// Forget a subscription. Returns `false` if the id is not live.
    pub(crate) fn remove_subscription(&mut self, id: OperationId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Forget a pending query. Returns `false` if the id is not pending.
    pub(crate) fn remove_query(&mut self, id: OperationId) -> bool {
        self.queries.remove(&id).is_some()
    }

    /// Resolve an inbound envelope to its destination.
    ///
    /// Subscriptions are matched before queries. A query is removed when it
    /// receives its value; a completion removes either kind.
    pub(crate) fn route(&mut self, envelope: InboundEnvelope) -> Routed {
        let id = envelope.id;

        if envelope.done {
            let kind = if self.subscriptions.remove(&id).is_some() {
                Some(OperationKind::Subscription)
            } else if self.queries.remove(&id).is_some() {
                Some(OperationKind::Query)
            } else {
                None
            };
            return Routed::Completed(id, kind);
        }

        let response = envelope.value.unwrap_or_default();

        if let Some(subscription) = self.subscriptions.get(&id) {
            return Routed::Subscription(id, Arc::clone(&subscription.on_value), response);
        }
        if let Some(query) = self.queries.remove(&id) {
            return Routed::Query(id, query.complete, response);
        }
        Routed::Unknown(id)
    }

    /// Start frames for every live subscription, in id order, with their
    /// original ids and descriptors.
    pub(crate) fn replay_envelopes(&self) -> Vec<OutboundEnvelope> {
        self.subscriptions
            .iter()
            .map(|(id, subscription)| OutboundEnvelope::subscribe(*id, &subscription.descriptor))
            .collect()
    }

    /// Collect disconnect handlers and drop every pending query.
    ///
    /// Subscriptions stay tracked so they can be replayed.
    pub(crate) fn take_disconnect_batch(&mut self) -> DisconnectBatch {
        let subscriptions = self
            .subscriptions
            .values()
            .filter_map(|s| s.on_disconnect.as_ref().map(Arc::clone))
            .collect();
        let queries = std::mem::take(&mut self.queries)
            .into_iter()
            .map(|(id, query)| {
                log::debug!(
                    "[multiplexer] Query {} lost to disconnect ({:?})",
                    id,
                    query.descriptor.source
                );
                query.complete
            })
            .collect();
        DisconnectBatch {
            subscriptions,
            queries,
        }
    }

    /// Forget every subscription without notifying anyone.
    pub(crate) fn clear_subscriptions(&mut self) -> usize {
        let count = self.subscriptions.len();
        self.subscriptions.clear();
        count
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub(crate) fn subscription_ids(&self) -> Vec<OperationId> {
        self.subscriptions.keys().copied().collect()
    }
}
