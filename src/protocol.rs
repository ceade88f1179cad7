//! Wire protocol for the operation multiplexer.
//!
//! Every frame is a single JSON object.
//!
//! Outbound (client → server):
//!
//! ```json
//! {"type": "sub",       "query": "subscription { ... }", "operation": "Op", "variables": {}, "id": 0}
//! {"type": "subId",     "query": "PersistedName", "id": 1}
//! {"type": "query",     "query": "query { ... }", "id": 2}
//! {"type": "queryId",   "query": "PersistedName", "id": 3}
//! {"type": "subCancel", "id": 0}
//! ```
//!
//! Absent optional fields are omitted, never sent as `null`.
//!
//! Inbound (server → client):
//!
//! ```json
//! {"id": 0, "done": false, "value": {"data": {...}, "errors": [...]}}
//! {"id": 0, "done": true}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Variables map sent alongside an operation.
pub type Variables = serde_json::Map<String, Value>;

/// Client-assigned operation identifier.
///
/// Allocated from a per-client counter starting at 0 and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the operation text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Persisted operation, referenced by name.
    ByName(String),
    /// Full operation text.
    ByBody(String),
}

/// A resolved operation: exactly one source plus optional selector and
/// variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Operation text or persisted name.
    pub source: Source,
    /// Operation name to execute when the document has several.
    pub operation: Option<String>,
    /// Variables for the operation.
    pub variables: Option<Variables>,
}

impl Descriptor {
    /// Descriptor carrying the full operation text.
    pub fn by_body(body: impl Into<String>) -> Self {
        Self {
            source: Source::ByBody(body.into()),
            operation: None,
            variables: None,
        }
    }

    /// Descriptor referencing a persisted operation.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            source: Source::ByName(name.into()),
            operation: None,
            variables: None,
        }
    }

    /// Select the operation to run.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attach variables.
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = Some(variables);
        self
    }
}

/// Loose request shape, as accepted from callers and configuration.
///
/// Resolved into a [`Descriptor`] with `Descriptor::try_from`; exactly one
/// of `query` and `id` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Full operation text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Persisted operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// Variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Variables>,
}

impl RequestOptions {
    /// Request with the full operation text.
    pub fn body(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }

    /// Request for a persisted operation.
    pub fn name(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Set the operation name.
    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Set the variables.
    pub fn vars(mut self, vars: Variables) -> Self {
        self.vars = Some(vars);
        self
    }
}

impl From<Descriptor> for RequestOptions {
    fn from(descriptor: Descriptor) -> Self {
        let (query, id) = match descriptor.source {
            Source::ByBody(body) => (Some(body), None),
            Source::ByName(name) => (None, Some(name)),
        };
        Self {
            query,
            id,
            op: descriptor.operation,
            vars: descriptor.variables,
        }
    }
}

impl TryFrom<RequestOptions> for Descriptor {
    type Error = DescriptorError;

    fn try_from(options: RequestOptions) -> Result<Self, Self::Error> {
        let source = match (options.query, options.id) {
            (Some(body), None) => Source::ByBody(body),
            (None, Some(name)) => Source::ByName(name),
            (None, None) => return Err(DescriptorError::Missing),
            (Some(_), Some(_)) => return Err(DescriptorError::Ambiguous),
        };
        Ok(Self {
            source,
            operation: options.op,
            variables: options.vars,
        })
    }
}

/// Why a [`RequestOptions`] could not become a [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// Neither `query` nor `id` was given.
    Missing,
    /// Both `query` and `id` were given.
    Ambiguous,
}

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing operation: set either query or id"),
            Self::Ambiguous => write!(f, "ambiguous operation: query and id are both set"),
        }
    }
}

impl std::error::Error for DescriptorError {}

/// Whether an operation is long-lived or single-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Receives values until cancelled or completed.
    Subscription,
    /// Receives at most one value.
    Query,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscription => write!(f, "subscription"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// Outbound envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    /// Subscribe with the operation text.
    #[serde(rename = "sub")]
    Subscribe,
    /// Subscribe to a persisted operation.
    #[serde(rename = "subId")]
    SubscribeByName,
    /// Query with the operation text.
    #[serde(rename = "query")]
    Query,
    /// Query a persisted operation.
    #[serde(rename = "queryId")]
    QueryByName,
    /// Cancel a subscription.
    #[serde(rename = "subCancel")]
    Cancel,
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    /// Operation text or persisted name, depending on `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,
    /// Operation id.
    pub id: OperationId,
}

impl OutboundEnvelope {
    /// `sub` / `subId` frame for a descriptor.
    pub fn subscribe(id: OperationId, descriptor: &Descriptor) -> Self {
        Self::start(OperationKind::Subscription, id, descriptor)
    }

    /// `query` / `queryId` frame for a descriptor.
    pub fn query(id: OperationId, descriptor: &Descriptor) -> Self {
        Self::start(OperationKind::Query, id, descriptor)
    }

    /// Frame starting an operation of the given kind.
    pub fn start(kind: OperationKind, id: OperationId, descriptor: &Descriptor) -> Self {
        let (envelope_type, text) = match (kind, &descriptor.source) {
            (OperationKind::Subscription, Source::ByBody(body)) => (EnvelopeType::Subscribe, body),
            (OperationKind::Subscription, Source::ByName(name)) => {
                (EnvelopeType::SubscribeByName, name)
            }
            (OperationKind::Query, Source::ByBody(body)) => (EnvelopeType::Query, body),
            (OperationKind::Query, Source::ByName(name)) => (EnvelopeType::QueryByName, name),
        };
        Self {
            kind: envelope_type,
            query: Some(text.clone()),
            operation: descriptor.operation.clone(),
            variables: descriptor.variables.clone(),
            id,
        }
    }

    /// `subCancel` frame.
    pub fn cancel(id: OperationId) -> Self {
        Self {
            kind: EnvelopeType::Cancel,
            query: None,
            operation: None,
            variables: None,
            id,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Operation the frame belongs to.
    pub id: OperationId,
    /// `true` when the server has finished the operation.
    #[serde(default)]
    pub done: bool,
    /// Result payload (absent or `null` on completion frames).
    #[serde(default)]
    pub value: Option<Response>,
}

impl InboundEnvelope {
    /// Parse an inbound text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// GraphQL-style result payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Result data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Errors reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,
}

impl Response {
    /// `true` when the response carries no errors.
    pub fn is_ok(&self) -> bool {
        self.errors.as_ref().is_none_or(Vec::is_empty)
    }
}

/// A single error entry of a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    /// Human-readable message.
    pub message: String,
    /// Source locations the error refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    /// Response path of the failing field (names and list indices).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
}

/// Line/column position in the operation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}
