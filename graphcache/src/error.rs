use serde::Deserialize;
use serde::Serialize;

/// One error from a GraphQL execution result, as delivered by the transport.
///
/// The cache routes these without interpreting them beyond aggregation; the
/// optional path points into the response data the way the server spelled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
        }
    }
}

/// A single step of a response path: an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// A `cache-only` operation could not be satisfied from local state.
    ///
    /// Surfaced to the immediate caller, never logged.
    #[error("operation {signature} could not be satisfied from the cache")]
    CacheMiss { signature: String },

    /// A network reply arrived after its operation was superseded. The
    /// content is discarded and recovery happens locally.
    #[error("response arrived after its operation was superseded")]
    StaleResponse,

    /// Aggregate of partial errors from a single operation.
    #[error("operation failed with {} error(s)", .errors.len())]
    Combined { errors: Vec<GraphQLError> },

    /// A store contract violation: the caller handed over an identifier the
    /// store cannot accept. A bug in the caller.
    #[error("invalid record id: {message}")]
    InvalidRecordId { message: String },

    /// A write carried a `__typename` that contradicts the concrete part of
    /// the record id. A bug in the caller.
    #[error("type mismatch writing {id}: record is {expected}, payload says {actual}")]
    TypeMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    /// Opaque failure forwarded from the transport.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Malformed document or a construct the planner does not support.
    #[error("invalid document: {message}")]
    Plan { message: String },

    /// An invariant the cache relies on did not hold.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CacheError {
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn plan(message: impl Into<String>) -> Self {
        Self::Plan {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_record_id(message: impl Into<String>) -> Self {
        Self::InvalidRecordId {
            message: message.into(),
        }
    }

    /// Whether this error may be recovered from without surfacing to the
    /// caller's error callback.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::StaleResponse | Self::CacheMiss { .. })
    }
}
