use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Map as JsonMap;
use serde_json::Value;

use crate::error::GraphQLError;

/// A single operation handed to the transport. The query text is the plan's
/// canonical print, not the caller's original source.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub query: String,
    pub variables: JsonMap<String, Value>,
    pub headers: Vec<(String, String)>,
}

impl TransportRequest {
    pub fn new(query: impl Into<String>, variables: JsonMap<String, Value>) -> Self {
        Self {
            query: query.into(),
            variables,
            headers: Vec::new(),
        }
    }
}

/// The transport's answer. `error` is a transport-level failure (the request
/// never produced a GraphQL result); `errors` are GraphQL execution errors
/// that the cache aggregates but does not interpret.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub data: Option<Value>,
    pub errors: Vec<GraphQLError>,
    pub error: Option<String>,
}

impl TransportResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// The network boundary of the cache. The cache calls the transport; it does
/// not decode GraphQL errors beyond routing them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a query or mutation over the request/response channel.
    async fn http(&self, request: TransportRequest) -> TransportResponse;

    /// Open a subscription. Each yielded response is normalized into the
    /// cache as it arrives.
    fn websocket(&self, request: TransportRequest) -> BoxStream<'static, TransportResponse>;
}
