//! Shared fixtures: a scripted transport and payload builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use graphcache::CacheOptions;
use graphcache::GraphCache;
use graphcache::Transport;
use graphcache::TransportRequest;
use graphcache::TransportResponse;
use graphcache::Variables;
use serde_json::json;
use serde_json::Value;

/// A transport that replays scripted responses and counts calls.
pub struct MockTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    events: Mutex<Vec<TransportResponse>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    /// Responses resolve only after this long; lets tests overlap calls.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub fn push_data(&self, data: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(TransportResponse::data(data));
    }

    pub fn push_response(&self, response: TransportResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_event(&self, data: Value) {
        self.events
            .lock()
            .unwrap()
            .push(TransportResponse::data(data));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn http(&self, _request: TransportRequest) -> TransportResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TransportResponse::error("no scripted response"))
    }

    fn websocket(&self, _request: TransportRequest) -> BoxStream<'static, TransportResponse> {
        let events: Vec<TransportResponse> = self.events.lock().unwrap().drain(..).collect();
        tokio_stream::iter(events).boxed()
    }
}

pub fn cache() -> GraphCache {
    GraphCache::new(CacheOptions::default())
}

pub fn cache_with(transport: Arc<MockTransport>) -> GraphCache {
    GraphCache::new(CacheOptions {
        transport: Some(transport),
        ..Default::default()
    })
}

pub fn vars(value: Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
}

/// The canonical test document: an infinite connection over posts.
pub const POSTS_QUERY: &str = r#"
    query Posts($first: Int, $after: String, $last: Int, $before: String) {
        posts(first: $first, after: $after, last: $last, before: $before)
            @connection(key: "posts") {
            edges {
                cursor
                node {
                    __typename
                    id
                    title
                }
            }
            pageInfo {
                startCursor
                endCursor
                hasNextPage
                hasPreviousPage
            }
        }
    }
"#;

pub struct PageSpec<'a> {
    pub ids: &'a [&'a str],
    pub has_next: bool,
    pub has_previous: bool,
}

/// Builds a `posts` payload where each node `n` gets cursor `pn`.
pub fn posts_page(spec: PageSpec<'_>) -> Value {
    let edges: Vec<Value> = spec
        .ids
        .iter()
        .map(|id| {
            json!({
                "cursor": format!("p{id}"),
                "node": {
                    "__typename": "Post",
                    "id": id,
                    "title": format!("Post {id}"),
                },
            })
        })
        .collect();
    json!({
        "posts": {
            "edges": edges,
            "pageInfo": {
                "startCursor": spec.ids.first().map(|id| format!("p{id}")),
                "endCursor": spec.ids.last().map(|id| format!("p{id}")),
                "hasNextPage": spec.has_next,
                "hasPreviousPage": spec.has_previous,
            },
        },
    })
}

/// The node ids visible through a read result's `posts.edges`.
pub fn edge_ids(result: &Value) -> Vec<String> {
    result["posts"]["edges"]
        .as_array()
        .map(|edges| {
            edges
                .iter()
                .map(|edge| edge["node"]["id"].as_str().unwrap_or_default().to_owned())
                .collect()
        })
        .unwrap_or_default()
}

pub fn page_info(result: &Value) -> &Value {
    &result["posts"]["pageInfo"]
}
