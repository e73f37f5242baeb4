//! Fetch two pages of a connection through the cache and read the merged
//! canonical view back without touching the network again.
//!
//! Run with: cargo run --example pagination

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use graphcache::CacheOptions;
use graphcache::CachePolicy;
use graphcache::GraphCache;
use graphcache::QueryRequest;
use graphcache::Transport;
use graphcache::TransportRequest;
use graphcache::TransportResponse;
use serde_json::json;
use serde_json::Value;

const POSTS: &str = r#"
    query Posts($first: Int, $after: String) {
        posts(first: $first, after: $after) @connection(key: "posts") {
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

/// Serves scripted pages, standing in for a GraphQL server.
struct ScriptedServer {
    pages: Mutex<VecDeque<Value>>,
}

#[async_trait]
impl Transport for ScriptedServer {
    async fn http(&self, _request: TransportRequest) -> TransportResponse {
        match self.pages.lock().unwrap().pop_front() {
            Some(page) => TransportResponse::data(page),
            None => TransportResponse::error("no more pages"),
        }
    }

    fn websocket(&self, _request: TransportRequest) -> BoxStream<'static, TransportResponse> {
        futures::stream::empty().boxed()
    }
}

fn page(ids: &[&str], has_next: bool) -> Value {
    let edges: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "cursor": format!("cursor:{id}"),
                "node": { "__typename": "Post", "id": id, "title": format!("Post {id}") },
            })
        })
        .collect();
    json!({
        "posts": {
            "edges": edges,
            "pageInfo": {
                "startCursor": format!("cursor:{}", ids[0]),
                "endCursor": format!("cursor:{}", ids[ids.len() - 1]),
                "hasNextPage": has_next,
                "hasPreviousPage": false,
            },
        },
    })
}

fn vars(value: Value) -> graphcache::Variables {
    value.as_object().cloned().unwrap()
}

#[tokio::main]
async fn main() -> Result<(), graphcache::CacheError> {
    let server = Arc::new(ScriptedServer {
        pages: Mutex::new(VecDeque::from([
            page(&["1", "2"], true),
            page(&["3", "4"], false),
        ])),
    });
    let cache = GraphCache::new(CacheOptions {
        transport: Some(server),
        ..Default::default()
    });

    // The leader page, then a forward page after its end cursor. Paging
    // fetches go network-only: the canonical view would otherwise satisfy
    // any window from the cache.
    cache
        .execute_query(
            QueryRequest::new(POSTS)
                .variables(vars(json!({ "first": 2, "after": null })))
                .policy(CachePolicy::NetworkOnly),
        )
        .await?;
    cache
        .execute_query(
            QueryRequest::new(POSTS)
                .variables(vars(json!({ "first": 2, "after": "cursor:2" })))
                .policy(CachePolicy::NetworkOnly),
        )
        .await?;

    // The canonical connection now answers without the transport.
    let merged = cache
        .execute_query(
            QueryRequest::new(POSTS)
                .variables(vars(json!({ "first": 2, "after": null })))
                .policy(CachePolicy::CacheOnly),
        )
        .await?;

    for edge in merged.data["posts"]["edges"].as_array().unwrap() {
        println!(
            "{} ({})",
            edge["node"]["title"].as_str().unwrap(),
            edge["cursor"].as_str().unwrap()
        );
    }
    println!(
        "hasNextPage: {}",
        merged.data["posts"]["pageInfo"]["hasNextPage"]
    );
    Ok(())
}
