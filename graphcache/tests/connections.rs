//! Canonical connection behavior: splice-at-cursor merging, leader resets,
//! filter isolation, page mode, and extra-field preservation.

use graphcache::CacheOptions;
use graphcache::ConnectionMode;
use graphcache::ConnectionSpec;
use graphcache::GraphCache;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::common::cache;
use crate::common::edge_ids;
use crate::common::page_info;
use crate::common::posts_page;
use crate::common::vars;
use crate::common::PageSpec;
use crate::common::POSTS_QUERY;

fn read_posts(cache: &GraphCache) -> serde_json::Value {
    cache
        .read_query(POSTS_QUERY, vars(json!({ "first": 3, "after": null })))
        .expect("plan compiles")
        .expect("connection present")
}

#[test]
fn leader_then_forward_appends_in_order() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["1", "2", "3"],
                has_next: true,
                has_previous: false,
            }),
        )
        .unwrap();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": "p3" })),
            posts_page(PageSpec {
                ids: &["4", "5", "6"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "2", "3", "4", "5", "6"]);
    assert_eq!(
        page_info(&result),
        &json!({
            "startCursor": "p1",
            "endCursor": "p6",
            "hasNextPage": false,
            "hasPreviousPage": false,
        })
    );

    // The canonical record holds one ref per spliced edge.
    let canonical = cache.record("@connection.posts({})").unwrap();
    assert_eq!(canonical["edges"]["__refs"].as_array().unwrap().len(), 6);
}

#[test]
fn leader_refetch_resets_canonical() {
    let cache = cache();
    for (ids, after, has_next) in [
        (vec!["1", "2", "3"], None, true),
        (vec!["4", "5", "6"], Some("p3"), false),
    ] {
        cache
            .write_query(
                POSTS_QUERY,
                vars(json!({ "first": 3, "after": after })),
                posts_page(PageSpec {
                    ids: &ids,
                    has_next,
                    has_previous: false,
                }),
            )
            .unwrap();
    }

    // A fresh leader fetch anchors the connection again.
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["1", "2", "3"],
                has_next: true,
                has_previous: false,
            }),
        )
        .unwrap();

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "2", "3"]);
    assert_eq!(page_info(&result)["endCursor"], "p3");
    assert_eq!(page_info(&result)["hasNextPage"], true);
}

#[test]
fn backward_write_prepends_before_anchor() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["4", "5", "6"],
                has_next: false,
                has_previous: true,
            }),
        )
        .unwrap();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "last": 3, "before": "p4" })),
            posts_page(PageSpec {
                ids: &["1", "2", "3"],
                has_next: true,
                has_previous: false,
            }),
        )
        .unwrap();

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "2", "3", "4", "5", "6"]);
    assert_eq!(page_info(&result)["startCursor"], "p1");
    assert_eq!(page_info(&result)["hasPreviousPage"], false);
}

#[test]
fn middle_refetch_discards_unreachable_pages() {
    let cache = cache();
    let pages: [(&[&str], Option<&str>, bool); 4] = [
        (&["1", "2", "3"], None, true),
        (&["4", "5", "6"], Some("p3"), true),
        (&["7", "8", "9"], Some("p6"), false),
        // Refetching the middle page makes everything past it unreachable.
        (&["4", "5", "6"], Some("p3"), true),
    ];
    for (ids, after, has_next) in pages {
        cache
            .write_query(
                POSTS_QUERY,
                vars(json!({ "first": 3, "after": after })),
                posts_page(PageSpec {
                    ids,
                    has_next,
                    has_previous: false,
                }),
            )
            .unwrap();
    }

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "2", "3", "4", "5", "6"]);
    assert_eq!(page_info(&result)["endCursor"], "p6");
    assert_eq!(page_info(&result)["hasNextPage"], true);
}

#[test]
fn unknown_forward_cursor_appends_at_end() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 2, "after": null })),
            posts_page(PageSpec {
                ids: &["1", "2"],
                has_next: true,
                has_previous: false,
            }),
        )
        .unwrap();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 2, "after": "missing" })),
            posts_page(PageSpec {
                ids: &["8", "9"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "2", "8", "9"]);
}

const USERS_QUERY: &str = r#"
    query Users($role: String, $first: Int, $after: String) {
        users(role: $role, first: $first, after: $after)
            @connection(key: "users", filters: ["role"]) {
            edges {
                cursor
                node {
                    __typename
                    id
                }
            }
            pageInfo {
                endCursor
                hasNextPage
            }
        }
    }
"#;

fn users_page(ids: &[&str]) -> serde_json::Value {
    let edges: Vec<serde_json::Value> = ids
        .iter()
        .map(|id| {
            json!({
                "cursor": format!("u{id}"),
                "node": { "__typename": "User", "id": id },
            })
        })
        .collect();
    json!({
        "users": {
            "edges": edges,
            "pageInfo": { "endCursor": ids.last().map(|id| format!("u{id}")), "hasNextPage": false },
        },
    })
}

#[test]
fn filters_isolate_canonical_connections() {
    let cache = cache();
    cache
        .write_query(
            USERS_QUERY,
            vars(json!({ "role": "admin", "first": 2 })),
            users_page(&["1", "2"]),
        )
        .unwrap();
    cache
        .write_query(
            USERS_QUERY,
            vars(json!({ "role": "user", "first": 2 })),
            users_page(&["3", "4"]),
        )
        .unwrap();

    let admins = cache
        .record(r#"@connection.users({"role":"admin"})"#)
        .unwrap();
    let users = cache
        .record(r#"@connection.users({"role":"user"})"#)
        .unwrap();
    assert_eq!(admins["edges"]["__refs"].as_array().unwrap().len(), 2);
    assert_eq!(users["edges"]["__refs"].as_array().unwrap().len(), 2);

    let admin_read = cache
        .read_query(USERS_QUERY, vars(json!({ "role": "admin", "first": 2 })))
        .unwrap()
        .unwrap();
    let ids: Vec<&str> = admin_read["users"]["edges"]
        .as_array()
        .unwrap()
        .iter()
        .map(|edge| edge["node"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["1", "2"]);
}

const ITEMS_QUERY: &str = r#"
    query Items($page: Int) {
        items(page: $page) {
            edges {
                cursor
                node {
                    __typename
                    id
                }
            }
            pageInfo {
                endCursor
                hasNextPage
            }
        }
    }
"#;

#[test]
fn page_mode_replaces_history() {
    let mut connections = indexmap::IndexMap::new();
    let mut fields = indexmap::IndexMap::new();
    fields.insert(
        "items".to_owned(),
        ConnectionSpec {
            mode: ConnectionMode::Page,
            filters: vec![],
        },
    );
    connections.insert("Query".to_owned(), fields);
    // `page` is a paging window here, not part of the connection identity.
    let window_args = ["first", "last", "after", "before", "page"]
        .into_iter()
        .map(str::to_owned)
        .collect();
    let cache = GraphCache::new(CacheOptions {
        connections,
        window_args: Some(window_args),
        ..Default::default()
    });

    for (page, ids) in [(1, ["1", "2"]), (2, ["3", "4"])] {
        let edges: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "cursor": format!("i{id}"),
                    "node": { "__typename": "Item", "id": id },
                })
            })
            .collect();
        cache
            .write_query(
                ITEMS_QUERY,
                vars(json!({ "page": page })),
                json!({
                    "items": {
                        "edges": edges,
                        "pageInfo": { "endCursor": format!("i{}", ids[1]), "hasNextPage": page == 1 },
                    },
                }),
            )
            .unwrap();
    }

    // Page mode keeps no history: only the latest fetch is visible, under
    // either window's variables.
    let result = cache
        .read_query(ITEMS_QUERY, vars(json!({ "page": 2 })))
        .unwrap()
        .unwrap();
    let ids: Vec<&str> = result["items"]["edges"]
        .as_array()
        .unwrap()
        .iter()
        .map(|edge| edge["node"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["3", "4"]);
}

const STATS_QUERY: &str = r#"
    query Posts($first: Int, $after: String) {
        posts(first: $first, after: $after) @connection(key: "posts") {
            totalCount
            edges {
                cursor
                node {
                    __typename
                    id
                }
            }
            pageInfo {
                endCursor
                hasNextPage
            }
        }
    }
"#;

#[test]
fn extra_connection_fields_survive_pagination() {
    let cache = cache();
    let page = |ids: &[&str], total: i64| {
        let edges: Vec<serde_json::Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "cursor": format!("p{id}"),
                    "node": { "__typename": "Post", "id": id },
                })
            })
            .collect();
        json!({
            "posts": {
                "totalCount": total,
                "edges": edges,
                "pageInfo": { "endCursor": format!("p{}", ids.last().unwrap()), "hasNextPage": true },
            },
        })
    };

    cache
        .write_query(
            STATS_QUERY,
            vars(json!({ "first": 2, "after": null })),
            page(&["1", "2"], 10),
        )
        .unwrap();

    // The follow-up page omits totalCount entirely.
    let edges: Vec<serde_json::Value> = ["3", "4"]
        .iter()
        .map(|id| {
            json!({
                "cursor": format!("p{id}"),
                "node": { "__typename": "Post", "id": id },
            })
        })
        .collect();
    cache
        .write_query(
            STATS_QUERY,
            vars(json!({ "first": 2, "after": "p2" })),
            json!({
                "posts": {
                    "edges": edges,
                    "pageInfo": { "endCursor": "p4", "hasNextPage": false },
                },
            }),
        )
        .unwrap();

    let canonical = cache.record("@connection.posts({})").unwrap();
    assert_eq!(canonical["totalCount"], 10);

    // A later page carrying a new value overwrites it.
    cache
        .write_query(
            STATS_QUERY,
            vars(json!({ "first": 2, "after": "p4" })),
            page(&["5", "6"], 12),
        )
        .unwrap();
    let canonical = cache.record("@connection.posts({})").unwrap();
    assert_eq!(canonical["totalCount"], 12);
}

#[test]
fn duplicate_cursors_anchor_on_first_occurrence() {
    let cache = cache();
    // Two edges share the cursor "dup"; the splice must anchor on the first.
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            json!({
                "posts": {
                    "edges": [
                        { "cursor": "dup", "node": { "__typename": "Post", "id": "1" } },
                        { "cursor": "mid", "node": { "__typename": "Post", "id": "2" } },
                        { "cursor": "dup", "node": { "__typename": "Post", "id": "3" } },
                    ],
                    "pageInfo": {
                        "startCursor": "dup",
                        "endCursor": "dup",
                        "hasNextPage": true,
                        "hasPreviousPage": false,
                    },
                },
            }),
        )
        .unwrap();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": "dup" })),
            posts_page(PageSpec {
                ids: &["9"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    let result = read_posts(&cache);
    assert_eq!(edge_ids(&result), ["1", "9"]);
}

#[test]
fn prewarm_rebuilds_canonical_from_concrete_pages() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["1", "2", "3"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    // Lose the canonical view but keep the concrete page.
    cache.evict("@connection.posts({})");
    cache.evict("@connection.posts({})::meta");
    assert_eq!(
        cache.read_query(POSTS_QUERY, vars(json!({ "first": 3, "after": null }))).unwrap().map(|r| edge_ids(&r)),
        Some(vec!["1".to_owned(), "2".to_owned(), "3".to_owned()]),
        "concrete page still serves the read"
    );

    cache
        .prewarm(POSTS_QUERY, vars(json!({ "first": 3, "after": null })))
        .unwrap();
    let canonical = cache.record("@connection.posts({})").unwrap();
    assert_eq!(canonical["edges"]["__refs"].as_array().unwrap().len(), 3);
}

#[test]
fn meta_tracks_pages_and_hints() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["1", "2", "3"],
                has_next: true,
                has_previous: false,
            }),
        )
        .unwrap();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": "p3" })),
            posts_page(PageSpec {
                ids: &["4", "5", "6"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    let meta = cache.record("@connection.posts({})::meta").unwrap();
    let pages = meta["pages"]["__refs"].as_array().unwrap();
    assert_eq!(pages.len(), 2);
    assert_eq!(
        meta["leader"]["__ref"],
        json!(r#"@.posts({"after":null,"first":3})"#)
    );
    assert_eq!(
        meta["hints"][r#"@.posts({"after":"p3","first":3})"#],
        "after"
    );
    assert_eq!(
        meta["origin"][r#"@.posts({"after":null,"first":3})"#],
        "network"
    );
}
