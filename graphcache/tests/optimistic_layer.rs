//! Optimistic overlays: connection edits, fragment overlays, replay on
//! base writes, and revert semantics.

use pretty_assertions::assert_eq;
use serde_json::json;

use graphcache::AddPosition;
use graphcache::ConnectionTarget;

use crate::common::cache;
use crate::common::edge_ids;
use crate::common::posts_page;
use crate::common::vars;
use crate::common::PageSpec;
use crate::common::POSTS_QUERY;

fn read_posts(cache: &graphcache::GraphCache) -> serde_json::Value {
    cache
        .read_query(POSTS_QUERY, vars(json!({ "first": 3, "after": null })))
        .unwrap()
        .unwrap()
}

#[test]
fn overlay_survives_base_write() {
    let cache = cache();

    // The transaction begins before any base data exists.
    let handle = cache.modify_optimistic(|txn| {
        let mut posts = txn.connection(ConnectionTarget::root("posts"));
        posts.remove_node(json!({ "__typename": "Post", "id": "2" }));
        posts.add_node(
            json!({ "__typename": "Post", "id": "9", "title": "Nine" }),
            AddPosition::Start,
        );
    });

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

    // Base [1, 2, 3] plus the overlay: remove 2, prepend 9.
    assert_eq!(edge_ids(&read_posts(&cache)), ["9", "1", "3"]);

    handle.revert();
    assert_eq!(edge_ids(&read_posts(&cache)), ["1", "2", "3"]);
}

#[test]
fn overlay_commutes_with_base_write() {
    // base-write then begin(tx) ...
    let first = cache();
    first
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
    let _keep = first.modify_optimistic(|txn| {
        txn.connection(ConnectionTarget::root("posts")).add_node(
            json!({ "__typename": "Post", "id": "9", "title": "Nine" }),
            AddPosition::End,
        );
    });

    // ... and begin(tx) then base-write produce the same view.
    let second = cache();
    let _keep2 = second.modify_optimistic(|txn| {
        txn.connection(ConnectionTarget::root("posts")).add_node(
            json!({ "__typename": "Post", "id": "9", "title": "Nine" }),
            AddPosition::End,
        );
    });
    second
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

    assert_eq!(edge_ids(&read_posts(&first)), edge_ids(&read_posts(&second)));
    assert_eq!(edge_ids(&read_posts(&first)), ["1", "2", "3", "9"]);
}

#[test]
fn cursor_positions_insert_relative_to_edges() {
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

    let _handle = cache.modify_optimistic(|txn| {
        let mut posts = txn.connection(ConnectionTarget::root("posts"));
        posts.add_node(
            json!({ "__typename": "Post", "id": "15", "title": "Mid" }),
            AddPosition::AfterCursor("p1".to_owned()),
        );
        posts.add_node(
            json!({ "__typename": "Post", "id": "05", "title": "Early" }),
            AddPosition::BeforeCursor("p1".to_owned()),
        );
    });

    assert_eq!(edge_ids(&read_posts(&cache)), ["05", "1", "15", "2", "3"]);
}

#[test]
fn write_fragment_overlays_without_touching_base() {
    let cache = cache();
    cache
        .write_query(
            "query { post { __typename id title } }",
            vars(json!({})),
            json!({ "post": { "__typename": "Post", "id": "1", "title": "Server" } }),
        )
        .unwrap();

    let handle = cache.modify_optimistic(|txn| {
        txn.write_fragment("Post:1", json!({ "title": "Optimistic" }));
    });

    let read = cache
        .read_query("query { post { title } }", vars(json!({})))
        .unwrap()
        .unwrap();
    assert_eq!(read["post"]["title"], "Optimistic");
    // The base snapshot is untouched.
    assert_eq!(cache.record("Post:1").unwrap()["title"], "Server");

    handle.revert();
    let read = cache
        .read_query("query { post { title } }", vars(json!({})))
        .unwrap()
        .unwrap();
    assert_eq!(read["post"]["title"], "Server");
}

#[test]
fn transactions_apply_in_commit_order() {
    let cache = cache();
    cache
        .write_query(
            POSTS_QUERY,
            vars(json!({ "first": 3, "after": null })),
            posts_page(PageSpec {
                ids: &["1"],
                has_next: false,
                has_previous: false,
            }),
        )
        .unwrap();

    let first = cache.modify_optimistic(|txn| {
        txn.connection(ConnectionTarget::root("posts")).add_node(
            json!({ "__typename": "Post", "id": "a", "title": "A" }),
            AddPosition::End,
        );
    });
    let _second = cache.modify_optimistic(|txn| {
        txn.connection(ConnectionTarget::root("posts")).add_node(
            json!({ "__typename": "Post", "id": "b", "title": "B" }),
            AddPosition::End,
        );
    });

    assert_eq!(edge_ids(&read_posts(&cache)), ["1", "a", "b"]);

    // Dropping the older transaction replays the newer one alone.
    first.revert();
    assert_eq!(edge_ids(&read_posts(&cache)), ["1", "b"]);
}
