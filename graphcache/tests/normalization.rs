//! Normalizer behavior: entity upserts, reference replacement, list
//! handling, idempotency, and operation-kind linking rules.

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::common::cache;
use crate::common::vars;

const FEED_QUERY: &str = r#"
    query Feed {
        feed {
            __typename
            id
            title
            author {
                __typename
                id
                name
            }
            tags
        }
    }
"#;

fn feed_payload() -> serde_json::Value {
    json!({
        "feed": [
            {
                "__typename": "Post",
                "id": "1",
                "title": "One",
                "author": { "__typename": "User", "id": "9", "name": "Ada" },
                "tags": ["a", "b"],
            },
            {
                "__typename": "Post",
                "id": "2",
                "title": "Two",
                "author": { "__typename": "User", "id": "9", "name": "Ada" },
                "tags": [],
            },
        ],
    })
}

#[test]
fn identifiable_lists_become_ref_lists() {
    let cache = cache();
    cache
        .write_query(FEED_QUERY, vars(json!({})), feed_payload())
        .unwrap();

    let root = cache.record("@").unwrap();
    assert_eq!(root["feed"], json!({ "__refs": ["Post:1", "Post:2"] }));

    // Scalar arrays stay positional.
    let post = cache.record("Post:1").unwrap();
    assert_eq!(post["tags"], json!(["a", "b"]));
    assert_eq!(post["author"], json!({ "__ref": "User:9" }));
}

#[test]
fn repeated_entities_merge_into_one_record() {
    let cache = cache();
    cache
        .write_query(FEED_QUERY, vars(json!({})), feed_payload())
        .unwrap();

    // Both posts reference the same author record.
    let user = cache.record("User:9").unwrap();
    assert_eq!(user["name"], "Ada");
    assert_eq!(
        cache
            .record_keys()
            .iter()
            .filter(|key| key.starts_with("User:"))
            .count(),
        1
    );
}

#[test]
fn writes_are_idempotent() {
    let cache = cache();
    cache
        .write_query(FEED_QUERY, vars(json!({})), feed_payload())
        .unwrap();
    let first = cache.dehydrate();

    cache
        .write_query(FEED_QUERY, vars(json!({})), feed_payload())
        .unwrap();
    let second = cache.dehydrate();

    assert_eq!(first, second);
}

#[test]
fn partial_updates_merge_over_existing_fields() {
    let cache = cache();
    cache
        .write_query(
            "query { viewer { __typename id name email } }",
            vars(json!({})),
            json!({
                "viewer": { "__typename": "User", "id": "1", "name": "Ada", "email": "a@x" },
            }),
        )
        .unwrap();
    cache
        .write_query(
            "query { viewer { __typename id name } }",
            vars(json!({})),
            json!({
                "viewer": { "__typename": "User", "id": "1", "name": "Grace" },
            }),
        )
        .unwrap();

    let user = cache.record("User:1").unwrap();
    assert_eq!(user["name"], "Grace");
    // Untouched fields survive the narrower write.
    assert_eq!(user["email"], "a@x");
}

#[test]
fn mutations_update_entities_but_not_the_root() {
    let cache = cache();
    cache
        .write_query(
            "query { post { __typename id title } }",
            vars(json!({})),
            json!({ "post": { "__typename": "Post", "id": "1", "title": "Old" } }),
        )
        .unwrap();

    cache
        .write_query(
            "mutation { updatePost { __typename id title } }",
            vars(json!({})),
            json!({ "updatePost": { "__typename": "Post", "id": "1", "title": "New" } }),
        )
        .unwrap();

    // The entity moved, the query root did not learn a new field.
    assert_eq!(cache.record("Post:1").unwrap()["title"], "New");
    let root = cache.record("@").unwrap();
    assert!(root.get("updatePost").is_none());
}

#[test]
fn aliased_fields_store_under_field_keys() {
    let cache = cache();
    cache
        .write_query(
            "query { renamed: viewer { __typename id name } }",
            vars(json!({})),
            json!({ "renamed": { "__typename": "User", "id": "1", "name": "Ada" } }),
        )
        .unwrap();

    // Stored under the field name, read back under the alias.
    let root = cache.record("@").unwrap();
    assert_eq!(root["viewer"], json!({ "__ref": "User:1" }));

    let read = cache
        .read_query("query { renamed: viewer { name } }", vars(json!({})))
        .unwrap()
        .unwrap();
    assert_eq!(read["renamed"]["name"], "Ada");
}

#[test]
fn null_values_and_missing_fields_differ() {
    let cache = cache();
    cache
        .write_query(
            "query { viewer { __typename id nickname } }",
            vars(json!({})),
            json!({ "viewer": { "__typename": "User", "id": "1", "nickname": null } }),
        )
        .unwrap();

    // A written null reads back as null.
    let read = cache
        .read_query("query { viewer { nickname } }", vars(json!({})))
        .unwrap()
        .unwrap();
    assert_eq!(read["viewer"]["nickname"], json!(null));

    // A field that was never written is a miss.
    assert_eq!(
        cache
            .read_query("query { viewer { nickname email } }", vars(json!({})))
            .unwrap(),
        None
    );
}

#[test]
fn write_fragment_patches_one_record() {
    let cache = cache();
    cache
        .write_query(
            "query { post { __typename id title } }",
            vars(json!({})),
            json!({ "post": { "__typename": "Post", "id": "1", "title": "Old" } }),
        )
        .unwrap();

    cache
        .write_fragment(
            "Post:1",
            "fragment Patch on Post { title }",
            None,
            json!({ "title": "Patched" }),
        )
        .unwrap();

    assert_eq!(cache.record("Post:1").unwrap()["title"], "Patched");
}
