//! Tests for key construction and matching.

use std::collections::BTreeMap;

use query_cache::{
    matches_key, matches_where, query_key, FetchContext, KeySegment, Query, QueryError, QueryKey,
};

fn noop_query(key: QueryKey) -> std::sync::Arc<Query<()>> {
    Query::new(key, |_ctx: FetchContext| async { Ok::<_, QueryError>(()) })
}

// =============================================================================
// Key Construction
// =============================================================================

#[test]
fn test_macro_and_constructors_agree() {
    let from_macro = query_key!["users", 1, true];
    let from_vec = QueryKey::new(vec![
        KeySegment::from("users"),
        KeySegment::from(1),
        KeySegment::from(true),
    ]);
    let from_child = QueryKey::from(["users"]).child(1).child(true);

    assert_eq!(from_macro, from_vec);
    assert_eq!(from_macro, from_child);
    assert_eq!(from_macro.len(), 3);
}

#[test]
fn test_structured_segments() {
    let filters: BTreeMap<String, KeySegment> = [
        ("status".to_string(), KeySegment::from("open")),
        ("page".to_string(), KeySegment::from(2)),
    ]
    .into_iter()
    .collect();
    let key = query_key!["todos", KeySegment::Map(filters.clone())];

    let same: KeySegment = [("page", KeySegment::from(2)), ("status", "open".into())]
        .into_iter()
        .collect();
    assert_eq!(key, query_key!["todos", same]);

    let other_page: KeySegment = [("page", KeySegment::from(3)), ("status", "open".into())]
        .into_iter()
        .collect();
    assert_ne!(key, query_key!["todos", other_page]);
}

#[test]
fn test_optional_segments() {
    assert_eq!(KeySegment::from(None::<i64>), KeySegment::Null);
    assert_eq!(KeySegment::from(Some(3)), KeySegment::Int(3));
    assert_ne!(query_key!["a", None::<i64>], query_key!["a"]);
}

// =============================================================================
// Matching
// =============================================================================

#[test]
fn test_prefix_matching_is_segment_wise() {
    let key = query_key!["users", 1, "posts"];

    assert!(matches_key(&key, &query_key![], false));
    assert!(matches_key(&key, &query_key!["users"], false));
    assert!(matches_key(&key, &query_key!["users", 1], false));
    assert!(matches_key(&key, &query_key!["users", 1, "posts"], false));

    assert!(!matches_key(&key, &query_key!["user"], false));
    assert!(!matches_key(&key, &query_key!["users", "1"], false));
    assert!(!matches_key(&key, &query_key!["users", 1, "posts", 5], false));
}

#[test]
fn test_exact_matching_requires_equal_length() {
    let key = query_key!["users", 1];

    assert!(matches_key(&key, &query_key!["users", 1], true));
    assert!(!matches_key(&key, &query_key!["users"], true));
    assert!(!matches_key(&key, &query_key![], true));
}

#[test]
fn test_predicate_sees_the_query() {
    let query = noop_query(query_key!["users", 7]);

    assert!(matches_where(query.as_ref(), |q| q.key().len() == 2));
    assert!(query.matches_where(|q| q.key().starts_with(&query_key!["users"])));
    assert!(!query.matches_where(|q| q.invocation_count() > 0));
}

#[test]
fn test_query_matches_delegates_to_key() {
    let query = noop_query(query_key!["users", 7]);

    assert!(query.matches(&query_key!["users"], false));
    assert!(!query.matches(&query_key!["users"], true));
    assert!(query.matches(&query_key!["users", 7], true));
}

#[test]
fn test_matching_is_deterministic_over_many_keys() {
    let keys: Vec<QueryKey> = (0..20)
        .map(|i| query_key!["group", i % 4, i])
        .collect();
    let filter = query_key!["group", 2];

    let matched: Vec<_> = keys
        .iter()
        .filter(|key| matches_key(key, &filter, false))
        .collect();
    assert_eq!(matched.len(), 5);
    for key in matched {
        assert_eq!(key.segments()[1], KeySegment::Int(2));
        assert_eq!(
            matches_key(key, &filter, false),
            key.starts_with(&filter)
        );
    }
}
