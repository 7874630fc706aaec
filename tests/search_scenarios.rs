//! End-to-end search scenarios against a real SQLite store: build items/files/
//! tags/text/embeddings by hand, compile a [`SearchQuery`], and check the
//! rows and counts the facade returns.

use panoptikon_engine::config::EngineConfigBuilder;
use panoptikon_engine::pql::{FilterTree, LeafFilter, MatchOp, MatchOps, OrderArgs, OrderDirection, ScalarValue};
use panoptikon_engine::pql::{
    BookmarkFilter, DistanceAggregation, DistanceFunction, SearchQuery, SimilarTo, TagMatchFilter,
};
use panoptikon_engine::search;
use panoptikon_engine::store::StoreHandle;
use rusqlite::params;
use tempfile::TempDir;

fn open_store() -> (TempDir, StoreHandle) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfigBuilder::new().data_folder(dir.path()).build().unwrap();
    let store = StoreHandle::open_write_lock(&config, true).unwrap();
    (dir, store)
}

/// Insert an item + its single file manifestation, returning the item id.
fn insert_item(store: &StoreHandle, sha256: &str, mime: &str, path: &str, size: i64) -> i64 {
    store
        .connection()
        .execute(
            "INSERT INTO index.items (sha256, md5, mime_type, size, time_added) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sha256, format!("md5-{sha256}"), mime, size, 1_700_000_000i64],
        )
        .unwrap();
    let item_id = store.connection().last_insert_rowid();
    store
        .connection()
        .execute(
            "INSERT INTO index.files (item_id, path, filename, last_modified) VALUES (?1, ?2, ?3, ?4)",
            params![item_id, path, path.rsplit('/').next().unwrap(), 1_700_000_000i64],
        )
        .unwrap();
    item_id
}

fn insert_tag(store: &StoreHandle, item_id: i64, setter_id: i64, namespace: &str, name: &str, confidence: f64) {
    store
        .connection()
        .execute(
            "INSERT INTO index.tags (namespace, name) VALUES (?1, ?2) \
             ON CONFLICT(namespace, name) DO NOTHING",
            params![namespace, name],
        )
        .unwrap();
    let tag_id: i64 = store
        .connection()
        .query_row(
            "SELECT id FROM index.tags WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
            |row| row.get(0),
        )
        .unwrap();
    store
        .connection()
        .execute(
            "INSERT INTO index.tags_items (item_id, tag_id, setter_id, confidence) VALUES (?1, ?2, ?3, ?4)",
            params![item_id, tag_id, setter_id, confidence],
        )
        .unwrap();
}

fn ensure_setter(store: &StoreHandle, setter_type: &str, name: &str) -> i64 {
    store
        .connection()
        .execute(
            "INSERT INTO index.setters (setter_type, name) VALUES (?1, ?2) \
             ON CONFLICT(setter_type, name) DO NOTHING",
            params![setter_type, name],
        )
        .unwrap();
    store
        .connection()
        .query_row(
            "SELECT id FROM index.setters WHERE setter_type = ?1 AND name = ?2",
            params![setter_type, name],
            |row| row.get(0),
        )
        .unwrap()
}

fn insert_embedding(store: &StoreHandle, item_id: i64, setter_id: i64, data_type: &str, vec: &[f32]) {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for f in vec {
        bytes.extend_from_slice(&f.to_le_bytes());
    }
    store
        .connection()
        .execute(
            "INSERT INTO index.item_data (item_id, setter_id, data_type, data_index, job_id) \
             VALUES (?1, ?2, ?3, 0, 1)",
            params![item_id, setter_id, data_type],
        )
        .unwrap();
    let data_id = store.connection().last_insert_rowid();
    store
        .connection()
        .execute(
            "INSERT INTO index.embeddings (id, embedding) VALUES (?1, ?2)",
            params![data_id, bytes],
        )
        .unwrap();
}

fn query(tree: FilterTree) -> SearchQuery {
    SearchQuery {
        query: tree,
        order_args: vec![],
        count: false,
        page: 0,
        page_size: 50,
    }
}

#[test]
fn exact_tag_match_returns_only_tagged_items() {
    let (_dir, store) = open_store();
    let setter = ensure_setter(&store, "tags", "wd-tagger");
    let cat = insert_item(&store, &"a".repeat(64), "image/png", "/photos/cat.png", 100);
    let _dog = insert_item(&store, &"b".repeat(64), "image/png", "/photos/dog.png", 100);
    insert_tag(&store, cat, setter, "general", "cat", 0.9);

    let q = query(FilterTree::Leaf(LeafFilter::TagMatch {
        priority: 0,
        filter: TagMatchFilter {
            tags: vec!["cat".into()],
            namespace: None,
            setters: None,
            min_confidence: None,
            match_all: false,
        },
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].item_id, cat);
}

#[test]
fn mime_and_path_prefix_combine_with_and() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/photos/cat.png", 100);
    insert_item(&store, &"2".repeat(64), "image/png", "/docs/cat.png", 100);
    insert_item(&store, &"3".repeat(64), "text/plain", "/photos/notes.txt", 100);

    let q = query(FilterTree::And {
        children: vec![
            FilterTree::Leaf(LeafFilter::Path {
                priority: 0,
                prefixes: vec!["/photos/".into()],
            }),
            FilterTree::Leaf(LeafFilter::Mime {
                priority: 0,
                prefixes: vec!["image/".into()],
            }),
        ],
    });
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].path, "/photos/cat.png");
}

#[test]
fn minmax_range_filters_by_width() {
    let (_dir, store) = open_store();
    let small = insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    let big = insert_item(&store, &"2".repeat(64), "image/png", "/b.png", 10);
    store
        .connection()
        .execute("UPDATE index.items SET width = 200 WHERE id = ?1", params![small])
        .unwrap();
    store
        .connection()
        .execute("UPDATE index.items SET width = 4000 WHERE id = ?1", params![big])
        .unwrap();

    let q = query(FilterTree::Leaf(LeafFilter::MinMax {
        priority: 0,
        column: "width".into(),
        min: 100.0,
        max: 1000.0,
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].item_id, small);
}

#[test]
fn minmax_zero_upper_bound_is_unbounded_above() {
    let (_dir, store) = open_store();
    let small = insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    let big = insert_item(&store, &"2".repeat(64), "image/png", "/b.png", 10);
    store
        .connection()
        .execute("UPDATE index.items SET width = 50 WHERE id = ?1", params![small])
        .unwrap();
    store
        .connection()
        .execute("UPDATE index.items SET width = 4000 WHERE id = ?1", params![big])
        .unwrap();

    let q = query(FilterTree::Leaf(LeafFilter::MinMax {
        priority: 0,
        column: "width".into(),
        min: 100.0,
        max: 0.0,
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].item_id, big);
}

#[test]
fn match_values_supports_in_and_not_in() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    insert_item(&store, &"2".repeat(64), "image/jpeg", "/b.jpg", 10);
    insert_item(&store, &"3".repeat(64), "text/plain", "/c.txt", 10);

    let q = query(FilterTree::Leaf(LeafFilter::MatchValues {
        priority: 0,
        matches: MatchOps::In {
            column: "mime_type".into(),
            values: vec![
                ScalarValue::Text("image/png".into()),
                ScalarValue::Text("image/jpeg".into()),
            ],
        },
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 2);

    let q_not = query(FilterTree::Leaf(LeafFilter::MatchValues {
        priority: 0,
        matches: MatchOps::NotIn {
            column: "mime_type".into(),
            values: vec![ScalarValue::Text("text/plain".into())],
        },
    }));
    let results_not = search::search(&store, &q_not).unwrap();
    assert_eq!(results_not.count, 2);
}

#[test]
fn match_values_op_starts_with_uses_like() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    insert_item(&store, &"2".repeat(64), "application/pdf", "/b.pdf", 10);

    let q = query(FilterTree::Leaf(LeafFilter::MatchValues {
        priority: 0,
        matches: MatchOps::Op {
            column: "mime_type".into(),
            op: MatchOp::StartsWith,
            value: ScalarValue::Text("image/".into()),
        },
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
}

#[test]
fn not_excludes_matching_branch() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    insert_item(&store, &"2".repeat(64), "text/plain", "/b.txt", 10);

    let q = query(FilterTree::Not {
        child: Box::new(FilterTree::Leaf(LeafFilter::Mime {
            priority: 0,
            prefixes: vec!["image/".into()],
        })),
    });
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].mime_type, "text/plain");
}

#[test]
fn or_unions_two_branches_without_duplicates() {
    let (_dir, store) = open_store();
    let png = insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);
    let pdf = insert_item(&store, &"2".repeat(64), "application/pdf", "/b.pdf", 10);
    insert_item(&store, &"3".repeat(64), "text/plain", "/c.txt", 10);

    let q = query(FilterTree::Or {
        children: vec![
            FilterTree::Leaf(LeafFilter::Mime {
                priority: 0,
                prefixes: vec!["image/".into()],
            }),
            FilterTree::Leaf(LeafFilter::Mime {
                priority: 0,
                prefixes: vec!["application/".into()],
            }),
        ],
    });
    let results = search::search(&store, &q).unwrap();
    let mut ids: Vec<i64> = results.results.iter().map(|r| r.item_id).collect();
    ids.sort();
    let mut expected = vec![png, pdf];
    expected.sort();
    assert_eq!(ids, expected);
}

#[test]
fn similarity_orders_by_distance_ascending() {
    let (_dir, store) = open_store();
    let setter = ensure_setter(&store, "clip", "vit-b32");
    let target = insert_item(&store, &"t".repeat(64), "image/png", "/target.png", 10);
    let near = insert_item(&store, &"2".repeat(64), "image/png", "/near.png", 10);
    let far = insert_item(&store, &"3".repeat(64), "image/png", "/far.png", 10);

    insert_embedding(&store, target, setter, "clip", &[1.0, 0.0, 0.0]);
    insert_embedding(&store, near, setter, "clip", &[0.9, 0.1, 0.0]);
    insert_embedding(&store, far, setter, "clip", &[-1.0, 0.0, 0.0]);

    let q = query(FilterTree::Leaf(LeafFilter::SimilarTo {
        priority: 0,
        similar: SimilarTo {
            target_sha256: "t".repeat(64),
            setter_name: "clip/vit-b32".into(),
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            xmodal_t2t: false,
            ..Default::default()
        },
    }));
    let results = search::search(&store, &q).unwrap();
    let ids: Vec<i64> = results.results.iter().map(|r| r.item_id).collect();
    // The target item is excluded from its own similarity results; `near`
    // and `far` are returned in ascending distance order.
    assert_eq!(ids, vec![near, far]);
}

#[test]
fn bookmark_filter_narrows_to_bookmarked_items() {
    let (_dir, store) = open_store();
    let sha = "a".repeat(64);
    let bookmarked = insert_item(&store, &sha, "image/png", "/a.png", 10);
    insert_item(&store, &"b".repeat(64), "image/png", "/b.png", 10);
    store
        .connection()
        .execute(
            "INSERT INTO user_data.bookmarks (namespace, sha256, user, time_added) VALUES ('default', ?1, 'alice', 1)",
            params![sha],
        )
        .unwrap();

    let q = query(FilterTree::Leaf(LeafFilter::Bookmark {
        priority: 0,
        filter: BookmarkFilter {
            namespace: Some("default".into()),
            user: Some("alice".into()),
        },
    }));
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
    assert_eq!(results.results[0].item_id, bookmarked);
}

#[test]
fn explicit_order_args_override_default_time_added_order() {
    let (_dir, store) = open_store();
    let a = insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 500);
    let b = insert_item(&store, &"2".repeat(64), "image/png", "/b.png", 10);

    let mut q = query(FilterTree::Leaf(LeafFilter::Mime {
        priority: 0,
        prefixes: vec!["image/".into()],
    }));
    q.order_args = vec![OrderArgs {
        order_by: "i.size".into(),
        order: OrderDirection::Asc,
        priority: 10,
    }];
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.results.iter().map(|r| r.item_id).collect::<Vec<_>>(), vec![b, a]);
}

#[test]
fn pagination_page_size_limits_and_offsets_results() {
    let (_dir, store) = open_store();
    for i in 0..5 {
        insert_item(&store, &format!("{i}").repeat(64)[..64], "image/png", &format!("/p{i}.png"), 10);
    }
    let mut q = query(FilterTree::Leaf(LeafFilter::Mime {
        priority: 0,
        prefixes: vec!["image/".into()],
    }));
    q.page_size = 2;
    q.page = 1;
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 5);
    assert_eq!(results.results.len(), 2);
}

#[test]
fn invalid_leaf_is_pruned_and_behaves_as_identity() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png", 10);

    // Empty prefixes fail LeafFilter::validate(), so this And-branch is a no-op.
    let q = query(FilterTree::And {
        children: vec![FilterTree::Leaf(LeafFilter::Path {
            priority: 0,
            prefixes: vec![],
        })],
    });
    let results = search::search(&store, &q).unwrap();
    assert_eq!(results.count, 1);
}
