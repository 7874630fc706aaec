//! Rule-gated candidate selection feeding an end-to-end extraction job run,
//! exercised against a real SQLite store with a fixed inference client.

use panoptikon_engine::extraction::{run_extraction_job, CandidateInput, InputMaterializer};
use panoptikon_engine::inference::{MetadataMap, PredictInput, PredictOutput};
use panoptikon_engine::jobs::CancellationToken;
use panoptikon_engine::registry::ExtractorDescriptor;
use panoptikon_engine::rules::{add_rule, compute_candidates, Filter, RuleItemFilters};
use panoptikon_engine::store::StoreHandle;
use panoptikon_engine::{EngineResult, config::EngineConfigBuilder};
use async_trait::async_trait;
use rusqlite::params;
use tempfile::TempDir;

fn open_store() -> (TempDir, StoreHandle) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfigBuilder::new().data_folder(dir.path()).build().unwrap();
    let store = StoreHandle::open_write_lock(&config, true).unwrap();
    (dir, store)
}

fn insert_item(store: &StoreHandle, sha256: &str, mime: &str, path: &str) -> i64 {
    store
        .connection()
        .execute(
            "INSERT INTO index.items (sha256, md5, mime_type, size, time_added) VALUES (?1, ?2, ?3, 10, 1700000000)",
            params![sha256, format!("md5-{sha256}"), mime],
        )
        .unwrap();
    let item_id = store.connection().last_insert_rowid();
    store
        .connection()
        .execute(
            "INSERT INTO index.files (item_id, path, filename, last_modified) VALUES (?1, ?2, ?3, 1700000000)",
            params![item_id, path, path.rsplit('/').next().unwrap()],
        )
        .unwrap();
    item_id
}

#[test]
fn unbound_setter_yields_no_candidates() {
    let (_dir, store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png");
    let candidates = compute_candidates(&store, "tags", "wd-tagger/v3").unwrap();
    assert!(candidates.is_empty());
}

#[test]
fn bound_rule_gates_candidates_by_mime() {
    let (_dir, store) = open_store();
    let png = insert_item(&store, &"1".repeat(64), "image/png", "/a.png");
    let _txt = insert_item(&store, &"2".repeat(64), "text/plain", "/b.txt");

    let filters = RuleItemFilters {
        positive: vec![Filter::mime(vec!["image/".into()]).unwrap()],
        negative: vec![],
    };
    add_rule(&store, &[("tags".into(), "wd-tagger/v3".into())], &filters).unwrap();

    let candidates = compute_candidates(&store, "tags", "wd-tagger/v3").unwrap();
    assert_eq!(candidates, vec![png]);
}

#[test]
fn negative_filter_excludes_already_processed_items() {
    let (_dir, store) = open_store();
    let a = insert_item(&store, &"1".repeat(64), "image/png", "/a.png");
    let b = insert_item(&store, &"2".repeat(64), "image/png", "/b.png");

    let setter_id = {
        store
            .connection()
            .execute(
                "INSERT INTO index.setters (setter_type, name) VALUES ('tags', 'wd-tagger/v3')",
                [],
            )
            .unwrap();
        store.connection().last_insert_rowid()
    };
    store
        .connection()
        .execute(
            "INSERT INTO index.item_data (item_id, setter_id, data_type, data_index, job_id) \
             VALUES (?1, ?2, 'tags', 0, 1)",
            params![a, setter_id],
        )
        .unwrap();

    let filters = RuleItemFilters {
        positive: vec![Filter::mime(vec!["image/".into()]).unwrap()],
        negative: vec![Filter::ProcessedItems {
            setter_name: "wd-tagger/v3".into(),
        }],
    };
    add_rule(&store, &[("tags".into(), "wd-tagger/v3".into())], &filters).unwrap();

    let candidates = compute_candidates(&store, "tags", "wd-tagger/v3").unwrap();
    assert_eq!(candidates, vec![b]);
}

#[test]
fn multiple_bound_rules_union_their_candidates() {
    let (_dir, store) = open_store();
    let png = insert_item(&store, &"1".repeat(64), "image/png", "/photos/a.png");
    let pdf = insert_item(&store, &"2".repeat(64), "application/pdf", "/docs/b.pdf");
    insert_item(&store, &"3".repeat(64), "text/plain", "/c.txt");

    add_rule(
        &store,
        &[("text".into(), "ocr/v1".into())],
        &RuleItemFilters {
            positive: vec![Filter::mime(vec!["image/".into()]).unwrap()],
            negative: vec![],
        },
    )
    .unwrap();
    add_rule(
        &store,
        &[("text".into(), "ocr/v1".into())],
        &RuleItemFilters {
            positive: vec![Filter::mime(vec!["application/".into()]).unwrap()],
            negative: vec![],
        },
    )
    .unwrap();

    let mut candidates = compute_candidates(&store, "text", "ocr/v1").unwrap();
    candidates.sort();
    let mut expected = vec![png, pdf];
    expected.sort();
    assert_eq!(candidates, expected);
}

struct FakeMaterializer;
impl InputMaterializer for FakeMaterializer {
    fn materialize(&self, _store: &StoreHandle, item_id: i64) -> EngineResult<CandidateInput> {
        Ok(CandidateInput {
            item_id,
            path: format!("/items/{item_id}"),
            input: PredictInput::Bytes(vec![1, 2, 3, 4]),
        })
    }
}

/// An inference client that returns one fixed tag-sample payload per input,
/// so the write path can be exercised without a model-serving collaborator.
struct TaggingClient;

#[async_trait]
impl panoptikon_engine::inference::InferenceClient for TaggingClient {
    async fn get_metadata(&self) -> anyhow::Result<MetadataMap> {
        Ok(MetadataMap::new())
    }
    async fn load_model(&self, _: &str, _: &str, _: u32, _: u64) -> anyhow::Result<()> {
        Ok(())
    }
    async fn unload_model(&self, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn predict(
        &self,
        _setter_name: &str,
        _cache_key: &str,
        _lru_size: u32,
        _ttl_seconds: u64,
        inputs: Vec<PredictInput>,
    ) -> anyhow::Result<Vec<PredictOutput>> {
        Ok(inputs
            .iter()
            .map(|_| {
                PredictOutput::Structured(serde_json::json!([
                    {"general:cat": 0.95, "general:animal": 0.4, "rating:general": 0.2, "rating:explicit": 0.6}
                ]))
            })
            .collect())
    }
}

fn descriptor(group: &str, inference_id: &str, data_type: &str, batch_size: u32) -> ExtractorDescriptor {
    ExtractorDescriptor {
        group_name: group.into(),
        inference_id: inference_id.into(),
        name: group.into(),
        description: "test extractor".into(),
        data_type: data_type.into(),
        target_entities: vec!["items".into()],
        supported_mime_prefixes: Some(vec!["image/".into()]),
        default_batch_size: batch_size,
        default_threshold: None,
        input_spec_handler: "image_file".into(),
        input_spec_opts: serde_json::json!({}),
    }
}

#[tokio::test]
async fn extraction_job_tags_only_rule_gated_candidates() {
    let (_dir, mut store) = open_store();
    let tagged = insert_item(&store, &"1".repeat(64), "image/png", "/photos/a.png");
    let _untouched = insert_item(&store, &"2".repeat(64), "text/plain", "/b.txt");

    add_rule(
        &store,
        &[("tags".into(), "wd-tagger/v3".into())],
        &RuleItemFilters {
            positive: vec![Filter::mime(vec!["image/".into()]).unwrap()],
            negative: vec![],
        },
    )
    .unwrap();

    let client = TaggingClient;
    let materializer = FakeMaterializer;
    let rating_order = vec![
        "general".to_string(),
        "sensitive".to_string(),
        "questionable".to_string(),
        "explicit".to_string(),
    ];

    let job_id = run_extraction_job(
        &mut store,
        &descriptor("wd-tagger", "v3", "tags", 8),
        &client,
        &materializer,
        &rating_order,
        &CancellationToken::new(),
        |_ev| {},
    )
    .await
    .unwrap();

    let (total, processed, failed, status): (i64, i64, i64, String) = store
        .connection()
        .query_row(
            "SELECT total_items, processed_items, failed_items, status FROM index.job_log WHERE id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(processed, 1);
    assert_eq!(failed, 0);
    assert_eq!(status, "completed");

    // The mcut-weighted "rating" namespace collapses to its single
    // highest-severity tag ("explicit"), and "cat" is well above any
    // plausible general-namespace mcut threshold.
    let tag_names: Vec<String> = {
        let mut stmt = store
            .connection()
            .prepare(
                "SELECT t.name FROM index.tags_items ti JOIN index.tags t ON t.id = ti.tag_id \
                 WHERE ti.item_id = ?1 ORDER BY t.name",
            )
            .unwrap();
        stmt.query_map(params![tagged], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    };
    assert!(tag_names.contains(&"cat".to_string()));
    assert!(tag_names.contains(&"explicit".to_string()));
    assert!(!tag_names.contains(&"general".to_string()));
}

#[tokio::test]
async fn extraction_job_is_a_no_op_when_no_rule_is_bound() {
    let (_dir, mut store) = open_store();
    insert_item(&store, &"1".repeat(64), "image/png", "/a.png");

    let client = TaggingClient;
    let materializer = FakeMaterializer;

    let job_id = run_extraction_job(
        &mut store,
        &descriptor("wd-tagger", "v3", "tags", 8),
        &client,
        &materializer,
        &[],
        &CancellationToken::new(),
        |_ev| {},
    )
    .await
    .unwrap();

    let total: i64 = store
        .connection()
        .query_row(
            "SELECT total_items FROM index.job_log WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(total, 0);
}
