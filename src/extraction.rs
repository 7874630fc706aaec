//! Extraction Job Runner (C5): runs a single extractor over its rule-gated
//! candidates in batches, dispatching by `data_type` and writing outputs
//! transactionally alongside JobLog bookkeeping.

use crate::error::{EngineError, EngineResult};
use crate::inference::{InferenceClient, PredictInput, PredictOutput};
use crate::jobs::CancellationToken;
use crate::mcut::{aggregate_tags, tag_text_rows, TagScore};
use crate::model::JobStatus;
use crate::registry::ExtractorDescriptor;
use crate::rules::compute_candidates;
use crate::store::StoreHandle;
use rusqlite::params;
use tracing::{info, instrument, warn};

/// Emitted once per batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub processed: usize,
    pub total: usize,
    pub last_item_path: Option<String>,
}

/// Per-item input materialized for a single predict() call.
pub struct CandidateInput {
    pub item_id: i64,
    pub path: String,
    pub input: PredictInput,
}

/// How to turn a candidate item id into the bytes/data the extractor's input
/// handler expects. In this crate the filesystem/thumbnail/derived-text
/// materialization is a named collaborator (C5's "materialize inputs via
/// input_spec.handler"); tests supply a stub.
pub trait InputMaterializer {
    fn materialize(&self, store: &StoreHandle, item_id: i64) -> EngineResult<CandidateInput>;
}

/// Run extractor `descriptor` end to end: open a JobLog, compute candidates,
/// batch through the inference client, write outputs, and finalize.
///
/// `cancellation` is checked between batches (the "cancellation preempts
/// in-flight batches"); a cancelled job stops after its current batch
/// finishes writing and is recorded with [`JobStatus::Cancelled`].
#[instrument(skip(store, client, materializer, rating_severity_order, cancellation))]
pub async fn run_extraction_job(
    store: &mut StoreHandle,
    descriptor: &ExtractorDescriptor,
    client: &dyn InferenceClient,
    materializer: &dyn InputMaterializer,
    rating_severity_order: &[String],
    cancellation: &CancellationToken,
    mut on_progress: impl FnMut(ProgressEvent),
) -> EngineResult<i64> {
    let setter_type = descriptor.data_type.clone();
    let setter_name = descriptor.setter_name();
    let setter_id = ensure_setter(store, &setter_type, &setter_name)?;

    let start_time = now();
    store
        .connection()
        .execute(
            "INSERT INTO index.job_log (setter_id, start_time, status) VALUES (?1, ?2, 'running')",
            params![setter_id, start_time],
        )
        .map_err(EngineError::Store)?;
    let job_id = store.connection().last_insert_rowid();

    let candidates = compute_candidates(store, &setter_type, &setter_name)?;
    let total = candidates.len();
    on_progress(ProgressEvent {
        processed: 0,
        total,
        last_item_path: None,
    });

    let mut processed_items = 0usize;
    let mut failed_items = 0usize;
    let mut cancelled = false;
    let batch_size = descriptor.default_batch_size.max(1) as usize;

    for batch in candidates.chunks(batch_size) {
        if cancellation.is_cancelled() {
            cancelled = true;
            break;
        }
        let mut inputs = Vec::with_capacity(batch.len());
        for &item_id in batch {
            match materializer.materialize(store, item_id) {
                Ok(input) => inputs.push(input),
                Err(e) => {
                    warn!(item_id, error = %e, "failed to materialize input");
                    failed_items += 1;
                }
            }
        }
        if inputs.is_empty() {
            continue;
        }

        let predict_inputs: Vec<PredictInput> =
            inputs.iter().map(|i| clone_input(&i.input)).collect();
        let outputs = match client
            .predict(&descriptor.setter_name(), "default", 1, 300, predict_inputs)
            .await
        {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(batch_len = inputs.len(), error = %e, "inference batch failed");
                failed_items += inputs.len();
                processed_items += inputs.len();
                on_progress(ProgressEvent {
                    processed: processed_items,
                    total,
                    last_item_path: inputs.last().map(|i| i.path.clone()),
                });
                continue;
            }
        };

        let last_path = inputs.last().map(|i| i.path.clone());
        let write_result = store.with_transaction(|tx| {
            write_batch_outputs(
                tx,
                job_id,
                setter_id,
                &descriptor.data_type,
                &inputs,
                &outputs,
                rating_severity_order,
            )
        });
        match write_result {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "failed to persist batch outputs");
                failed_items += inputs.len();
            }
        }

        processed_items += inputs.len();
        on_progress(ProgressEvent {
            processed: processed_items,
            total,
            last_item_path: last_path,
        });
    }

    let status = if cancelled {
        JobStatus::Cancelled
    } else if failed_items == 0 {
        JobStatus::Completed
    } else {
        JobStatus::CompletedWithErrors
    };
    store
        .connection()
        .execute(
            "UPDATE index.job_log SET end_time = ?1, total_items = ?2, processed_items = ?3, \
             failed_items = ?4, status = ?5 WHERE id = ?6",
            params![
                now(),
                total as i64,
                processed_items as i64,
                failed_items as i64,
                status_str(status),
                job_id
            ],
        )
        .map_err(EngineError::Store)?;

    info!(job_id, total, processed_items, failed_items, "extraction job finished");
    Ok(job_id)
}

fn clone_input(input: &PredictInput) -> PredictInput {
    match input {
        PredictInput::Data(v) => PredictInput::Data(v.clone()),
        PredictInput::Bytes(b) => PredictInput::Bytes(b.clone()),
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::CompletedWithErrors => "completed_with_errors",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn write_batch_outputs(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
    setter_id: i64,
    data_type: &str,
    inputs: &[CandidateInput],
    outputs: &[PredictOutput],
    rating_severity_order: &[String],
) -> EngineResult<()> {
    for (input, output) in inputs.iter().zip(outputs.iter()) {
        match data_type {
            "tags" => write_tags(tx, job_id, setter_id, input.item_id, output, rating_severity_order)?,
            "text" => write_text(tx, job_id, setter_id, input.item_id, output)?,
            "clip" | "text-embedding" => {
                write_embedding(tx, job_id, setter_id, input.item_id, data_type, output)?
            }
            other => {
                return Err(EngineError::validation(format!(
                    "unsupported data_type '{other}'"
                )))
            }
        }
    }
    Ok(())
}

fn insert_item_data(
    tx: &rusqlite::Transaction<'_>,
    item_id: i64,
    setter_id: i64,
    data_type: &str,
    source_id: Option<i64>,
    data_index: i64,
    job_id: i64,
) -> EngineResult<i64> {
    tx.execute(
        "INSERT INTO index.item_data (item_id, setter_id, data_type, source_id, data_index, job_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![item_id, setter_id, data_type, source_id, data_index, job_id],
    )
    .map_err(EngineError::Store)?;
    Ok(tx.last_insert_rowid())
}

fn write_tags(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
    setter_id: i64,
    item_id: i64,
    output: &PredictOutput,
    rating_severity_order: &[String],
) -> EngineResult<()> {
    let PredictOutput::Structured(value) = output else {
        return Err(EngineError::extraction_batch(
            "tags",
            "expected structured tag output",
        ));
    };
    let samples = parse_tag_samples(value)?;
    let aggregated = aggregate_tags(&samples, rating_severity_order);

    let data_id = insert_item_data(tx, item_id, setter_id, "tags", None, 0, job_id)?;
    for tags in aggregated.values() {
        for tag in tags {
            let tag_id = ensure_tag(tx, &tag.namespace, &tag.name)?;
            tx.execute(
                "INSERT OR REPLACE INTO index.tags_items (item_id, tag_id, setter_id, confidence) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![item_id, tag_id, setter_id, tag.confidence],
            )
            .map_err(EngineError::Store)?;
        }
    }

    let (full_text, thresholded_text) = tag_text_rows(&aggregated);
    write_text_row(tx, data_id, &full_text, None, None, None)?;
    let thresholded_id = insert_item_data(tx, item_id, setter_id, "tags", None, 1, job_id)?;
    write_text_row(tx, thresholded_id, &thresholded_text, Some("mcut"), None, None)?;
    Ok(())
}

fn parse_tag_samples(value: &serde_json::Value) -> EngineResult<Vec<Vec<TagScore>>> {
    let samples = value
        .as_array()
        .ok_or_else(|| EngineError::extraction_batch("tags", "expected an array of samples"))?;
    samples
        .iter()
        .map(|sample| {
            let obj = sample
                .as_object()
                .ok_or_else(|| EngineError::extraction_batch("tags", "expected sample object"))?;
            obj.iter()
                .map(|(key, conf)| {
                    let confidence = conf.as_f64().unwrap_or(0.0);
                    let (namespace, name) = key
                        .split_once(':')
                        .unwrap_or(("general", key.as_str()));
                    Ok(TagScore {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        confidence,
                    })
                })
                .collect::<EngineResult<Vec<_>>>()
        })
        .collect()
}

fn ensure_tag(tx: &rusqlite::Transaction<'_>, namespace: &str, name: &str) -> EngineResult<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO index.tags (namespace, name) VALUES (?1, ?2)",
        params![namespace, name],
    )
    .map_err(EngineError::Store)?;
    tx.query_row(
        "SELECT id FROM index.tags WHERE namespace = ?1 AND name = ?2",
        params![namespace, name],
        |row| row.get(0),
    )
    .map_err(EngineError::Store)
}

fn write_text(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
    setter_id: i64,
    item_id: i64,
    output: &PredictOutput,
) -> EngineResult<()> {
    let PredictOutput::Structured(value) = output else {
        return Err(EngineError::extraction_batch(
            "text",
            "expected structured text output",
        ));
    };
    let text = value
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let language = value.get("language").and_then(|v| v.as_str());
    let language_confidence = value.get("language_confidence").and_then(|v| v.as_f64());
    let confidence = value.get("confidence").and_then(|v| v.as_f64());

    let data_id = insert_item_data(tx, item_id, setter_id, "text", None, 0, job_id)?;
    write_text_row(tx, data_id, text, language, language_confidence, confidence)?;
    Ok(())
}

fn write_text_row(
    tx: &rusqlite::Transaction<'_>,
    data_id: i64,
    text: &str,
    language: Option<&str>,
    language_confidence: Option<f64>,
    confidence: Option<f64>,
) -> EngineResult<()> {
    tx.execute(
        "INSERT INTO index.extracted_text (id, text, language, language_confidence, confidence, text_length) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            data_id,
            text,
            language,
            language_confidence,
            confidence,
            text.chars().count() as i64
        ],
    )
    .map_err(EngineError::Store)?;
    // `extracted_text_fts` isn't trigger-synced (see the comment in store.rs) since
    // this row is the only writer; keep it in step here.
    tx.execute(
        "INSERT INTO index.extracted_text_fts (rowid, text) VALUES (?1, ?2)",
        params![data_id, text],
    )
    .map_err(EngineError::Store)?;
    Ok(())
}

fn write_embedding(
    tx: &rusqlite::Transaction<'_>,
    job_id: i64,
    setter_id: i64,
    item_id: i64,
    data_type: &str,
    output: &PredictOutput,
) -> EngineResult<()> {
    let PredictOutput::Bytes(bytes) = output else {
        return Err(EngineError::extraction_batch(
            "embedding",
            "expected raw embedding bytes",
        ));
    };
    let data_id = insert_item_data(tx, item_id, setter_id, data_type, None, 0, job_id)?;
    tx.execute(
        "INSERT INTO index.embeddings (id, embedding) VALUES (?1, ?2)",
        params![data_id, bytes],
    )
    .map_err(EngineError::Store)?;
    Ok(())
}

fn ensure_setter(store: &StoreHandle, setter_type: &str, name: &str) -> EngineResult<i64> {
    store
        .connection()
        .execute(
            "INSERT OR IGNORE INTO index.setters (setter_type, name) VALUES (?1, ?2)",
            params![setter_type, name],
        )
        .map_err(EngineError::Store)?;
    store
        .connection()
        .query_row(
            "SELECT id FROM index.setters WHERE setter_type = ?1 AND name = ?2",
            params![setter_type, name],
            |row| row.get(0),
        )
        .map_err(EngineError::Store)
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::test_double::FixedInferenceClient;
    use crate::inference::MetadataMap;
    use tempfile::TempDir;

    struct StubMaterializer;
    impl InputMaterializer for StubMaterializer {
        fn materialize(&self, _store: &StoreHandle, item_id: i64) -> EngineResult<CandidateInput> {
            Ok(CandidateInput {
                item_id,
                path: format!("/items/{item_id}"),
                input: PredictInput::Bytes(vec![0u8; 4]),
            })
        }
    }

    fn descriptor(data_type: &str, batch_size: u32) -> ExtractorDescriptor {
        ExtractorDescriptor {
            group_name: "clip".into(),
            inference_id: "vit-b32".into(),
            name: "CLIP".into(),
            description: "clip extractor".into(),
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
    async fn job_with_no_candidates_completes_with_zero_total() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::EngineConfigBuilder::new()
            .data_folder(dir.path())
            .build()
            .unwrap();
        let mut store = StoreHandle::open_write_lock(&config, true).unwrap();
        let client = FixedInferenceClient::new(MetadataMap::new());
        let materializer = StubMaterializer;

        let mut events = Vec::new();
        let job_id = run_extraction_job(
            &mut store,
            &descriptor("clip", 8),
            &client,
            &materializer,
            &[],
            &CancellationToken::new(),
            |ev| events.push(ev),
        )
        .await
        .unwrap();

        assert!(job_id > 0);
        assert_eq!(events[0].total, 0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_before_first_batch() {
        let dir = TempDir::new().unwrap();
        let config = crate::config::EngineConfigBuilder::new()
            .data_folder(dir.path())
            .build()
            .unwrap();
        let mut store = StoreHandle::open_write_lock(&config, true).unwrap();
        let client = FixedInferenceClient::new(MetadataMap::new());
        let materializer = StubMaterializer;
        let token = CancellationToken::new();
        token.cancel();

        let job_id = run_extraction_job(
            &mut store,
            &descriptor("clip", 8),
            &client,
            &materializer,
            &[],
            &token,
            |_ev| {},
        )
        .await
        .unwrap();

        let status: String = store
            .connection()
            .query_row(
                "SELECT status FROM index.job_log WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "cancelled");
    }
}
