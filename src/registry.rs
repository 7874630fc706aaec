//! Extractor Registry (C4): the group + inference-id model.
//!
//! This implements the *authoritative* design named in the source's models.py —
//! a metadata-driven `ModelGroup`/`ModelOptsFactory` pair — rather than the
//! earlier hardcoded per-model classes (`TagsModel`, `OCRModel`, ...), which
//! design notes mark dead. See DESIGN.md for that decision.

use crate::error::{EngineError, EngineResult};
use crate::inference::{GroupDescriptor, InferenceClient, MetadataMap};
use crate::store::StoreHandle;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, instrument};

/// A single extractor: one inference id within a model group.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorDescriptor {
    pub group_name: String,
    pub inference_id: String,
    pub name: String,
    pub description: String,
    pub data_type: String,
    pub target_entities: Vec<String>,
    pub supported_mime_prefixes: Option<Vec<String>>,
    pub default_batch_size: u32,
    pub default_threshold: Option<f64>,
    pub input_spec_handler: String,
    pub input_spec_opts: serde_json::Value,
}

impl ExtractorDescriptor {
    /// `"{group}/{inference_id}"`, the setter name this extractor writes under.
    pub fn setter_name(&self) -> String {
        format!("{}/{}", self.group_name, self.inference_id)
    }
}

/// Holds the last metadata fetched from the inference service, plus any
/// persisted per-group overrides. Populated by [`Registry::refresh`] at
/// startup; a failed refresh leaves the registry empty but retryable.
pub struct Registry {
    descriptors: RwLock<HashMap<String, ExtractorDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// Re-fetch metadata from the inference service and rebuild the
    /// in-memory descriptor table, applying persisted group overrides.
    /// On failure, the registry is left as it was (empty on first call).
    #[instrument(skip(self, client, store))]
    pub async fn refresh(
        &self,
        client: &dyn InferenceClient,
        store: &StoreHandle,
    ) -> EngineResult<()> {
        let metadata = client
            .get_metadata()
            .await
            .map_err(|e| EngineError::InferenceUnavailable(e.to_string()))?;
        let descriptors = build_descriptors(&metadata, store)?;
        info!(count = descriptors.len(), "registry refreshed");
        *self.descriptors.write().unwrap() = descriptors;
        Ok(())
    }

    pub fn get(&self, setter_name: &str) -> Option<ExtractorDescriptor> {
        self.descriptors.read().unwrap().get(setter_name).cloned()
    }

    pub fn all(&self) -> Vec<ExtractorDescriptor> {
        self.descriptors.read().unwrap().values().cloned().collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_descriptors(
    metadata: &MetadataMap,
    store: &StoreHandle,
) -> EngineResult<HashMap<String, ExtractorDescriptor>> {
    let mut out = HashMap::new();
    for (group_name, descriptor) in metadata {
        for (inference_id, id_meta) in &descriptor.inference_ids {
            let (batch_size, threshold) = group_settings(store, group_name)
                .unwrap_or((descriptor.group_metadata.default_batch_size, None));
            let default_batch_size = batch_size.unwrap_or(64);
            let default_threshold = threshold.or(descriptor.group_metadata.default_threshold);

            let entry = ExtractorDescriptor {
                group_name: group_name.clone(),
                inference_id: inference_id.clone(),
                name: descriptor
                    .group_metadata
                    .name
                    .clone()
                    .unwrap_or_else(|| group_name.clone()),
                description: descriptor
                    .group_metadata
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Run {group_name} extractor")),
                data_type: descriptor.group_metadata.output_type.clone(),
                target_entities: if descriptor.group_metadata.target_entities.is_empty() {
                    vec!["items".to_string()]
                } else {
                    descriptor.group_metadata.target_entities.clone()
                },
                supported_mime_prefixes: descriptor.group_metadata.input_mime_types.clone(),
                default_batch_size,
                default_threshold,
                input_spec_handler: id_meta.input_spec.handler.clone(),
                input_spec_opts: id_meta.input_spec.opts.clone(),
            };
            out.insert(entry.setter_name(), entry);
        }
    }
    Ok(out)
}

/// Persisted `(batch_size, threshold)` override for a group, if set.
fn group_settings(store: &StoreHandle, group_name: &str) -> Option<(Option<u32>, Option<f64>)> {
    store
        .connection()
        .query_row(
            "SELECT batch_size, threshold FROM user_data.group_settings WHERE group_name = ?1",
            rusqlite::params![group_name],
            |row| {
                let batch_size: Option<i64> = row.get(0)?;
                let threshold: Option<f64> = row.get(1)?;
                Ok((batch_size.map(|b| b as u32), threshold))
            },
        )
        .ok()
}

/// Persist a per-group batch size override.
pub fn set_group_batch_size(
    store: &StoreHandle,
    group_name: &str,
    batch_size: u32,
) -> EngineResult<()> {
    store
        .connection()
        .execute(
            "INSERT INTO user_data.group_settings (group_name, batch_size) VALUES (?1, ?2) \
             ON CONFLICT(group_name) DO UPDATE SET batch_size = excluded.batch_size",
            rusqlite::params![group_name, batch_size],
        )
        .map_err(EngineError::Store)?;
    Ok(())
}

/// Persist a per-group confidence threshold override.
pub fn set_group_threshold(
    store: &StoreHandle,
    group_name: &str,
    threshold: f64,
) -> EngineResult<()> {
    store
        .connection()
        .execute(
            "INSERT INTO user_data.group_settings (group_name, threshold) VALUES (?1, ?2) \
             ON CONFLICT(group_name) DO UPDATE SET threshold = excluded.threshold",
            rusqlite::params![group_name, threshold],
        )
        .map_err(EngineError::Store)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{GroupMetadata, InferenceIdMetadata, InputSpec};
    use std::collections::HashMap as Map;

    fn sample_metadata() -> MetadataMap {
        let mut inference_ids = Map::new();
        inference_ids.insert(
            "v3".to_string(),
            InferenceIdMetadata {
                input_spec: InputSpec {
                    handler: "image_file".to_string(),
                    opts: serde_json::json!({}),
                },
            },
        );
        let mut map = Map::new();
        map.insert(
            "wd-tagger".to_string(),
            GroupDescriptor {
                group_metadata: GroupMetadata {
                    name: Some("WD Tagger".to_string()),
                    description: None,
                    target_entities: vec!["items".to_string()],
                    default_batch_size: Some(32),
                    default_threshold: Some(0.3),
                    input_mime_types: Some(vec!["image/".to_string()]),
                    output_type: "tags".to_string(),
                    default_inference_id: Some("v3".to_string()),
                },
                inference_ids,
            },
        );
        map
    }

    #[test]
    fn descriptor_setter_name_is_group_slash_inference_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::EngineConfigBuilder::new()
            .data_folder(dir.path())
            .build()
            .unwrap();
        let store = StoreHandle::open_write_lock(&config, true).unwrap();
        let descriptors = build_descriptors(&sample_metadata(), &store).unwrap();
        let d = descriptors.get("wd-tagger/v3").unwrap();
        assert_eq!(d.setter_name(), "wd-tagger/v3");
        assert_eq!(d.default_batch_size, 32);
    }

    #[test]
    fn group_override_wins_over_metadata_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::EngineConfigBuilder::new()
            .data_folder(dir.path())
            .build()
            .unwrap();
        let store = StoreHandle::open_write_lock(&config, true).unwrap();
        set_group_batch_size(&store, "wd-tagger", 8).unwrap();
        let descriptors = build_descriptors(&sample_metadata(), &store).unwrap();
        let d = descriptors.get("wd-tagger/v3").unwrap();
        assert_eq!(d.default_batch_size, 8);
    }
}
