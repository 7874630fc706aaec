//! Inference client (C4/C5 external collaborator): a thin RPC surface to the
//! out-of-process model-serving service. Besides the trait and an in-memory
//! test double, [`HttpInferenceClient`] below is a thin `reqwest` binding to
//! the service's HTTP API — the actual model serving is out of scope; this
//! crate only calls it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata describing one inference id within a model group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceIdMetadata {
    pub input_spec: InputSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub handler: String,
    #[serde(default)]
    pub opts: serde_json::Value,
}

/// Group-level metadata: the shared fields every inference id in the group
/// inherits unless the inference id overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub target_entities: Vec<String>,
    pub default_batch_size: Option<u32>,
    pub default_threshold: Option<f64>,
    pub input_mime_types: Option<Vec<String>>,
    pub output_type: String,
    pub default_inference_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group_metadata: GroupMetadata,
    pub inference_ids: HashMap<String, InferenceIdMetadata>,
}

/// `group_name → descriptor`, as returned by `get_metadata`.
pub type MetadataMap = HashMap<String, GroupDescriptor>;

/// An opaque prediction input: either structured data (JSON, e.g. previously
/// extracted text) or raw file bytes, mirroring `(data, file_bytes)` pairs.
#[derive(Debug, Clone)]
pub enum PredictInput {
    Data(serde_json::Value),
    Bytes(Vec<u8>),
}

/// One prediction result. Tag/text extractors return `Structured`; embedding
/// extractors return `Bytes` (the raw float32 vector).
#[derive(Debug, Clone)]
pub enum PredictOutput {
    Structured(serde_json::Value),
    Bytes(Vec<u8>),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn get_metadata(&self) -> anyhow::Result<MetadataMap>;

    async fn load_model(
        &self,
        setter_name: &str,
        cache_key: &str,
        lru_size: u32,
        ttl_seconds: u64,
    ) -> anyhow::Result<()>;

    async fn unload_model(&self, setter_name: &str, cache_key: &str) -> anyhow::Result<()>;

    async fn predict(
        &self,
        setter_name: &str,
        cache_key: &str,
        lru_size: u32,
        ttl_seconds: u64,
        inputs: Vec<PredictInput>,
    ) -> anyhow::Result<Vec<PredictOutput>>;
}

/// Binds [`InferenceClient`] to the out-of-process model-serving HTTP API.
#[derive(Debug)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct LoadModelRequest<'a> {
    cache_key: &'a str,
    lru_size: u32,
    ttl_seconds: u64,
}

#[derive(Serialize)]
struct UnloadModelRequest<'a> {
    cache_key: &'a str,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireInput {
    Data(serde_json::Value),
    Bytes(String),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireOutput {
    Structured(serde_json::Value),
    Bytes(String),
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    cache_key: &'a str,
    lru_size: u32,
    ttl_seconds: u64,
    inputs: Vec<WireInput>,
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn get_metadata(&self) -> anyhow::Result<MetadataMap> {
        let resp = self
            .client
            .get(self.url("/metadata"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<MetadataMap>().await?)
    }

    async fn load_model(
        &self,
        setter_name: &str,
        cache_key: &str,
        lru_size: u32,
        ttl_seconds: u64,
    ) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!("/models/{setter_name}/load")))
            .json(&LoadModelRequest {
                cache_key,
                lru_size,
                ttl_seconds,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn unload_model(&self, setter_name: &str, cache_key: &str) -> anyhow::Result<()> {
        self.client
            .post(self.url(&format!("/models/{setter_name}/unload")))
            .json(&UnloadModelRequest { cache_key })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn predict(
        &self,
        setter_name: &str,
        cache_key: &str,
        lru_size: u32,
        ttl_seconds: u64,
        inputs: Vec<PredictInput>,
    ) -> anyhow::Result<Vec<PredictOutput>> {
        let wire_inputs = inputs
            .into_iter()
            .map(|i| match i {
                PredictInput::Data(v) => WireInput::Data(v),
                PredictInput::Bytes(b) => {
                    WireInput::Bytes(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b))
                }
            })
            .collect();

        let resp = self
            .client
            .post(self.url(&format!("/models/{setter_name}/predict")))
            .json(&PredictRequest {
                cache_key,
                lru_size,
                ttl_seconds,
                inputs: wire_inputs,
            })
            .send()
            .await?
            .error_for_status()?;

        let outputs: Vec<WireOutput> = resp.json().await?;
        outputs
            .into_iter()
            .map(|o| match o {
                WireOutput::Structured(v) => Ok(PredictOutput::Structured(v)),
                WireOutput::Bytes(b) => {
                    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b)?;
                    Ok(PredictOutput::Bytes(bytes))
                }
            })
            .collect()
    }
}

/// Test doubles for [`InferenceClient`]. Not behind `#[cfg(test)]` since
/// integration tests in `tests/` link against this crate as an ordinary
/// dependency and need them too.
pub mod test_double {
    use super::*;
    use std::sync::Mutex;

    /// A fixed-response client for exercising the registry and job runner
    /// without a live inference service.
    pub struct FixedInferenceClient {
        pub metadata: MetadataMap,
        pub predict_calls: Mutex<Vec<String>>,
    }

    impl FixedInferenceClient {
        pub fn new(metadata: MetadataMap) -> Self {
            Self {
                metadata,
                predict_calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InferenceClient for FixedInferenceClient {
        async fn get_metadata(&self) -> anyhow::Result<MetadataMap> {
            Ok(self.metadata.clone())
        }

        async fn load_model(
            &self,
            _setter_name: &str,
            _cache_key: &str,
            _lru_size: u32,
            _ttl_seconds: u64,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn unload_model(&self, _setter_name: &str, _cache_key: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn predict(
            &self,
            setter_name: &str,
            _cache_key: &str,
            _lru_size: u32,
            _ttl_seconds: u64,
            inputs: Vec<PredictInput>,
        ) -> anyhow::Result<Vec<PredictOutput>> {
            self.predict_calls
                .lock()
                .unwrap()
                .push(setter_name.to_string());
            Ok(inputs
                .iter()
                .map(|_| PredictOutput::Structured(serde_json::json!({})))
                .collect())
        }
    }
}
