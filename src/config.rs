//! Engine configuration, collected explicitly rather than read from the
//! environment inside deep modules. `EngineConfig::from_env` is the one place
//! environment variables are read; everything below that takes an `EngineConfig`
//! value.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Resolved configuration for a running engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the `index` logical database file.
    pub index_db: PathBuf,
    /// Path to the `user_data` logical database file.
    pub user_data_db: PathBuf,
    /// Path to the `storage` logical database file (blobs/thumbnails).
    pub storage_db: PathBuf,
    /// Root folder the indexer scans files under.
    pub data_folder: PathBuf,
    /// Open the store in read-only mode (no writer lock taken).
    pub readonly: bool,
    /// Base URL of the external inference service.
    pub inference_api_url: String,
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,

    /// Whether MCut-based tag-confidence thresholding is applied.
    pub mcut_enabled: bool,
    /// Default page size for search results.
    pub default_page_size: u32,
    /// Maximum page size a caller may request.
    pub max_page_size: u32,
}

impl EngineConfig {
    /// Build configuration from the environment variables named in the external
    /// interface contract, falling back to sensible local defaults.
    pub fn from_env() -> Result<Self> {
        let mut builder = EngineConfigBuilder::new();

        if let Ok(v) = std::env::var("INDEX_DB") {
            builder = builder.index_db(v);
        }
        if let Ok(v) = std::env::var("USER_DATA_DB") {
            builder = builder.user_data_db(v);
        }
        if let Ok(v) = std::env::var("STORAGE_DB") {
            builder = builder.storage_db(v);
        }
        if let Ok(v) = std::env::var("DATA_FOLDER") {
            builder = builder.data_folder(v);
        }
        if let Ok(v) = std::env::var("READONLY") {
            builder = builder.readonly(parse_bool(&v));
        }
        if let Ok(v) = std::env::var("INFERENCE_API_URL") {
            builder = builder.inference_api_url(v);
        }
        if let Ok(v) = std::env::var("HOST") {
            builder = builder.host(v);
        }
        if let Ok(v) = std::env::var("PORT") {
            let port: u16 = v
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {v}"))?;
            builder = builder.port(port);
        }

        builder.build()
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Explicit, validated construction of [`EngineConfig`].
pub struct EngineConfigBuilder {
    index_db: Option<PathBuf>,
    user_data_db: Option<PathBuf>,
    storage_db: Option<PathBuf>,
    data_folder: Option<PathBuf>,
    readonly: bool,
    inference_api_url: Option<String>,
    host: String,
    port: u16,
    mcut_enabled: bool,
    default_page_size: u32,
    max_page_size: u32,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            index_db: None,
            user_data_db: None,
            storage_db: None,
            data_folder: None,
            readonly: false,
            inference_api_url: None,
            host: "127.0.0.1".to_string(),
            port: 6342,
            mcut_enabled: true,
            default_page_size: 100,
            max_page_size: 1000,
        }
    }

    pub fn index_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.index_db = Some(path.into());
        self
    }

    pub fn user_data_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_data_db = Some(path.into());
        self
    }

    pub fn storage_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_db = Some(path.into());
        self
    }

    pub fn data_folder(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_folder = Some(path.into());
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn inference_api_url(mut self, url: impl Into<String>) -> Self {
        self.inference_api_url = Some(url.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn mcut_enabled(mut self, enabled: bool) -> Self {
        self.mcut_enabled = enabled;
        self
    }

    pub fn default_page_size(mut self, size: u32) -> Self {
        self.default_page_size = size;
        self
    }

    pub fn max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let data_folder = self.data_folder.unwrap_or_else(|| PathBuf::from("./data"));
        let index_db = self
            .index_db
            .unwrap_or_else(|| data_folder.join("index.db"));
        let user_data_db = self
            .user_data_db
            .unwrap_or_else(|| data_folder.join("user_data.db"));
        let storage_db = self
            .storage_db
            .unwrap_or_else(|| data_folder.join("storage.db"));
        let inference_api_url = self
            .inference_api_url
            .unwrap_or_else(|| "http://127.0.0.1:7860".to_string());

        anyhow::ensure!(self.port > 0, "port must be nonzero");
        anyhow::ensure!(
            self.max_page_size >= self.default_page_size,
            "max_page_size must be >= default_page_size"
        );

        Ok(EngineConfig {
            index_db,
            user_data_db,
            storage_db,
            data_folder,
            readonly: self.readonly,
            inference_api_url,
            host: self.host,
            port: self.port,
            mcut_enabled: self.mcut_enabled,
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        })
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
