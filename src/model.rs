//! Entity types for the `index`/`user_data`/`storage` logical databases (C2).
//!
//! These are plain row representations: validation of user-supplied identifiers
//! happens at the boundary via the `Validated*` newtypes in [`crate::types`]; the
//! invariants that span multiple rows (cascade deletes, orphan collection) are
//! enforced by the store adapter rather than by these structs themselves.

use serde::{Deserialize, Serialize};

/// Content-addressed media item. One Item may have many [`File`] manifestations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub sha256: String,
    pub md5: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    pub size: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration: Option<f64>,
    pub audio_tracks: Option<i64>,
    pub video_tracks: Option<i64>,
    pub subtitle_tracks: Option<i64>,
    pub time_added: i64,
}

/// A filesystem manifestation of an [`Item`]. `path` is unique across all files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub item_id: i64,
    pub path: String,
    pub filename: String,
    pub last_modified: i64,
}

/// A named extractor instance. Unique by `(setter_type, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setter {
    pub id: i64,
    pub setter_type: String,
    pub name: String,
}

/// A logical unit of output produced by a setter for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemData {
    pub id: i64,
    pub item_id: i64,
    pub setter_id: i64,
    pub data_type: String,
    /// References another ItemData this row was derived from (e.g. a
    /// text-embedding derived from extracted text).
    pub source_id: Option<i64>,
    pub data_index: i64,
    pub job_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    /// Equal to the owning ItemData's id.
    pub id: i64,
    pub text: String,
    pub language: Option<String>,
    pub language_confidence: Option<f64>,
    pub confidence: Option<f64>,
    pub text_length: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    /// Equal to the owning ItemData's id.
    pub id: i64,
    /// Packed little-endian float32 vector, dimension implicit per setter.
    pub embedding: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagItem {
    pub item_id: i64,
    pub tag_id: i64,
    pub setter_id: i64,
    pub confidence: f64,
}

/// Status of a job's run against the store, recorded for observability and
/// for the "failures never crash the manager" guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub setter_id: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total_items: i64,
    pub processed_items: i64,
    pub failed_items: i64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub namespace: String,
    pub sha256: String,
    pub user: String,
    pub time_added: i64,
    pub metadata: Option<serde_json::Value>,
}
