// Validated Types
// Strongly-typed wrappers that enforce invariants at construction, so values
// that reach the store or the PQL compiler are already known-valid.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A content hash identifying an Item, validated as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedSha256 {
    inner: String,
}

impl ValidatedSha256 {
    /// # Invariants
    /// - Exactly 64 characters
    /// - All characters are lowercase hex digits
    pub fn new(sha256: impl Into<String>) -> Result<Self> {
        let sha256 = sha256.into();
        ensure!(
            sha256.len() == 64,
            "sha256 must be 64 hex characters, got {}",
            sha256.len()
        );
        ensure!(
            sha256.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
            "sha256 must be lowercase hex: {sha256}"
        );
        Ok(Self { inner: sha256 })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedSha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// The `(type, name)` identity of a Setter, e.g. `("tags", "wd-tagger-v3")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedSetterName {
    setter_type: String,
    name: String,
}

impl ValidatedSetterName {
    /// # Invariants
    /// - Both `setter_type` and `name` are non-empty after trimming
    /// - Neither contains whitespace (names are used as SQL identifiers/cache keys)
    pub fn new(setter_type: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let setter_type = setter_type.into();
        let name = name.into();
        ensure!(!setter_type.trim().is_empty(), "setter type must not be empty");
        ensure!(!name.trim().is_empty(), "setter name must not be empty");
        ensure!(
            !setter_type.contains(char::is_whitespace) && !name.contains(char::is_whitespace),
            "setter type/name must not contain whitespace"
        );
        Ok(Self { setter_type, name })
    }

    pub fn setter_type(&self) -> &str {
        &self.setter_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ValidatedSetterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.setter_type, self.name)
    }
}

/// A MIME-type prefix used by `Mime` rule/filter matching, e.g. `"image/"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedMimePrefix {
    inner: String,
}

impl ValidatedMimePrefix {
    /// # Invariants
    /// - Non-empty after trimming
    /// - Contains no path separators
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        ensure!(!prefix.trim().is_empty(), "mime prefix must not be empty");
        ensure!(
            !prefix.contains('/') || prefix.matches('/').count() <= 1,
            "mime prefix must look like 'type/' or 'type/subtype', got {prefix}"
        );
        Ok(Self { inner: prefix })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedMimePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// The closed whitelist of numeric columns `MinMax` filters may range over.
/// Anything outside this list is a validation error rather than a SQL injection
/// surface, since these names are interpolated directly into generated SQL.
pub const MINMAX_WHITELISTED_COLUMNS: &[&str] = &[
    "width",
    "height",
    "size",
    "duration",
    "audio_tracks",
    "video_tracks",
    "subtitle_tracks",
    "time_added",
    "last_modified",
    "confidence",
    "language_confidence",
    "text_length",
    "data_index",
    "job_id",
];

/// A column name validated against [`MINMAX_WHITELISTED_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidatedMinMaxColumn {
    inner: String,
}

impl ValidatedMinMaxColumn {
    pub fn new(column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        ensure!(
            MINMAX_WHITELISTED_COLUMNS.contains(&column.as_str()),
            "column '{column}' is not a whitelisted MinMax column"
        );
        Ok(Self { inner: column })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ValidatedMinMaxColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}
