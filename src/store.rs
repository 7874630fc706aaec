//! Store Adapter (C1): opens the three logical SQLite databases, attaches them
//! into a single connection, loads the vector-search extension, and hands out
//! scoped handles so callers can never forget to release a write lock.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{info, instrument};

const INDEX_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY,
    sha256 TEXT NOT NULL UNIQUE,
    md5 TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    duration REAL,
    audio_tracks INTEGER,
    video_tracks INTEGER,
    subtitle_tracks INTEGER,
    time_added INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    last_modified INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_item_id ON files(item_id);

CREATE TABLE IF NOT EXISTS setters (
    id INTEGER PRIMARY KEY,
    setter_type TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE(setter_type, name)
);

CREATE TABLE IF NOT EXISTS item_data (
    id INTEGER PRIMARY KEY,
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    setter_id INTEGER NOT NULL REFERENCES setters(id) ON DELETE CASCADE,
    data_type TEXT NOT NULL,
    source_id INTEGER REFERENCES item_data(id) ON DELETE CASCADE,
    data_index INTEGER NOT NULL DEFAULT 0,
    job_id INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_item_data_item_id ON item_data(item_id);
CREATE INDEX IF NOT EXISTS idx_item_data_setter_id ON item_data(setter_id);
CREATE INDEX IF NOT EXISTS idx_item_data_source_id ON item_data(source_id);

CREATE TABLE IF NOT EXISTS extracted_text (
    id INTEGER PRIMARY KEY REFERENCES item_data(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    language TEXT,
    language_confidence REAL,
    confidence REAL,
    text_length INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY REFERENCES item_data(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE(namespace, name)
);

CREATE TABLE IF NOT EXISTS tags_items (
    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    setter_id INTEGER NOT NULL REFERENCES setters(id) ON DELETE CASCADE,
    confidence REAL NOT NULL,
    PRIMARY KEY (item_id, tag_id, setter_id)
);

CREATE TABLE IF NOT EXISTS job_log (
    id INTEGER PRIMARY KEY,
    setter_id INTEGER NOT NULL REFERENCES setters(id) ON DELETE CASCADE,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
);

-- FTS5 shadow tables backing the FTS(text) and PathFTS leaves. Kept in
-- sync by the writers that own each base table: `extracted_text_fts` is
-- populated by the extraction job runner alongside `extracted_text` rows;
-- `files_fts` is populated by a trigger since file ingestion is an external
-- collaborator this crate does not control.
CREATE VIRTUAL TABLE IF NOT EXISTS extracted_text_fts USING fts5(
    text, content='extracted_text', content_rowid='id'
);

CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
    path, filename, content='files', content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS files_fts_ai AFTER INSERT ON files BEGIN
    INSERT INTO files_fts(rowid, path, filename) VALUES (new.id, new.path, new.filename);
END;
CREATE TRIGGER IF NOT EXISTS files_fts_ad AFTER DELETE ON files BEGIN
    INSERT INTO files_fts(files_fts, rowid, path, filename) VALUES ('delete', old.id, old.path, old.filename);
END;
CREATE TRIGGER IF NOT EXISTS files_fts_au AFTER UPDATE ON files BEGIN
    INSERT INTO files_fts(files_fts, rowid, path, filename) VALUES ('delete', old.id, old.path, old.filename);
    INSERT INTO files_fts(rowid, path, filename) VALUES (new.id, new.path, new.filename);
END;
";

const USER_DATA_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS extraction_rules (
    id INTEGER PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    filters TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS extraction_rules_setters (
    rule_id INTEGER NOT NULL REFERENCES extraction_rules(id) ON DELETE CASCADE,
    setter_type TEXT NOT NULL,
    setter_name TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rules_setters_lookup
    ON extraction_rules_setters(setter_type, setter_name);

CREATE TABLE IF NOT EXISTS group_settings (
    group_name TEXT PRIMARY KEY,
    batch_size INTEGER,
    threshold REAL
);

CREATE TABLE IF NOT EXISTS bookmarks (
    namespace TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    user TEXT NOT NULL,
    time_added INTEGER NOT NULL,
    metadata TEXT,
    PRIMARY KEY (namespace, sha256, user)
);
";

const STORAGE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS thumbnails (
    sha256 TEXT PRIMARY KEY,
    data BLOB NOT NULL
);
";

/// How a [`StoreHandle`] was opened; governs which attached databases accept writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    /// All three databases attached `?mode=ro`.
    ReadOnly,
    /// `index` and `storage` writable; `user_data` writable only if `user_data_wl` is set.
    WriteLock { user_data_wl: bool },
}

/// A scoped connection with `index`/`user_data`/`storage` attached under those
/// schema names, foreign keys enabled, and the vector extension loaded.
///
/// Handles are meant to be acquired, used, and dropped within a single request
/// or job batch — never held across an `.await` suspension point other than
/// `spawn_blocking`, since the underlying `rusqlite::Connection` is synchronous.
pub struct StoreHandle {
    pub(crate) conn: Connection,
    mode: HandleMode,
}

impl StoreHandle {
    #[instrument(skip(config), fields(readonly = matches!(mode, HandleMode::ReadOnly)))]
    fn open(config: &EngineConfig, mode: HandleMode) -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening scratch connection")?;

        attach(&conn, "index", &config.index_db, &mode)?;
        attach(&conn, "user_data", &config.user_data_db, &mode)?;
        attach(&conn, "storage", &config.storage_db, &mode)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("enabling foreign keys")?;

        if !matches!(mode, HandleMode::ReadOnly) {
            conn.execute_batch("PRAGMA journal_mode = WAL;")
                .context("setting WAL journal mode")?;
        }

        load_vector_extension(&conn)?;

        if matches!(mode, HandleMode::ReadOnly) {
            conn.execute_batch(INDEX_SCHEMA_ATTACHED)?;
        } else {
            run_schema(&conn, "index", INDEX_SCHEMA)?;
            run_schema(&conn, "user_data", USER_DATA_SCHEMA)?;
            run_schema(&conn, "storage", STORAGE_SCHEMA)?;
        }

        info!(mode = ?mode, "store handle opened");
        Ok(Self { conn, mode })
    }

    /// Open a read-only handle: all three databases attached in `mode=ro`.
    pub fn open_readonly(config: &EngineConfig) -> Result<Self> {
        Self::open(config, HandleMode::ReadOnly)
    }

    /// Open a write-lock handle. `index` and `storage` are always writable;
    /// `user_data` is writable only when `user_data_wl` is true (rule/bookmark
    /// mutations need it, extraction jobs typically do not).
    pub fn open_write_lock(config: &EngineConfig, user_data_wl: bool) -> Result<Self> {
        Self::open(config, HandleMode::WriteLock { user_data_wl })
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Run `body` inside a transaction, committing on `Ok` and rolling back on `Err`
    /// or panic — commit on success, rollback on fatal error.
    pub fn with_transaction<T>(
        &mut self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let tx = self.conn.transaction().map_err(EngineError::Store)?;
        let result = body(&tx)?;
        tx.commit().map_err(EngineError::Store)?;
        Ok(result)
    }
}

// Placeholder constant: a read-only handle still needs `CREATE TABLE IF NOT
// EXISTS` semantics to be a no-op against an already-migrated database, but
// must never attempt writes if the file doesn't exist yet. In read-only mode
// we skip schema creation entirely and rely on the writer having run first.
const INDEX_SCHEMA_ATTACHED: &str = "";

fn attach(conn: &Connection, schema_name: &str, path: &Path, mode: &HandleMode) -> Result<()> {
    let uri = if matches!(mode, HandleMode::ReadOnly) {
        format!("file:{}?mode=ro", path.display())
    } else {
        format!("file:{}", path.display())
    };
    conn.execute(
        &format!("ATTACH DATABASE '{uri}' AS {schema_name}"),
        [],
    )
    .with_context(|| format!("attaching {schema_name} database at {}", path.display()))?;
    Ok(())
}

fn run_schema(conn: &Connection, schema_name: &str, ddl: &str) -> Result<()> {
    // Table names are unique across the three schemas, so only the DDL statement
    // kind needs schema-qualifying: CREATE INDEX infers its table's schema from
    // the index's own schema qualifier.
    let scoped = ddl
        .replace(
            "CREATE TABLE IF NOT EXISTS ",
            &format!("CREATE TABLE IF NOT EXISTS {schema_name}."),
        )
        .replace(
            "CREATE INDEX IF NOT EXISTS ",
            &format!("CREATE INDEX IF NOT EXISTS {schema_name}."),
        )
        .replace(
            "CREATE VIRTUAL TABLE IF NOT EXISTS ",
            &format!("CREATE VIRTUAL TABLE IF NOT EXISTS {schema_name}."),
        )
        .replace(
            "CREATE TRIGGER IF NOT EXISTS ",
            &format!("CREATE TRIGGER IF NOT EXISTS {schema_name}."),
        );
    conn.execute_batch(&scoped)
        .with_context(|| format!("running schema for {schema_name}"))?;
    Ok(())
}

/// Load the `vec0` vector-search SQLite extension (sqlite-vec) so `vec_distance_L2`
/// and `vec_distance_cosine` are available to the similarity planner (C9).
///
/// Registered once per process as an auto-extension rather than per-connection:
/// `sqlite3_auto_extension` is idempotent for the same function pointer, so
/// calling this on every `StoreHandle::open` is safe.
fn load_vector_extension(_conn: &Connection) -> Result<()> {
    unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EngineConfig {
        crate::config::EngineConfigBuilder::new()
            .data_folder(dir.path())
            .build()
            .unwrap()
    }

    #[test]
    fn write_lock_handle_creates_schema() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let handle = StoreHandle::open_write_lock(&config, true);
        assert!(handle.is_ok());
    }

    #[test]
    fn readonly_handle_fails_before_any_writer_has_run() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let handle = StoreHandle::open_readonly(&config);
        assert!(handle.is_err());
    }

    #[test]
    fn readonly_handle_succeeds_after_writer_initializes_schema() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let _writer = StoreHandle::open_write_lock(&config, true).unwrap();
        }
        let reader = StoreHandle::open_readonly(&config);
        assert!(reader.is_ok());
    }
}
