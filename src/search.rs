//! Search Facade (C10): the request-facing surface over the PQL compiler,
//! plus the read-only "supplemented" operations that round out a search API
//! (stats, tag autocomplete, bookmark inventory, orphan-tag collection) but
//! aren't PQL filters in their own right.

use crate::error::{EngineError, EngineResult};
use crate::model::Bookmark;
use crate::pql::ast::SearchQuery;
use crate::pql::compiler::compile_search_query;
use crate::store::StoreHandle;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultRow {
    pub item_id: i64,
    pub file_id: i64,
    pub sha256: String,
    pub path: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    pub time_added: i64,
    pub last_modified: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub count: i64,
    pub results: Vec<SearchResultRow>,
}

/// Run a [`SearchQuery`] against a read-only handle, returning both the page
/// of results and the total match count (`{ count, results }`). The
/// count is computed with a second compiled query (`query.count = true`)
/// rather than a window function, matching the compiler's COUNT-mode branch.
#[instrument(skip(store, query))]
pub fn search(store: &StoreHandle, query: &SearchQuery) -> EngineResult<SearchResults> {
    let compiled = compile_search_query(query)?;

    let mut stmt = store.connection().prepare(&compiled.sql).map_err(EngineError::Store)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SearchResultRow {
                item_id: row.get("item_id")?,
                file_id: row.get("file_id")?,
                sha256: row.get("sha256")?,
                path: row.get("path")?,
                filename: row.get("filename")?,
                mime_type: row.get("mime_type")?,
                size: row.get("size")?,
                time_added: row.get("time_added")?,
                last_modified: row.get("last_modified")?,
            })
        })
        .map_err(EngineError::Store)?;
    let results = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::Store)?;
    drop(stmt);

    let mut count_query = query.clone();
    count_query.count = true;
    let count_compiled = compile_search_query(&count_query)?;
    let count: i64 = store
        .connection()
        .query_row(&count_compiled.sql, [], |row| row.get(0))
        .map_err(EngineError::Store)?;

    Ok(SearchResults { count, results })
}

/// Wire shape for an embedding query payload: base64 of an
/// npy-compatible float32 array, accepting rank-1 (`shape = [dim]`) or
/// rank-2 (`shape = [rows, dim]`, first row taken) inputs.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingPayload {
    pub data: String,
    pub shape: Vec<usize>,
}

/// Decode a base64 embedding payload into the packed little-endian float32
/// blob the store's `embeddings` table and `vec_distance_*` functions expect.
pub fn decode_embedding(payload: &EmbeddingPayload) -> EngineResult<Vec<u8>> {
    let raw = BASE64
        .decode(&payload.data)
        .map_err(|e| EngineError::validation(format!("invalid base64 embedding payload: {e}")))?;
    if raw.len() % 4 != 0 {
        return Err(EngineError::validation(
            "embedding payload length is not a multiple of 4 bytes",
        ));
    }
    let floats: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let row_len = match payload.shape.as_slice() {
        [dim] => *dim,
        [_, dim] => *dim,
        _ => {
            return Err(EngineError::validation(
                "embedding shape must be rank-1 or rank-2",
            ))
        }
    };
    if row_len == 0 || row_len > floats.len() {
        return Err(EngineError::validation(
            "embedding shape does not match payload length",
        ));
    }

    let mut out = Vec::with_capacity(row_len * 4);
    for f in &floats[..row_len] {
        out.extend_from_slice(&f.to_le_bytes());
    }
    Ok(out)
}

/// `{ setters, bookmarks, files, tags, folders, text_stats }` breakdown for the stats
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SearchStats {
    pub setters: Vec<SetterStat>,
    pub bookmarks: i64,
    pub files: i64,
    pub tags: i64,
    pub folders: i64,
    pub text_stats: TextStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetterStat {
    pub setter_type: String,
    pub name: String,
    pub item_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextStats {
    pub rows: i64,
    pub total_length: i64,
    pub languages: Vec<(String, i64)>,
}

pub fn search_stats(store: &StoreHandle) -> EngineResult<SearchStats> {
    let setters = {
        let mut stmt = store
            .connection()
            .prepare(
                "SELECT s.setter_type, s.name, COUNT(DISTINCT id.item_id) \
                 FROM index.setters s \
                 JOIN index.item_data id ON id.setter_id = s.id \
                 GROUP BY s.id",
            )
            .map_err(EngineError::Store)?;
        stmt.query_map([], |row| {
            Ok(SetterStat {
                setter_type: row.get(0)?,
                name: row.get(1)?,
                item_count: row.get(2)?,
            })
        })
        .map_err(EngineError::Store)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::Store)?
    };

    let bookmarks: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM user_data.bookmarks", [], |row| row.get(0))
        .map_err(EngineError::Store)?;
    let files: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM index.files", [], |row| row.get(0))
        .map_err(EngineError::Store)?;
    let tags: i64 = store
        .connection()
        .query_row("SELECT COUNT(*) FROM index.tags", [], |row| row.get(0))
        .map_err(EngineError::Store)?;
    let folders: i64 = store
        .connection()
        .query_row(
            "SELECT COUNT(DISTINCT rtrim(path, replace(path, '/', ''))) FROM index.files",
            [],
            |row| row.get(0),
        )
        .map_err(EngineError::Store)?;

    let (rows, total_length): (i64, Option<i64>) = store
        .connection()
        .query_row(
            "SELECT COUNT(*), SUM(text_length) FROM index.extracted_text",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(EngineError::Store)?;
    let languages = {
        let mut stmt = store
            .connection()
            .prepare(
                "SELECT language, COUNT(*) FROM index.extracted_text \
                 WHERE language IS NOT NULL GROUP BY language ORDER BY COUNT(*) DESC",
            )
            .map_err(EngineError::Store)?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(EngineError::Store)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::Store)?
    };

    Ok(SearchStats {
        setters,
        bookmarks,
        files,
        tags,
        folders,
        text_stats: TextStats {
            rows,
            total_length: total_length.unwrap_or(0),
            languages,
        },
    })
}

/// `GET /api/search/tags?name=&limit=`: prefix autocomplete over tag names.
pub fn tag_autocomplete(store: &StoreHandle, name_prefix: &str, limit: i64) -> EngineResult<Vec<String>> {
    let mut stmt = store
        .connection()
        .prepare("SELECT DISTINCT name FROM index.tags WHERE name LIKE ?1 ORDER BY name LIMIT ?2")
        .map_err(EngineError::Store)?;
    let like = format!("{}%", name_prefix.replace('%', "\\%").replace('_', "\\_"));
    let rows = stmt
        .query_map(rusqlite::params![like, limit], |row| row.get(0))
        .map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::Store)
}

/// `GET /api/search/tags/top?namespace=&setters=&confidence_threshold=&limit=`.
pub fn top_tags(
    store: &StoreHandle,
    namespace: Option<&str>,
    setters: Option<&[String]>,
    confidence_threshold: Option<f64>,
    limit: i64,
) -> EngineResult<Vec<(String, i64)>> {
    let mut clauses = vec!["1".to_string()];
    if let Some(ns) = namespace {
        clauses.push(format!("t.namespace = '{}'", ns.replace('\'', "''")));
    }
    if let Some(setters) = setters {
        let list = setters
            .iter()
            .map(|s| format!("'{}'", s.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        clauses.push(format!("s.name IN ({list})"));
    }
    if let Some(threshold) = confidence_threshold {
        clauses.push(format!("ti.confidence >= {threshold}"));
    }

    let sql = format!(
        "SELECT t.name, COUNT(*) AS uses \
         FROM index.tags_items ti \
         JOIN index.tags t ON t.id = ti.tag_id \
         JOIN index.setters s ON s.id = ti.setter_id \
         WHERE {} \
         GROUP BY t.id ORDER BY uses DESC LIMIT ?1",
        clauses.join(" AND ")
    );
    let mut stmt = store.connection().prepare(&sql).map_err(EngineError::Store)?;
    let rows = stmt
        .query_map(rusqlite::params![limit], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::Store)
}

/// Delete tag rows no [`crate::model::TagItem`] references, a cleanup run
/// after setter/item deletion cascades. Returns the count
/// removed.
pub fn collect_orphan_tags(store: &StoreHandle) -> EngineResult<usize> {
    let deleted = store
        .connection()
        .execute(
            "DELETE FROM index.tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM index.tags_items)",
            [],
        )
        .map_err(EngineError::Store)?;
    tracing::info!(deleted, "collected orphan tags");
    Ok(deleted)
}

pub fn add_bookmark(store: &StoreHandle, bookmark: &Bookmark) -> EngineResult<()> {
    let metadata_json = bookmark
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| EngineError::Fatal(e.into()))?;
    store
        .connection()
        .execute(
            "INSERT INTO user_data.bookmarks (namespace, sha256, user, time_added, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(namespace, sha256, user) DO UPDATE SET \
                time_added = excluded.time_added, metadata = excluded.metadata",
            rusqlite::params![
                bookmark.namespace,
                bookmark.sha256,
                bookmark.user,
                bookmark.time_added,
                metadata_json
            ],
        )
        .map_err(EngineError::Store)?;
    Ok(())
}

pub fn remove_bookmark(store: &StoreHandle, namespace: &str, sha256: &str, user: &str) -> EngineResult<()> {
    let deleted = store
        .connection()
        .execute(
            "DELETE FROM user_data.bookmarks WHERE namespace = ?1 AND sha256 = ?2 AND user = ?3",
            rusqlite::params![namespace, sha256, user],
        )
        .map_err(EngineError::Store)?;
    if deleted == 0 {
        return Err(EngineError::not_found(format!(
            "bookmark {namespace}/{sha256}/{user}"
        )));
    }
    Ok(())
}

/// All distinct bookmark namespaces. When `include_wildcard` is set, also
/// returns namespaces bookmarked under the `"*"` (all-users) user, per the
/// source's `get_all_bookmark_namespaces` behavior.
pub fn bookmark_namespaces(store: &StoreHandle, include_wildcard: bool) -> EngineResult<Vec<String>> {
    let sql = if include_wildcard {
        "SELECT DISTINCT namespace FROM user_data.bookmarks ORDER BY namespace"
    } else {
        "SELECT DISTINCT namespace FROM user_data.bookmarks WHERE user != '*' ORDER BY namespace"
    };
    let mut stmt = store.connection().prepare(sql).map_err(EngineError::Store)?;
    let rows = stmt.query_map([], |row| row.get(0)).map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::Store)
}

/// Distinct users who have placed at least one bookmark.
pub fn bookmark_users(store: &StoreHandle) -> EngineResult<Vec<String>> {
    let mut stmt = store
        .connection()
        .prepare("SELECT DISTINCT user FROM user_data.bookmarks ORDER BY user")
        .map_err(EngineError::Store)?;
    let rows = stmt.query_map([], |row| row.get(0)).map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EngineError::Store)
}
