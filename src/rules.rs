//! Rule Engine (C3): binds extractors to the items they are allowed to run on.
//!
//! Grounded in the `extraction_rules` / `extraction_rules_setters` tables and
//! their CRUD operations from the original rule store; "candidate set is empty
//! when no rule is bound" is the documented resolution of the rule-gating
//! open question (see DESIGN.md).

use crate::error::{EngineError, EngineResult};
use crate::store::StoreHandle;
use crate::types::{ValidatedMimePrefix, ValidatedMinMaxColumn};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// A single predicate over an item's attributes. Tagged with a discriminator
/// (`kind`, via serde's externally-tagged enum representation) so new filter
/// kinds can be added without breaking already-persisted rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Filter {
    /// Item already has ItemData from `setter_name` (used negated to mean "not
    /// yet processed by this setter").
    ProcessedItems { setter_name: String },
    /// Item has ItemData of one of `data_types` from `setter_name` — for
    /// extractors that consume another setter's text/tags output.
    ProcessedExtractedData {
        setter_name: String,
        data_types: Vec<String>,
    },
    /// `item.mime_type` starts with any of `prefixes`.
    Mime { prefixes: Vec<String> },
    /// At least one File's path starts with any of `prefixes`.
    Path { prefixes: Vec<String> },
    /// Inclusive range over a whitelisted numeric column.
    MinMax {
        column: String,
        min: f64,
        max: f64,
    },
}

impl Filter {
    pub fn mime(prefixes: Vec<String>) -> EngineResult<Self> {
        for p in &prefixes {
            ValidatedMimePrefix::new(p.clone()).map_err(|e| EngineError::validation(e.to_string()))?;
        }
        Ok(Filter::Mime { prefixes })
    }

    pub fn min_max(column: impl Into<String>, min: f64, max: f64) -> EngineResult<Self> {
        let column = column.into();
        ValidatedMinMaxColumn::new(column.clone())
            .map_err(|e| EngineError::validation(e.to_string()))?;
        Ok(Filter::MinMax { column, min, max })
    }

    /// Render this filter as a standalone boolean SQL predicate over the
    /// `items` table (aliased `i`), suitable for embedding in a WHERE clause or
    /// an `EXISTS (...)` wrapper. Returns the predicate text; literal values
    /// are escaped inline since they originate from stored, not user-supplied,
    /// rule definitions (rules are authored through this same validated API).
    fn to_sql_predicate(&self) -> String {
        match self {
            Filter::ProcessedItems { setter_name } => format!(
                "EXISTS (SELECT 1 FROM index.item_data id \
                 JOIN index.setters s ON s.id = id.setter_id \
                 WHERE id.item_id = i.id AND s.name = '{}')",
                escape(setter_name)
            ),
            Filter::ProcessedExtractedData {
                setter_name,
                data_types,
            } => {
                let types = data_types
                    .iter()
                    .map(|t| format!("'{}'", escape(t)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "EXISTS (SELECT 1 FROM index.item_data id \
                     JOIN index.setters s ON s.id = id.setter_id \
                     WHERE id.item_id = i.id AND s.name = '{}' AND id.data_type IN ({}))",
                    escape(setter_name),
                    types
                )
            }
            Filter::Mime { prefixes } => {
                let clauses = prefixes
                    .iter()
                    .map(|p| format!("i.mime_type LIKE '{}%'", escape(p)))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!("({clauses})")
            }
            Filter::Path { prefixes } => {
                let clauses = prefixes
                    .iter()
                    .map(|p| format!("f.path LIKE '{}%'", escape(p)))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                format!(
                    "EXISTS (SELECT 1 FROM index.files f WHERE f.item_id = i.id AND ({clauses}))"
                )
            }
            Filter::MinMax { column, min, max } => {
                // `*min != 0.0 && *max == 0.0` means "at least min, no upper bound".
                if *min != 0.0 && *max == 0.0 {
                    format!("i.{column} >= {min}")
                } else {
                    format!("i.{column} BETWEEN {min} AND {max}")
                }
            }
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// `positive` filters must all match; `negative` filters must all fail to match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleItemFilters {
    pub positive: Vec<Filter>,
    pub negative: Vec<Filter>,
}

impl RuleItemFilters {
    /// Render `matches_all(positive) AND NOT matches_any(negative)` as a single
    /// SQL boolean expression.
    fn to_sql_predicate(&self) -> String {
        let mut clauses = Vec::new();
        for f in &self.positive {
            clauses.push(f.to_sql_predicate());
        }
        for f in &self.negative {
            clauses.push(format!("NOT {}", f.to_sql_predicate()));
        }
        if clauses.is_empty() {
            "1".to_string()
        } else {
            clauses.join(" AND ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub id: i64,
    pub enabled: bool,
    pub filters: RuleItemFilters,
    pub setters: Vec<(String, String)>,
}

/// Add a new rule bound to `setters`, returning its id.
#[instrument(skip(store, filters))]
pub fn add_rule(
    store: &StoreHandle,
    setters: &[(String, String)],
    filters: &RuleItemFilters,
) -> EngineResult<i64> {
    let filters_json = serde_json::to_string(filters).map_err(|e| EngineError::Fatal(e.into()))?;
    store
        .connection()
        .execute(
            "INSERT INTO user_data.extraction_rules (enabled, filters) VALUES (1, ?1)",
            rusqlite::params![filters_json],
        )
        .map_err(EngineError::Store)?;
    let rule_id = store.connection().last_insert_rowid();
    for (setter_type, name) in setters {
        store
            .connection()
            .execute(
                "INSERT INTO user_data.extraction_rules_setters (rule_id, setter_type, setter_name) \
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![rule_id, setter_type, name],
            )
            .map_err(EngineError::Store)?;
    }
    Ok(rule_id)
}

pub fn update_rule(
    store: &StoreHandle,
    rule_id: i64,
    setters: &[(String, String)],
    filters: &RuleItemFilters,
) -> EngineResult<()> {
    let filters_json = serde_json::to_string(filters).map_err(|e| EngineError::Fatal(e.into()))?;
    let updated = store
        .connection()
        .execute(
            "UPDATE user_data.extraction_rules SET filters = ?1 WHERE id = ?2",
            rusqlite::params![filters_json, rule_id],
        )
        .map_err(EngineError::Store)?;
    if updated == 0 {
        return Err(EngineError::not_found(format!("rule {rule_id}")));
    }
    store
        .connection()
        .execute(
            "DELETE FROM user_data.extraction_rules_setters WHERE rule_id = ?1",
            rusqlite::params![rule_id],
        )
        .map_err(EngineError::Store)?;
    for (setter_type, name) in setters {
        store
            .connection()
            .execute(
                "INSERT INTO user_data.extraction_rules_setters (rule_id, setter_type, setter_name) \
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![rule_id, setter_type, name],
            )
            .map_err(EngineError::Store)?;
    }
    Ok(())
}

/// Delete a rule. `ON DELETE CASCADE` on `extraction_rules_setters.rule_id`
/// removes its setter bindings.
pub fn delete_rule(store: &StoreHandle, rule_id: i64) -> EngineResult<()> {
    let deleted = store
        .connection()
        .execute(
            "DELETE FROM user_data.extraction_rules WHERE id = ?1",
            rusqlite::params![rule_id],
        )
        .map_err(EngineError::Store)?;
    if deleted == 0 {
        return Err(EngineError::not_found(format!("rule {rule_id}")));
    }
    Ok(())
}

pub fn set_rule_enabled(store: &StoreHandle, rule_id: i64, enabled: bool) -> EngineResult<()> {
    let updated = store
        .connection()
        .execute(
            "UPDATE user_data.extraction_rules SET enabled = ?1 WHERE id = ?2",
            rusqlite::params![enabled, rule_id],
        )
        .map_err(EngineError::Store)?;
    if updated == 0 {
        return Err(EngineError::not_found(format!("rule {rule_id}")));
    }
    Ok(())
}

pub fn get_rule(store: &StoreHandle, rule_id: i64) -> EngineResult<ExtractionRule> {
    let filters_json: Option<(bool, String)> = store
        .connection()
        .query_row(
            "SELECT enabled, filters FROM user_data.extraction_rules WHERE id = ?1",
            rusqlite::params![rule_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(EngineError::Store)?;
    let (enabled, filters_json) =
        filters_json.ok_or_else(|| EngineError::not_found(format!("rule {rule_id}")))?;
    let filters: RuleItemFilters =
        serde_json::from_str(&filters_json).map_err(|e| EngineError::Fatal(e.into()))?;
    let setters = setters_for_rule(store, rule_id)?;
    Ok(ExtractionRule {
        id: rule_id,
        enabled,
        filters,
        setters,
    })
}

fn setters_for_rule(store: &StoreHandle, rule_id: i64) -> EngineResult<Vec<(String, String)>> {
    let mut stmt = store
        .connection()
        .prepare(
            "SELECT setter_type, setter_name FROM user_data.extraction_rules_setters \
             WHERE rule_id = ?1",
        )
        .map_err(EngineError::Store)?;
    let rows = stmt
        .query_map(rusqlite::params![rule_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::Store)
}

pub fn get_rules(store: &StoreHandle) -> EngineResult<Vec<ExtractionRule>> {
    let ids: Vec<i64> = {
        let mut stmt = store
            .connection()
            .prepare("SELECT id FROM user_data.extraction_rules")
            .map_err(EngineError::Store)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(EngineError::Store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::Store)?
    };
    ids.into_iter().map(|id| get_rule(store, id)).collect()
}

/// All enabled rules bound to `(setter_type, setter_name)`.
#[instrument(skip(store))]
pub fn get_rules_for_setter(
    store: &StoreHandle,
    setter_type: &str,
    setter_name: &str,
) -> EngineResult<Vec<ExtractionRule>> {
    let ids: Vec<i64> = {
        let mut stmt = store
            .connection()
            .prepare(
                "SELECT r.id FROM user_data.extraction_rules r \
                 JOIN user_data.extraction_rules_setters s ON s.rule_id = r.id \
                 WHERE r.enabled = 1 AND s.setter_type = ?1 AND s.setter_name = ?2",
            )
            .map_err(EngineError::Store)?;
        let rows = stmt
            .query_map(rusqlite::params![setter_type, setter_name], |row| {
                row.get(0)
            })
            .map_err(EngineError::Store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(EngineError::Store)?
    };
    ids.into_iter().map(|id| get_rule(store, id)).collect()
}

/// Compute the candidate item ids for `(setter_type, setter_name)`: the union
/// over all enabled bound rules of `matches_all(positive) AND NOT
/// matches_any(negative)`. An unbound setter yields an empty set rather than
/// running unconditionally — see DESIGN.md's record of this open question.
#[instrument(skip(store))]
pub fn compute_candidates(
    store: &StoreHandle,
    setter_type: &str,
    setter_name: &str,
) -> EngineResult<Vec<i64>> {
    let rules = get_rules_for_setter(store, setter_type, setter_name)?;
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let predicates: Vec<String> = rules
        .iter()
        .map(|r| r.filters.to_sql_predicate())
        .collect();
    let where_clause = predicates
        .iter()
        .map(|p| format!("({p})"))
        .collect::<Vec<_>>()
        .join(" OR ");

    let sql = format!("SELECT i.id FROM index.items i WHERE {where_clause}");

    let mut stmt = store.connection().prepare(&sql).map_err(EngineError::Store)?;
    let rows = stmt
        .query_map([], |row| row.get(0))
        .map_err(EngineError::Store)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(EngineError::Store)
}
