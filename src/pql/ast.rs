//! PQL AST (C7): the typed filter/order tree a `SearchQuery` is built from.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Contains,
    NotContains,
}

/// A single-column comparison, or a value used inside `In`/`NotIn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Per-field equality/in/range/prefix/contains match, ported from `kvfilters.py`'s
/// `MatchOps`. Recursive combinators (`and_`/`or_`/`not_`) let a single
/// `MatchValues` leaf express compound column predicates without a full
/// `FilterTree` wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOps {
    Op {
        column: String,
        op: MatchOp,
        value: ScalarValue,
    },
    In {
        column: String,
        values: Vec<ScalarValue>,
    },
    NotIn {
        column: String,
        values: Vec<ScalarValue>,
    },
    And(Vec<MatchOps>),
    Or(Vec<MatchOps>),
    Not(Box<MatchOps>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistanceFunction {
    L2,
    Cosine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceAggregation {
    Min,
    Max,
    Avg,
}

/// Filters applied to the source text an embedding was derived from, when
/// aggregating confidence-weighted similarity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceTextArgs {
    pub setter_names: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
    pub min_language_confidence: Option<f64>,
    pub min_length: Option<i64>,
    pub confidence_weight: f64,
    pub language_confidence_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTo {
    pub target_sha256: String,
    pub setter_name: String,
    pub src_text: Option<SourceTextArgs>,
    pub distance_function: DistanceFunction,
    pub distance_aggregation: DistanceAggregation,
    pub clip_xmodal: bool,
    pub xmodal_t2t: bool,
    pub xmodal_i2i: bool,
}

impl Default for SimilarTo {
    fn default() -> Self {
        Self {
            target_sha256: String::new(),
            setter_name: String::new(),
            src_text: None,
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            clip_xmodal: false,
            xmodal_t2t: true,
            xmodal_i2i: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEmbeddingQuery {
    pub embedding: Vec<u8>,
    pub setter_name: String,
    pub src_text: Option<SourceTextArgs>,
    pub distance_function: DistanceFunction,
    pub distance_aggregation: DistanceAggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FtsFilter {
    pub text: String,
    pub source_setters: Option<Vec<String>>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathFtsFilter {
    pub query: String,
    pub only_filename: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMatchFilter {
    pub tags: Vec<String>,
    pub namespace: Option<String>,
    pub setters: Option<Vec<String>>,
    pub min_confidence: Option<f64>,
    pub match_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkFilter {
    pub namespace: Option<String>,
    pub user: Option<String>,
}

/// Every leaf filter kind the compiler knows how to lower, tagged with a
/// `priority` (default 0) used by the ordering algorithm to interleave
/// sortable-leaf ranks with explicit `OrderArgs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LeafFilter {
    MatchValues { priority: i32, matches: MatchOps },
    Path { priority: i32, prefixes: Vec<String> },
    Mime { priority: i32, prefixes: Vec<String> },
    MinMax { priority: i32, column: String, min: f64, max: f64 },
    Fts { priority: i32, filter: FtsFilter },
    PathFts { priority: i32, filter: PathFtsFilter },
    TagMatch { priority: i32, filter: TagMatchFilter },
    SimilarTo { priority: i32, similar: SimilarTo },
    TextEmbeddingQuery { priority: i32, query: TextEmbeddingQuery },
    Bookmark { priority: i32, filter: BookmarkFilter },
}

impl LeafFilter {
    pub fn priority(&self) -> i32 {
        match self {
            LeafFilter::MatchValues { priority, .. }
            | LeafFilter::Path { priority, .. }
            | LeafFilter::Mime { priority, .. }
            | LeafFilter::MinMax { priority, .. }
            | LeafFilter::Fts { priority, .. }
            | LeafFilter::PathFts { priority, .. }
            | LeafFilter::TagMatch { priority, .. }
            | LeafFilter::SimilarTo { priority, .. }
            | LeafFilter::TextEmbeddingQuery { priority, .. }
            | LeafFilter::Bookmark { priority, .. } => *priority,
        }
    }

    /// Filters that are sortable: they contribute an `order_rank`
    /// column the compiler can coalesce into `ORDER BY`.
    pub fn is_sortable(&self) -> bool {
        matches!(
            self,
            LeafFilter::SimilarTo { .. } | LeafFilter::TextEmbeddingQuery { .. }
        )
    }

    /// Whether this leaf resolves to a single `item_data` row (an
    /// `extracted_text` or `embeddings` id) that narrower, chained filters
    /// can thread through via `data_id`. `TagMatch` and `PathFts`
    /// touch the data level too but have no single owning `item_data` row —
    /// `tags_items` keys on `(item_id, tag_id, setter_id)` directly and
    /// `files_fts` shadows `files` — so they gate membership without
    /// producing a `data_id` for later filters to narrow against.
    pub fn touches_item_data(&self) -> bool {
        matches!(
            self,
            LeafFilter::Fts { .. }
                | LeafFilter::SimilarTo { .. }
                | LeafFilter::TextEmbeddingQuery { .. }
        )
    }

    /// Basic structural validity ("every filter implements validate();
    /// invalid filters are pruned"). Deeper semantic checks (column
    /// whitelists, etc.) happen when the caller constructs leaves via the
    /// validated newtypes.
    pub fn validate(&self) -> bool {
        match self {
            LeafFilter::SimilarTo { similar, .. } => {
                !similar.target_sha256.is_empty() && !similar.setter_name.is_empty()
            }
            LeafFilter::TextEmbeddingQuery { query, .. } => {
                !query.embedding.is_empty() && !query.setter_name.is_empty()
            }
            LeafFilter::Path { prefixes, .. } | LeafFilter::Mime { prefixes, .. } => {
                !prefixes.is_empty()
            }
            LeafFilter::Fts { filter, .. } => !filter.text.is_empty(),
            LeafFilter::PathFts { filter, .. } => !filter.query.is_empty(),
            LeafFilter::TagMatch { filter, .. } => !filter.tags.is_empty(),
            _ => true,
        }
    }
}

/// The recursive Boolean tree of filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum FilterTree {
    And { children: Vec<FilterTree> },
    Or { children: Vec<FilterTree> },
    Not { child: Box<FilterTree> },
    Leaf(LeafFilter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
    /// Use the column's own default direction.
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderArgs {
    pub order_by: String,
    pub order: OrderDirection,
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: FilterTree,
    pub order_args: Vec<OrderArgs>,
    pub count: bool,
    pub page: u32,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similar_to_requires_target_and_setter() {
        let mut similar = SimilarTo::default();
        let leaf = LeafFilter::SimilarTo {
            priority: 0,
            similar: similar.clone(),
        };
        assert!(!leaf.validate());

        similar.target_sha256 = "a".repeat(64);
        similar.setter_name = "clip/vit-b32".into();
        let leaf = LeafFilter::SimilarTo { priority: 0, similar };
        assert!(leaf.validate());
    }

    #[test]
    fn leaf_priority_defaults_propagate() {
        let leaf = LeafFilter::Mime {
            priority: 5,
            prefixes: vec!["image/".into()],
        };
        assert_eq!(leaf.priority(), 5);
    }
}
