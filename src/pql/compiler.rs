//! PQL Compiler (C8): lowers a [`FilterTree`] into a single SQL statement
//! built from stacked common-table expressions.
//!
//! Every CTE in the stack projects the same standard columns — `file_id`,
//! `item_id`, and once any filter in the tree has touched the data level,
//! `data_id` — over the previous CTE (its "context"). `And` chains
//! filters serially; `Or` compiles each child against the same parent and
//! unions the results; `Not` computes `parent EXCEPT child`. Sortable leaves
//! (similarity, text-embedding) additionally project a numbered rank column
//! and register themselves with [`QueryState`] so [`build_order_by`] can
//! merge them with explicit [`OrderArgs`].

use crate::error::{EngineError, EngineResult};
use crate::pql::ast::*;
use crate::pql::similarity;
use crate::types::ValidatedMinMaxColumn;

/// Threaded through compilation: a CTE-naming
/// counter, the item-data latch, and the count-mode flag that tells sortable
/// leaves to skip rank computation.
pub struct QueryState {
    cte_counter: u32,
    pub item_data_query: bool,
    pub is_count_query: bool,
    ctes: Vec<String>,
    rank_columns: Vec<RankColumn>,
}

#[derive(Clone)]
struct RankColumn {
    priority: i32,
    cte: String,
    column: String,
    direction: OrderDirection,
}

impl QueryState {
    pub(crate) fn new(is_count_query: bool) -> Self {
        Self {
            cte_counter: 0,
            item_data_query: false,
            is_count_query,
            ctes: Vec::new(),
            rank_columns: Vec::new(),
        }
    }

    pub fn next_cte_name(&mut self) -> String {
        let name = format!("f{}", self.cte_counter);
        self.cte_counter += 1;
        name
    }

    #[cfg(test)]
    pub(crate) fn ctes_for_test(&self) -> &[String] {
        &self.ctes
    }

    pub(crate) fn push_cte(&mut self, name: &str, body: &str) {
        self.ctes.push(format!("{name} AS (\n{body}\n)"));
    }
}

/// A CTE's identity plus whether it carries a `data_id` column. Shared with
/// [`crate::pql::similarity`], which produces its own sortable-leaf CTEs in
/// terms of the same contract.
#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) name: String,
    pub(crate) has_data_id: bool,
}

pub struct CompiledQuery {
    pub sql: String,
    pub is_count: bool,
}

/// Compile a [`SearchQuery`] into a single executable SQL statement.
pub fn compile_search_query(query: &SearchQuery) -> EngineResult<CompiledQuery> {
    let mut state = QueryState::new(query.count);
    let root = compile_tree(&query.query, None, &mut state)?;

    let order_by = build_order_by(&query.order_args, &state, &root);

    let sql = if query.count {
        format!(
            "WITH {}\nSELECT COUNT(DISTINCT file_id) AS count FROM {}",
            state.ctes.join(",\n"),
            root.name
        )
    } else {
        let page_size = query.page_size.max(1);
        let offset = query.page as u64 * page_size as u64;
        format!(
            "WITH {}\nSELECT i.id AS item_id, c.file_id AS file_id, i.sha256 AS sha256, \
             f.path AS path, f.filename AS filename, i.mime_type AS mime_type, i.size AS size, \
             i.time_added AS time_added, f.last_modified AS last_modified\n\
             FROM {} c \
             JOIN index.items i ON i.id = c.item_id \
             JOIN index.files f ON f.id = c.file_id\n\
             {order_by}\nLIMIT {page_size} OFFSET {offset}",
            state.ctes.join(",\n"),
            root.name,
        )
    };

    Ok(CompiledQuery {
        sql,
        is_count: query.count,
    })
}

fn compile_tree(node: &FilterTree, ctx: Option<&Ctx>, state: &mut QueryState) -> EngineResult<Ctx> {
    match node {
        FilterTree::Leaf(leaf) => {
            let ctx = match ctx {
                Some(c) => c.clone(),
                None => base_cte(state),
            };
            if !leaf.validate() {
                // Pruned: an invalid filter behaves as identity.
                return Ok(ctx);
            }
            compile_leaf(leaf, &ctx, state)
        }
        FilterTree::And { children } => {
            if children.is_empty() {
                return Ok(match ctx {
                    Some(c) => c.clone(),
                    None => base_cte(state),
                });
            }
            let mut cur = ctx.cloned();
            for child in children {
                cur = Some(compile_tree(child, cur.as_ref(), state)?);
            }
            Ok(cur.unwrap())
        }
        FilterTree::Or { children } => {
            let parent = match ctx {
                Some(c) => c.clone(),
                None => base_cte(state),
            };
            if children.is_empty() {
                return Ok(parent);
            }
            let mut branches = Vec::with_capacity(children.len());
            for child in children {
                branches.push(compile_tree(child, Some(&parent), state)?);
            }
            let has_data_id = branches.iter().any(|b| b.has_data_id);
            let selects: Vec<String> = branches
                .iter()
                .map(|b| {
                    if has_data_id {
                        if b.has_data_id {
                            format!("SELECT file_id, item_id, data_id FROM {}", b.name)
                        } else {
                            format!("SELECT file_id, item_id, NULL AS data_id FROM {}", b.name)
                        }
                    } else {
                        format!("SELECT file_id, item_id FROM {}", b.name)
                    }
                })
                .collect();
            let name = state.next_cte_name();
            state.push_cte(&name, &selects.join("\nUNION\n"));
            Ok(Ctx { name, has_data_id })
        }
        FilterTree::Not { child } => {
            let parent = match ctx {
                Some(c) => c.clone(),
                None => base_cte(state),
            };
            let child_ctx = compile_tree(child, Some(&parent), state)?;
            let cols = select_cols(&parent);
            let name = state.next_cte_name();
            let body = format!(
                "SELECT {cols} FROM {}\nEXCEPT\nSELECT {cols} FROM {}",
                parent.name, child_ctx.name
            );
            state.push_cte(&name, &body);
            Ok(Ctx {
                name,
                has_data_id: parent.has_data_id,
            })
        }
    }
}

fn base_cte(state: &mut QueryState) -> Ctx {
    let name = state.next_cte_name();
    state.push_cte(
        &name,
        "SELECT f.id AS file_id, f.item_id AS item_id \
         FROM index.files f JOIN index.items i ON i.id = f.item_id",
    );
    Ctx {
        name,
        has_data_id: false,
    }
}

fn select_cols(ctx: &Ctx) -> &'static str {
    if ctx.has_data_id {
        "file_id, item_id, data_id"
    } else {
        "file_id, item_id"
    }
}

fn from_clause(ctx: &Ctx) -> String {
    let mut s = format!(
        "{} c JOIN index.items i ON i.id = c.item_id JOIN index.files f ON f.id = c.file_id",
        ctx.name
    );
    if ctx.has_data_id {
        s.push_str(" LEFT JOIN index.extracted_text et ON et.id = c.data_id");
    }
    s
}

/// `FROM`/`JOIN` clause for leaves that resolve against `item_data`. When
/// `ctx` already carries a `data_id` (a prior touching filter narrowed to one
/// row), new predicates thread through that same row rather than re-joining
/// by item — this is the "propagate data_id" behavior.
fn item_data_from_clause(ctx: &Ctx) -> String {
    if ctx.has_data_id {
        format!(
            "{} c JOIN index.item_data id ON id.id = c.data_id \
             JOIN index.setters s ON s.id = id.setter_id",
            ctx.name
        )
    } else {
        format!(
            "{} c JOIN index.item_data id ON id.item_id = c.item_id \
             JOIN index.setters s ON s.id = id.setter_id",
            ctx.name
        )
    }
}

fn compile_leaf(leaf: &LeafFilter, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    match leaf {
        LeafFilter::MatchValues { matches, .. } => compile_match_values(matches, ctx, state),
        LeafFilter::Path { prefixes, .. } => compile_path(prefixes, ctx, state),
        LeafFilter::Mime { prefixes, .. } => compile_mime(prefixes, ctx, state),
        LeafFilter::MinMax {
            column, min, max, ..
        } => compile_minmax(column, *min, *max, ctx, state),
        LeafFilter::Fts { priority, filter } => compile_fts(*priority, filter, ctx, state),
        LeafFilter::PathFts { filter, .. } => compile_path_fts(filter, ctx, state),
        LeafFilter::TagMatch { filter, .. } => compile_tag_match(filter, ctx, state),
        LeafFilter::SimilarTo { priority, similar } => {
            similarity::compile_similar_to(*priority, similar, ctx, state)
        }
        LeafFilter::TextEmbeddingQuery { priority, query } => {
            similarity::compile_text_embedding_query(*priority, query, ctx, state)
        }
        LeafFilter::Bookmark { filter, .. } => compile_bookmark(filter, ctx, state),
    }
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn quote(s: &str) -> String {
    format!("'{}'", escape(s))
}

fn render_scalar(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Text(s) => quote(s),
        ScalarValue::Int(i) => i.to_string(),
        ScalarValue::Float(f) => f.to_string(),
        ScalarValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
    }
}

/// Columns addressable from `MatchValues`/`MinMax`: item and file columns are
/// always reachable; text-level columns only once the context carries a
/// `data_id` joined to `extracted_text`.
fn column_ref(column: &str, ctx: &Ctx) -> EngineResult<String> {
    const ITEM_COLUMNS: &[&str] = &[
        "sha256",
        "md5",
        "mime_type",
        "size",
        "width",
        "height",
        "duration",
        "audio_tracks",
        "video_tracks",
        "subtitle_tracks",
        "time_added",
    ];
    const FILE_COLUMNS: &[&str] = &["path", "filename", "last_modified"];
    const TEXT_COLUMNS: &[&str] = &["text", "language", "confidence", "language_confidence", "text_length"];

    if ITEM_COLUMNS.contains(&column) {
        Ok(format!("i.{column}"))
    } else if FILE_COLUMNS.contains(&column) {
        Ok(format!("f.{column}"))
    } else if ctx.has_data_id && TEXT_COLUMNS.contains(&column) {
        Ok(format!("et.{column}"))
    } else {
        Err(EngineError::validation(format!(
            "unknown or unreachable column '{column}' in filter"
        )))
    }
}

fn compile_match_ops(ops: &MatchOps, ctx: &Ctx) -> EngineResult<String> {
    match ops {
        MatchOps::Op { column, op, value } => {
            let col = column_ref(column, ctx)?;
            let rendered = render_scalar(value);
            Ok(match op {
                MatchOp::Eq => format!("{col} = {rendered}"),
                MatchOp::Neq => format!("{col} != {rendered}"),
                MatchOp::Gt => format!("{col} > {rendered}"),
                MatchOp::Gte => format!("{col} >= {rendered}"),
                MatchOp::Lt => format!("{col} < {rendered}"),
                MatchOp::Lte => format!("{col} <= {rendered}"),
                MatchOp::StartsWith => format!("{col} LIKE {}", like_prefix(value)),
                MatchOp::NotStartsWith => format!("{col} NOT LIKE {}", like_prefix(value)),
                MatchOp::EndsWith => format!("{col} LIKE {}", like_suffix(value)),
                MatchOp::NotEndsWith => format!("{col} NOT LIKE {}", like_suffix(value)),
                MatchOp::Contains => format!("{col} LIKE {}", like_contains(value)),
                MatchOp::NotContains => format!("{col} NOT LIKE {}", like_contains(value)),
            })
        }
        MatchOps::In { column, values } => {
            let col = column_ref(column, ctx)?;
            let list = values.iter().map(render_scalar).collect::<Vec<_>>().join(", ");
            Ok(format!("{col} IN ({list})"))
        }
        MatchOps::NotIn { column, values } => {
            let col = column_ref(column, ctx)?;
            let list = values.iter().map(render_scalar).collect::<Vec<_>>().join(", ");
            Ok(format!("{col} NOT IN ({list})"))
        }
        MatchOps::And(children) => {
            let parts = children
                .iter()
                .map(|c| compile_match_ops(c, ctx))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        MatchOps::Or(children) => {
            let parts = children
                .iter()
                .map(|c| compile_match_ops(c, ctx))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        MatchOps::Not(inner) => Ok(format!("NOT ({})", compile_match_ops(inner, ctx)?)),
    }
}

fn like_prefix(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Text(s) => quote(&format!("{}%", escape(s))),
        other => render_scalar(other),
    }
}

fn like_suffix(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Text(s) => quote(&format!("%{}", escape(s))),
        other => render_scalar(other),
    }
}

fn like_contains(value: &ScalarValue) -> String {
    match value {
        ScalarValue::Text(s) => quote(&format!("%{}%", escape(s))),
        other => render_scalar(other),
    }
}

fn compile_match_values(matches: &MatchOps, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let predicate = compile_match_ops(matches, ctx)?;
    let name = state.next_cte_name();
    let body = format!(
        "SELECT {} FROM {} WHERE {predicate}",
        select_cols(ctx),
        from_clause(ctx)
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_path(prefixes: &[String], ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let predicate = prefixes
        .iter()
        .map(|p| format!("f.path LIKE {}", quote(&format!("{}%", escape(p)))))
        .collect::<Vec<_>>()
        .join(" OR ");
    let name = state.next_cte_name();
    let body = format!(
        "SELECT {} FROM {} WHERE {predicate}",
        select_cols(ctx),
        from_clause(ctx)
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_mime(prefixes: &[String], ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let predicate = prefixes
        .iter()
        .map(|p| format!("i.mime_type LIKE {}", quote(&format!("{}%", escape(p)))))
        .collect::<Vec<_>>()
        .join(" OR ");
    let name = state.next_cte_name();
    let body = format!(
        "SELECT {} FROM {} WHERE {predicate}",
        select_cols(ctx),
        from_clause(ctx)
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_minmax(
    column: &str,
    min: f64,
    max: f64,
    ctx: &Ctx,
    state: &mut QueryState,
) -> EngineResult<Ctx> {
    ValidatedMinMaxColumn::new(column).map_err(|e| EngineError::validation(e.to_string()))?;
    let col = column_ref(column, ctx)?;
    // min != 0 && max == 0 means "at least min, no upper bound".
    let predicate = if min != 0.0 && max == 0.0 {
        format!("{col} >= {min}")
    } else {
        format!("{col} BETWEEN {min} AND {max}")
    };
    let name = state.next_cte_name();
    let body = format!(
        "SELECT {} FROM {} WHERE {predicate}",
        select_cols(ctx),
        from_clause(ctx)
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_fts(priority: i32, filter: &FtsFilter, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    state.item_data_query = true;
    let mut clauses = vec![format!(
        "et.rowid IN (SELECT rowid FROM index.extracted_text_fts WHERE extracted_text_fts MATCH {})",
        quote(&filter.text)
    )];
    if let Some(setters) = &filter.source_setters {
        let list = setters.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
        clauses.push(format!("s.name IN ({list})"));
    }
    if let Some(languages) = &filter.languages {
        let list = languages.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
        clauses.push(format!("et.language IN ({list})"));
    }

    let name = state.next_cte_name();
    let body = format!(
        "SELECT c.file_id AS file_id, c.item_id AS item_id, et.id AS data_id \
         FROM {} \
         JOIN index.extracted_text et ON et.id = id.id \
         WHERE {}",
        item_data_from_clause(ctx),
        clauses.join(" AND ")
    );
    state.push_cte(&name, &body);

    if !state.is_count_query {
        // Ascending: FTS doesn't rank here, but a rank column keeps the
        // combinator uniform with the similarity leaves; default direction
        // is asc for non-`last_modified` columns.
        let _ = priority;
    }
    Ok(Ctx {
        name,
        has_data_id: true,
    })
}

fn compile_path_fts(filter: &PathFtsFilter, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let column = if filter.only_filename { "filename" } else { "path" };
    let name = state.next_cte_name();
    let body = format!(
        "SELECT c.file_id AS file_id, c.item_id AS item_id{} \
         FROM {} c \
         JOIN index.files_fts ffts ON ffts.rowid = c.file_id \
         WHERE ffts.{column} MATCH {}",
        if ctx.has_data_id { ", c.data_id AS data_id" } else { "" },
        ctx.name,
        quote(&filter.query)
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_tag_match(filter: &TagMatchFilter, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let tag_list = filter
        .tags
        .iter()
        .map(|t| quote(t))
        .collect::<Vec<_>>()
        .join(", ");
    let mut clauses = vec![format!("t.name IN ({tag_list})")];
    if let Some(ns) = &filter.namespace {
        clauses.push(format!("t.namespace = {}", quote(ns)));
    }
    if let Some(setters) = &filter.setters {
        let list = setters.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
        clauses.push(format!("s.name IN ({list})"));
    }
    if let Some(min_conf) = filter.min_confidence {
        clauses.push(format!("ti.confidence >= {min_conf}"));
    }

    let having = if filter.match_all {
        format!("HAVING COUNT(DISTINCT t.name) = {}", filter.tags.len())
    } else {
        String::new()
    };

    let name = state.next_cte_name();
    let body = format!(
        "SELECT c.file_id AS file_id, c.item_id AS item_id{} \
         FROM {} c \
         JOIN index.tags_items ti ON ti.item_id = c.item_id \
         JOIN index.tags t ON t.id = ti.tag_id \
         JOIN index.setters s ON s.id = ti.setter_id \
         WHERE {} \
         GROUP BY c.file_id, c.item_id{} \
         {having}",
        if ctx.has_data_id { ", c.data_id AS data_id" } else { "" },
        ctx.name,
        clauses.join(" AND "),
        if ctx.has_data_id { ", c.data_id" } else { "" },
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

fn compile_bookmark(filter: &BookmarkFilter, ctx: &Ctx, state: &mut QueryState) -> EngineResult<Ctx> {
    let mut clauses = vec!["b.sha256 = i.sha256".to_string()];
    if let Some(ns) = &filter.namespace {
        clauses.push(format!("b.namespace = {}", quote(ns)));
    }
    if let Some(user) = &filter.user {
        clauses.push(format!("b.user = {}", quote(user)));
    }
    let name = state.next_cte_name();
    let body = format!(
        "SELECT {} FROM {} JOIN user_data.bookmarks b ON {}",
        select_cols(ctx),
        from_clause(ctx),
        clauses.join(" AND ")
    );
    state.push_cte(&name, &body);
    Ok(Ctx {
        name,
        has_data_id: ctx.has_data_id,
    })
}

/// Register a sortable leaf's rank column so [`build_order_by`] can merge it
/// with explicit [`OrderArgs`]. Used by the similarity planner, which knows
/// the `order_rank` column name it projected.
pub(crate) fn register_rank_column(
    state: &mut QueryState,
    priority: i32,
    cte: &str,
    column: &str,
    direction: OrderDirection,
) {
    if state.is_count_query {
        return;
    }
    state.rank_columns.push(RankColumn {
        priority,
        cte: cte.to_string(),
        column: column.to_string(),
        direction,
    });
}

/// Default sort direction for a plain column: `last_modified`
/// descends, everything else ascends.
fn default_direction(column: &str) -> OrderDirection {
    if column == "last_modified" {
        OrderDirection::Desc
    } else {
        OrderDirection::Asc
    }
}

/// Merge sortable-leaf rank columns with explicit [`OrderArgs`] by descending
/// priority; equal-priority `OrderByFilter`s are coalesced with
/// `MIN(COALESCE(col, +inf))`/`MAX(COALESCE(col, -inf))` depending on
/// direction, tolerating rows where the rank's owning CTE wasn't joined via a
/// `LEFT JOIN` (missing ranks are tolerated).
fn build_order_by(order_args: &[OrderArgs], state: &QueryState, root: &Ctx) -> String {
    #[derive(Clone)]
    enum Entry {
        Rank(RankColumn),
        Explicit { column: String, direction: OrderDirection },
    }

    let mut entries: Vec<(i32, Entry)> = Vec::new();
    for rank in &state.rank_columns {
        entries.push((rank.priority, Entry::Rank(rank.clone())));
    }
    for arg in order_args {
        entries.push((
            arg.priority,
            Entry::Explicit {
                column: arg.order_by.clone(),
                direction: arg.order,
            },
        ));
    }
    if entries.is_empty() {
        return format!("ORDER BY {}", default_order_expr(root));
    }

    // Stable sort descending by priority; ranks precede args at equal
    // priority (insertion order above already reflects that).
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut clauses = Vec::new();
    let mut i = 0;
    while i < entries.len() {
        let priority = entries[i].0;
        let mut group_ranks = Vec::new();
        let mut j = i;
        while j < entries.len() && entries[j].0 == priority {
            if let Entry::Rank(r) = &entries[j].1 {
                group_ranks.push(r.clone());
            }
            j += 1;
        }
        if group_ranks.len() > 1 {
            let direction = group_ranks[0].direction;
            let coalesced = group_ranks
                .iter()
                .map(|r| {
                    let sentinel = match direction {
                        OrderDirection::Desc => "-1e308",
                        _ => "1e308",
                    };
                    format!("COALESCE({}.{}, {sentinel})", r.cte, r.column)
                })
                .collect::<Vec<_>>()
                .join(", ");
            let agg = if direction == OrderDirection::Desc { "MAX" } else { "MIN" };
            clauses.push(format!(
                "{agg}({coalesced}) {}",
                sql_direction(direction)
            ));
            i = j;
            continue;
        }
        // Mixed or singleton group: emit each entry in the equal-priority
        // group individually, ranks first.
        for (_, entry) in &entries[i..j] {
            match entry {
                Entry::Rank(r) => clauses.push(format!(
                    "{}.{} {}",
                    r.cte,
                    r.column,
                    sql_direction(r.direction)
                )),
                Entry::Explicit { column, direction } => {
                    let dir = if *direction == OrderDirection::Default {
                        default_direction(column)
                    } else {
                        *direction
                    };
                    clauses.push(format!("{column} {}", sql_direction(dir)));
                }
            }
        }
        i = j;
    }

    format!("ORDER BY {}", clauses.join(", "))
}

fn sql_direction(direction: OrderDirection) -> &'static str {
    match direction {
        OrderDirection::Desc => "DESC",
        _ => "ASC",
    }
}

fn default_order_expr(root: &Ctx) -> String {
    let _ = root;
    "i.time_added DESC".to_string()
}
