//! Similarity Planner (C9): compiles `SimilarTo` and `TextEmbeddingQuery`
//! leaves into a distance CTE.
//!
//! `SimilarTo` builds a single pool of candidate embeddings (the current
//! context's items, restricted to the relevant setter(s)) and self-joins it
//! against itself: `main` pinned to the target item's sha256, `other` to
//! every other item in the pool. Cross-modal search
//! (`clip_xmodal`/`xmodal_t2t`/`xmodal_i2i`) unions a second, image-setter
//! branch into the pool and then gates which `(main, other)` data-type pairs
//! are allowed to contribute a distance, rather than searching each setter
//! independently. `TextEmbeddingQuery` has no target *item* — its target is
//! a literal embedding blob — so it compares that literal directly against
//! the pool with no self-join and no target-exclusion clause.
//!
//! Both leaves aggregate multiple source embeddings per candidate item
//! either by plain `MIN`/`MAX`/`AVG` or, when `SourceTextArgs` supplies
//! nonzero weights, a confidence/language-confidence-weighted average.

use crate::error::EngineResult;
use crate::pql::ast::{
    DistanceAggregation, DistanceFunction, OrderDirection, SimilarTo, SourceTextArgs,
    TextEmbeddingQuery,
};
use crate::pql::compiler::{register_rank_column, Ctx, QueryState};

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn quote(s: &str) -> String {
    format!("'{}'", escape(s))
}

fn distance_fn_name(f: DistanceFunction) -> &'static str {
    match f {
        DistanceFunction::L2 => "vec_distance_L2",
        DistanceFunction::Cosine => "vec_distance_cosine",
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

fn blob_literal(bytes: &[u8]) -> String {
    format!("X'{}'", hex_encode(bytes))
}

fn paired_text_setter(setter_name: &str) -> String {
    format!("t{setter_name}")
}

/// One branch of the candidate-embeddings pool: every embedding from
/// `setter_name` produced for an item in `ctx`, carrying its item/file id,
/// sha256, data type, and (when `src_text` is given) the confidence/
/// language-confidence of the text it was derived from. Branches are
/// unioned with `UNION ALL`, so every branch projects the same columns —
/// a branch with no `src_text` still projects `confidence`/
/// `language_confidence`, as `NULL`.
fn pool_branch_sql(ctx: &Ctx, setter_name: &str, src_text: Option<&SourceTextArgs>) -> String {
    let mut clauses = vec![format!("s.name = {}", quote(setter_name))];
    let mut joins = String::new();
    let mut conf_col = "NULL".to_string();
    let mut lang_col = "NULL".to_string();
    if let Some(src) = src_text {
        joins.push_str(
            " JOIN index.item_data sid ON sid.id = id.source_id \
             JOIN index.extracted_text et ON et.id = sid.id \
             JOIN index.setters ts ON ts.id = sid.setter_id",
        );
        conf_col = "et.confidence".to_string();
        lang_col = "et.language_confidence".to_string();
        if let Some(setters) = &src.setter_names {
            let list = setters.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
            clauses.push(format!("ts.name IN ({list})"));
        }
        if let Some(languages) = &src.languages {
            let list = languages.iter().map(|s| quote(s)).collect::<Vec<_>>().join(", ");
            clauses.push(format!("et.language IN ({list})"));
        }
        if let Some(min_conf) = src.min_confidence {
            clauses.push(format!("et.confidence >= {min_conf}"));
        }
        if let Some(min_lang_conf) = src.min_language_confidence {
            clauses.push(format!("et.language_confidence >= {min_lang_conf}"));
        }
        if let Some(min_len) = src.min_length {
            clauses.push(format!("et.text_length >= {min_len}"));
        }
    }
    format!(
        "SELECT c.item_id AS item_id, c.file_id AS file_id, i.sha256 AS sha256, \
         id.id AS emb_id, id.data_type AS data_type, e.embedding AS embedding, \
         {conf_col} AS confidence, {lang_col} AS language_confidence \
         FROM {} c \
         JOIN index.items i ON i.id = c.item_id \
         JOIN index.item_data id ON id.item_id = c.item_id \
         JOIN index.embeddings e ON e.id = id.id \
         JOIN index.setters s ON s.id = id.setter_id{joins} \
         WHERE {}",
        ctx.name,
        clauses.join(" AND ")
    )
}

pub(crate) fn compile_similar_to(
    priority: i32,
    similar: &SimilarTo,
    ctx: &Ctx,
    state: &mut QueryState,
) -> EngineResult<Ctx> {
    state.item_data_query = true;
    let setter = &similar.setter_name;

    // When cross-modal, the primary branch is the *text*-embedding setter
    // (so the target's text embedding, derived from e.g. OCR output, is in
    // the pool too) and a second branch adds the image/CLIP setter. Source
    // text filters only ever apply to the text-embedding branch — an image
    // embedding has no source text to filter on.
    let mut branches = if similar.clip_xmodal {
        vec![
            pool_branch_sql(ctx, &paired_text_setter(setter), similar.src_text.as_ref()),
            pool_branch_sql(ctx, setter, None),
        ]
    } else {
        vec![pool_branch_sql(ctx, setter, similar.src_text.as_ref())]
    };
    // A single-branch pool only needs one SELECT; `UNION ALL` is skipped so
    // the SQL doesn't carry a redundant no-op union.
    let pool_name = state.next_cte_name();
    if branches.len() == 1 {
        state.push_cte(&pool_name, &branches.pop().unwrap());
    } else {
        state.push_cte(&pool_name, &branches.join("\nUNION ALL\n"));
    }

    build_self_join_distance_cte(
        priority,
        &pool_name,
        &similar.target_sha256,
        similar.distance_function,
        similar.distance_aggregation,
        similar.src_text.as_ref(),
        similar.clip_xmodal,
        similar.xmodal_t2t,
        similar.xmodal_i2i,
        state,
    )
}

/// Self-joins the pool CTE against itself to find, for every item other
/// than the target, the aggregated distance between the target's
/// embedding(s) and that item's embedding(s). The target item itself is
/// excluded via `other.sha256 != target` — a `SimilarTo` search never
/// returns its own target.
#[allow(clippy::too_many_arguments)]
fn build_self_join_distance_cte(
    priority: i32,
    pool_name: &str,
    target_sha256: &str,
    distance_function: DistanceFunction,
    aggregation: DistanceAggregation,
    src_text: Option<&SourceTextArgs>,
    clip_xmodal: bool,
    xmodal_t2t: bool,
    xmodal_i2i: bool,
    state: &mut QueryState,
) -> EngineResult<Ctx> {
    let dist_fn = distance_fn_name(distance_function);
    let target = quote(target_sha256);

    let mut clauses = vec![
        format!("main.sha256 = {target}"),
        format!("other.sha256 != {target}"),
    ];
    if clip_xmodal {
        // Gate which (main, other) data-type pairs may contribute a
        // distance. Cross-modal (image-to-text / text-to-image) pairs are
        // always allowed; same-modality pairs are gated individually so
        // i2i can be excluded without also excluding t2t, and vice versa.
        if !xmodal_i2i {
            clauses.push("NOT (main.data_type = 'clip' AND other.data_type = 'clip')".to_string());
        }
        if !xmodal_t2t {
            clauses.push(
                "NOT (main.data_type = 'text-embedding' AND other.data_type = 'text-embedding')"
                    .to_string(),
            );
        }
    }

    let raw_name = state.next_cte_name();
    let raw_body = format!(
        "SELECT other.file_id AS file_id, other.item_id AS item_id, other.emb_id AS data_id, \
         {dist_fn}(main.embedding, other.embedding) AS distance, \
         main.confidence AS main_confidence, other.confidence AS other_confidence, \
         main.language_confidence AS main_language_confidence, \
         other.language_confidence AS other_language_confidence \
         FROM {pool_name} main \
         JOIN {pool_name} other \
         WHERE {}",
        clauses.join(" AND ")
    );
    state.push_cte(&raw_name, &raw_body);

    let weighted = src_text
        .map(|s| s.confidence_weight != 0.0 || s.language_confidence_weight != 0.0)
        .unwrap_or(false);

    let agg_expr = if weighted {
        // w = POW(main_confidence * other_confidence, alpha)
        //     * POW(main_language_confidence * other_language_confidence, beta);
        // result = SUM(d*w)/SUM(w). Pairwise across the self-join, matching
        // the original's main/other confidence product exactly (see
        // DESIGN.md — this was a one-sided approximation before the
        // self-join rework; the self-join now carries both sides).
        let src = src_text.expect("weighted implies src_text present");
        let cw = src.confidence_weight;
        let lw = src.language_confidence_weight;
        let weight = format!(
            "(POW(COALESCE(main_confidence, 1) * COALESCE(other_confidence, 1), {cw}) \
             * POW(COALESCE(main_language_confidence, 1) * COALESCE(other_language_confidence, 1), {lw}))"
        );
        format!("SUM(distance * {weight}) / SUM({weight})")
    } else {
        match aggregation {
            DistanceAggregation::Min => "MIN(distance)".to_string(),
            DistanceAggregation::Max => "MAX(distance)".to_string(),
            DistanceAggregation::Avg => "AVG(distance)".to_string(),
        }
    };

    let name = state.next_cte_name();
    let body = format!(
        "SELECT file_id, item_id, MIN(data_id) AS data_id, {agg_expr} AS agg_distance \
         FROM {raw_name} \
         GROUP BY file_id, item_id"
    );
    state.push_cte(&name, &body);

    // Smaller distance is a closer match for both L2 and cosine distance.
    register_rank_column(state, priority, &name, "agg_distance", OrderDirection::Asc);

    Ok(Ctx {
        name,
        has_data_id: true,
    })
}

pub(crate) fn compile_text_embedding_query(
    priority: i32,
    query: &TextEmbeddingQuery,
    ctx: &Ctx,
    state: &mut QueryState,
) -> EngineResult<Ctx> {
    state.item_data_query = true;
    let dist_fn = distance_fn_name(query.distance_function);
    let target_expr = blob_literal(&query.embedding);

    let pool_name = state.next_cte_name();
    state.push_cte(
        &pool_name,
        &pool_branch_sql(ctx, &query.setter_name, query.src_text.as_ref()),
    );

    let raw_name = state.next_cte_name();
    let raw_body = format!(
        "SELECT file_id, item_id, emb_id AS data_id, \
         {dist_fn}(embedding, {target_expr}) AS distance, confidence, language_confidence \
         FROM {pool_name}"
    );
    state.push_cte(&raw_name, &raw_body);

    let weighted = query
        .src_text
        .as_ref()
        .map(|s| s.confidence_weight != 0.0 || s.language_confidence_weight != 0.0)
        .unwrap_or(false);

    let agg_expr = if weighted {
        // There is no "other side" to weight against here — the target is a
        // literal embedding, not a pool row — so only the candidate's own
        // source-text confidence weights the aggregation.
        let src = query.src_text.as_ref().expect("weighted implies src_text present");
        let cw = src.confidence_weight;
        let lw = src.language_confidence_weight;
        let weight = format!(
            "(POW(COALESCE(confidence, 1), {cw}) * POW(COALESCE(language_confidence, 1), {lw}))"
        );
        format!("SUM(distance * {weight}) / SUM({weight})")
    } else {
        match query.distance_aggregation {
            DistanceAggregation::Min => "MIN(distance)".to_string(),
            DistanceAggregation::Max => "MAX(distance)".to_string(),
            DistanceAggregation::Avg => "AVG(distance)".to_string(),
        }
    };

    let name = state.next_cte_name();
    let body = format!(
        "SELECT file_id, item_id, MIN(data_id) AS data_id, {agg_expr} AS agg_distance \
         FROM {raw_name} \
         GROUP BY file_id, item_id"
    );
    state.push_cte(&name, &body);

    register_rank_column(state, priority, &name, "agg_distance", OrderDirection::Asc);

    Ok(Ctx {
        name,
        has_data_id: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pql::ast::{DistanceAggregation, DistanceFunction};

    #[test]
    fn paired_text_setter_prefixes_with_t() {
        assert_eq!(paired_text_setter("clip/vit-b32"), "tclip/vit-b32");
    }

    #[test]
    fn blob_literal_hex_encodes() {
        assert_eq!(blob_literal(&[0xde, 0xad, 0xbe, 0xef]), "X'deadbeef'");
    }

    #[test]
    fn similar_to_without_cross_modal_compiles_single_branch() {
        let mut state = QueryState::new(false);
        let ctx = Ctx {
            name: "f0".to_string(),
            has_data_id: false,
        };
        let similar = SimilarTo {
            target_sha256: "a".repeat(64),
            setter_name: "clip/vit-b32".into(),
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            ..Default::default()
        };
        let result = compile_similar_to(0, &similar, &ctx, &mut state).unwrap();
        assert!(result.has_data_id);
    }

    #[test]
    fn similar_to_excludes_target_item_from_candidates() {
        let mut state = QueryState::new(false);
        let ctx = Ctx {
            name: "f0".to_string(),
            has_data_id: false,
        };
        let similar = SimilarTo {
            target_sha256: "a".repeat(64),
            setter_name: "clip/vit-b32".into(),
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            ..Default::default()
        };
        compile_similar_to(0, &similar, &ctx, &mut state).unwrap();
        let sql = state.ctes_for_test().join("\n");
        assert!(sql.contains("other.sha256 != 'aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa'"));
    }

    #[test]
    fn similar_to_with_cross_modal_adds_branches() {
        let mut state = QueryState::new(false);
        let ctx = Ctx {
            name: "f0".to_string(),
            has_data_id: false,
        };
        let similar = SimilarTo {
            target_sha256: "a".repeat(64),
            setter_name: "clip/vit-b32".into(),
            clip_xmodal: true,
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            ..Default::default()
        };
        compile_similar_to(0, &similar, &ctx, &mut state).unwrap();
        let sql = state.ctes_for_test().join("\n");
        assert!(sql.contains("tclip/vit-b32"));
    }

    #[test]
    fn cross_modal_without_i2i_excludes_clip_to_clip_pairs() {
        let mut state = QueryState::new(false);
        let ctx = Ctx {
            name: "f0".to_string(),
            has_data_id: false,
        };
        let similar = SimilarTo {
            target_sha256: "a".repeat(64),
            setter_name: "clip/vit-b32".into(),
            clip_xmodal: true,
            xmodal_t2t: true,
            xmodal_i2i: false,
            distance_function: DistanceFunction::L2,
            distance_aggregation: DistanceAggregation::Avg,
            ..Default::default()
        };
        compile_similar_to(0, &similar, &ctx, &mut state).unwrap();
        let sql = state.ctes_for_test().join("\n");
        assert!(sql.contains("NOT (main.data_type = 'clip' AND other.data_type = 'clip')"));
        assert!(!sql.contains("text-embedding' AND other.data_type = 'text-embedding'"));
    }
}
