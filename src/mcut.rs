//! Maximum Cut Threshold (MCut) and tag aggregation.
//!
//! Ported from the source's `mcut_threshold`/`aggregate_tags`/`get_rating`
//! trio: given per-sample tag confidences, MCut finds the largest gap between
//! consecutive sorted probabilities and uses its midpoint as a cutoff.

use std::collections::HashMap;

/// `threshold = (p_t + p_{t+1}) / 2` where `t = argmax(p_i - p_{i+1})` over
/// probabilities sorted descending. Returns `0.0` for fewer than two samples
/// (nothing to cut).
pub fn mcut_threshold(probs: &[f64]) -> f64 {
    if probs.len() < 2 {
        return 0.0;
    }
    let mut sorted: Vec<f64> = probs.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());

    let mut best_idx = 0;
    let mut best_gap = f64::MIN;
    for i in 0..sorted.len() - 1 {
        let gap = sorted[i] - sorted[i + 1];
        if gap > best_gap {
            best_gap = gap;
            best_idx = i;
        }
    }
    (sorted[best_idx] + sorted[best_idx + 1]) / 2.0
}

/// One tag observation from a single inference sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TagScore {
    pub namespace: String,
    pub name: String,
    pub confidence: f64,
}

/// Merge scores for the same `(namespace, name)` across multiple samples by
/// taking the max score, then sort the result descending by score.
pub fn combine_max_score(samples: &[Vec<TagScore>]) -> Vec<TagScore> {
    let mut best: HashMap<(String, String), TagScore> = HashMap::new();
    for sample in samples {
        for tag in sample {
            let key = (tag.namespace.clone(), tag.name.clone());
            best.entry(key)
                .and_modify(|existing| {
                    if tag.confidence > existing.confidence {
                        existing.confidence = tag.confidence;
                    }
                })
                .or_insert_with(|| tag.clone());
        }
    }
    let mut combined: Vec<TagScore> = best.into_values().collect();
    combined.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
    combined
}

/// Pick the rating tag with the highest configured severity, breaking ties by
/// score. `severity_order` ranks namespace-local rating names from least to
/// most severe, e.g. `["general", "sensitive", "questionable", "explicit"]`.
pub fn get_rating<'a>(tags: &'a [TagScore], severity_order: &[String]) -> Option<&'a TagScore> {
    let severity = |name: &str| severity_order.iter().position(|s| s == name);
    tags.iter()
        .filter(|t| severity(&t.name).is_some())
        .max_by(|a, b| {
            let sa = severity(&a.name).unwrap();
            let sb = severity(&b.name).unwrap();
            sa.cmp(&sb)
                .then(a.confidence.partial_cmp(&b.confidence).unwrap())
        })
}

/// Group tags by namespace, collapsing the special-cased `rating` namespace
/// down to its single highest-severity tag and combining every other
/// namespace by max score across samples.
pub fn aggregate_tags(
    samples: &[Vec<TagScore>],
    rating_severity_order: &[String],
) -> HashMap<String, Vec<TagScore>> {
    let mut by_namespace: HashMap<String, Vec<Vec<TagScore>>> = HashMap::new();
    for sample in samples {
        let mut grouped: HashMap<String, Vec<TagScore>> = HashMap::new();
        for tag in sample {
            grouped.entry(tag.namespace.clone()).or_default().push(tag.clone());
        }
        for (namespace, tags) in grouped {
            by_namespace.entry(namespace).or_default().push(tags);
        }
    }

    let mut result = HashMap::new();
    for (namespace, per_sample) in by_namespace {
        if namespace == "rating" {
            let combined = combine_max_score(&per_sample);
            if let Some(top) = get_rating(&combined, rating_severity_order) {
                result.insert(namespace, vec![top.clone()]);
            }
        } else {
            result.insert(namespace, combine_max_score(&per_sample));
        }
    }
    result
}

/// Build the two derived tag-text rows written alongside TagItem rows:
/// index 0 is every tag concatenated, index 1 is the MCut-thresholded subset
/// of the `general` namespace plus all non-general tags unconditionally.
pub fn tag_text_rows(aggregated: &HashMap<String, Vec<TagScore>>) -> (String, String) {
    let mut all_tags: Vec<&TagScore> = aggregated.values().flatten().collect();
    all_tags.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.name.cmp(&b.name)));
    let full_text = all_tags
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let general_confidences: Vec<f64> = aggregated
        .get("general")
        .map(|tags| tags.iter().map(|t| t.confidence).collect())
        .unwrap_or_default();
    let threshold = mcut_threshold(&general_confidences);

    let mut thresholded: Vec<&TagScore> = all_tags
        .iter()
        .filter(|t| t.namespace != "general" || t.confidence >= threshold)
        .copied()
        .collect();
    thresholded.sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.name.cmp(&b.name)));
    let thresholded_text = thresholded
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    (full_text, thresholded_text)
}
