//! Search Engine Logic
//!
//! Executes a `QueryDescriptor` against one `IndexShard`.
//!
//! 1. **Match**: every `query` item, `partial` prefix and `terms` filter
//!    contributes to (or prunes) a candidate score map.
//! 2. **Expand**: `fuzzy` adds relevance-feedback terms mined from the top
//!    `n_rset` matches; `nearest` rescoring uses only the mined terms.
//! 3. **Shape**: sort, collapse, count facets, paginate.
//!
//! Scores are term-overlap counts; ties break on document id so repeated
//! identical searches return byte-identical orderings.

use std::collections::BTreeMap;

use serde_json::Value;

use super::tokenizer::tokenize_query;
use super::types::{ExpansionParams, FacetValue, Hit, QueryDescriptor, SearchResult};
use crate::error::Result;
use crate::storage::index::IndexShard;

pub fn execute(shard: &IndexShard, q: &QueryDescriptor) -> Result<SearchResult> {
    let scores = match_scores(shard, q);

    let mut hits: Vec<Hit> = scores
        .into_iter()
        .map(|(id, score)| Hit { id, score })
        .collect();

    sort_hits(shard, &mut hits, &q.sort);

    if let Some(collapse_field) = &q.collapse {
        hits = collapse_hits(shard, hits, collapse_field, q.collapse_max.max(1));
    }

    let matched_count = hits.len();
    let hits = hits.into_iter().skip(q.offset).take(q.limit).collect();

    Ok(SearchResult {
        matched_count,
        hits,
    })
}

/// Facet value counts over the full (unpaginated) match set.
pub fn facets(shard: &IndexShard, q: &QueryDescriptor) -> Result<BTreeMap<String, Vec<FacetValue>>> {
    let scores = match_scores(shard, q);
    let mut out = BTreeMap::new();

    for facet_field in &q.facets {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for id in scores.keys() {
            let Some(doc) = shard.get_document(id) else {
                continue;
            };
            let Some(value) = field_value(&doc.content, facet_field) else {
                continue;
            };
            if let Some(repr) = scalar_repr(&value) {
                *counts.entry(repr).or_insert(0) += 1;
            }
        }

        let mut values: Vec<FacetValue> = counts
            .into_iter()
            .map(|(value, termfreq)| FacetValue { value, termfreq })
            .collect();
        values.sort_by(|a, b| b.termfreq.cmp(&a.termfreq).then(a.value.cmp(&b.value)));
        out.insert(facet_field.clone(), values);
    }

    Ok(out)
}

fn match_scores(shard: &IndexShard, q: &QueryDescriptor) -> BTreeMap<String, usize> {
    let mut scores: BTreeMap<String, usize> = BTreeMap::new();

    for item in &q.query {
        score_query_item(shard, item, &mut scores);
    }

    for prefix in &q.partial {
        for id in shard.prefix_postings(&prefix.to_lowercase()) {
            *scores.entry(id).or_insert(0) += 1;
        }
    }

    if !q.terms.is_empty() {
        apply_term_filters(shard, &q.terms, &mut scores);
    }

    if q.is_fuzzy {
        let expansion = expansion_terms(shard, &scores, &q.fuzzy);
        for term in &expansion {
            if let Some(postings) = shard.postings(term) {
                for id in postings {
                    *scores.entry(id.clone()).or_insert(0) += 1;
                }
            }
        }
    }

    if q.is_nearest {
        let expansion = expansion_terms(shard, &scores, &q.nearest);
        let mut neighbours: BTreeMap<String, usize> = BTreeMap::new();
        for term in &expansion {
            if let Some(postings) = shard.postings(term) {
                for id in postings {
                    *neighbours.entry(id.clone()).or_insert(0) += 1;
                }
            }
        }
        return neighbours;
    }

    scores
}

fn score_query_item(shard: &IndexShard, item: &str, scores: &mut BTreeMap<String, usize>) {
    if let Some((field, text)) = item.split_once(':') {
        if !field.is_empty() {
            if field == "_id" {
                // Id terms match the raw identifier, not tokens.
                if shard.get_document(text).is_some() {
                    *scores.entry(text.to_string()).or_insert(0) += 1;
                }
                return;
            }
            let field = field.to_lowercase();
            for token in tokenize_query(text) {
                if let Some(postings) = shard.postings(&format!("{}:{}", field, token)) {
                    for id in postings {
                        *scores.entry(id.clone()).or_insert(0) += 1;
                    }
                }
            }
            return;
        }
    }

    for token in tokenize_query(item) {
        if let Some(postings) = shard.postings(&token) {
            for id in postings {
                *scores.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }
}

/// `terms` entries are required: each one prunes the candidate set. With no
/// prior candidates the first term seeds the set.
fn apply_term_filters(shard: &IndexShard, terms: &[String], scores: &mut BTreeMap<String, usize>) {
    for term in terms {
        let term = term.to_lowercase();
        let postings = shard.postings(&term);
        if scores.is_empty() {
            if let Some(postings) = postings {
                for id in postings {
                    scores.insert(id.clone(), 1);
                }
                continue;
            }
        }
        match postings {
            Some(postings) => scores.retain(|id, _| postings.contains(id)),
            None => scores.clear(),
        }
    }
}

/// Mine expansion terms from the best current matches: frequency-count the
/// terms of the top `n_rset` documents, keep the `n_eset` most frequent
/// candidates and return `n_term` of them.
fn expansion_terms(
    shard: &IndexShard,
    scores: &BTreeMap<String, usize>,
    params: &ExpansionParams,
) -> Vec<String> {
    let mut seeds: Vec<(&String, &usize)> = scores.iter().collect();
    seeds.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

    let mut freq: BTreeMap<String, usize> = BTreeMap::new();
    for (id, _) in seeds.into_iter().take(params.n_rset) {
        for term in shard.document_terms(id) {
            if !params.field.is_empty() {
                let qualified = params
                    .field
                    .iter()
                    .any(|f| term.starts_with(&format!("{}:", f.to_lowercase())));
                if !qualified {
                    continue;
                }
            }
            *freq.entry(term).or_insert(0) += 1;
        }
    }

    let mut candidates: Vec<(String, usize)> = freq.into_iter().collect();
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    candidates.truncate(params.n_eset);
    candidates
        .into_iter()
        .take(params.n_term)
        .map(|(term, _)| term)
        .collect()
}

fn sort_hits(shard: &IndexShard, hits: &mut [Hit], sort: &[String]) {
    hits.sort_by(|a, b| {
        for key in sort {
            let (field, descending) = match key.strip_prefix('-') {
                Some(field) => (field, true),
                None => (key.as_str(), false),
            };
            let ordering = if field == "_id" {
                a.id.cmp(&b.id)
            } else {
                compare_field(shard, &a.id, &b.id, field)
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        b.score.cmp(&a.score).then(a.id.cmp(&b.id))
    });
}

fn compare_field(shard: &IndexShard, a: &str, b: &str, field: &str) -> std::cmp::Ordering {
    let value_a = shard
        .get_document(a)
        .and_then(|doc| field_value(&doc.content, field));
    let value_b = shard
        .get_document(b)
        .and_then(|doc| field_value(&doc.content, field));
    match (value_a, value_b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .unwrap_or(f64::NAN)
            .partial_cmp(&b.as_f64().unwrap_or(f64::NAN))
            .unwrap_or(std::cmp::Ordering::Equal),
        (Some(a), Some(b)) => scalar_repr(&a)
            .unwrap_or_default()
            .cmp(&scalar_repr(&b).unwrap_or_default()),
        // Documents missing the sort field go last.
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn collapse_hits(
    shard: &IndexShard,
    hits: Vec<Hit>,
    collapse_field: &str,
    collapse_max: usize,
) -> Vec<Hit> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    hits.into_iter()
        .filter(|hit| {
            let key = shard
                .get_document(&hit.id)
                .and_then(|doc| field_value(&doc.content, collapse_field))
                .and_then(|value| scalar_repr(&value));
            match key {
                Some(key) => {
                    let count = seen.entry(key).or_insert(0);
                    *count += 1;
                    *count <= collapse_max
                }
                // Documents without the collapse field are not grouped.
                None => true,
            }
        })
        .collect()
}

/// Walk a `a.b.c` dot path into a JSON object.
fn field_value(content: &Value, path: &str) -> Option<Value> {
    let mut current = content;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

fn scalar_repr(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
