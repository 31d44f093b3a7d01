use index::ScoredChunk;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::retriever::RetrievalResult;

/// Upper bounds on the context handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudget {
    pub max_chunks: usize,
    /// Estimated tokens (1.3 per word) across all kept chunks.
    pub max_tokens: Option<usize>,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_chunks: 7,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeightedResult {
    pub weight: f32,
    pub result: RetrievalResult,
}

struct Candidate {
    hit: ScoredChunk,
    fused: f32,
    first_seen: (usize, usize),
}

/// Merge strategy outputs into one ranked, budgeted context set.
///
/// Each strategy's scores are divided by its maximum, then summed with the
/// strategy weight. Ties go to the chunk seen earliest: lower strategy index,
/// then lower rank within it. Chunks that would overflow the token budget are
/// skipped; smaller ones further down may still fit.
pub fn aggregate(results: &[WeightedResult], budget: &ContextBudget) -> RetrievalResult {
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    for (strategy_idx, weighted) in results.iter().enumerate() {
        let max = weighted
            .result
            .hits
            .iter()
            .map(|h| h.score)
            .fold(f32::NEG_INFINITY, f32::max);

        let mut seen_here = HashSet::new();
        for (rank, hit) in weighted.result.hits.iter().enumerate() {
            if !seen_here.insert(hit.chunk.id.as_str()) {
                continue;
            }
            let normalized = if max > 0.0 && hit.score.is_finite() {
                (hit.score / max).max(0.0)
            } else {
                0.0
            };
            let contribution = weighted.weight * normalized;

            candidates
                .entry(hit.chunk.id.clone())
                .and_modify(|c| c.fused += contribution)
                .or_insert_with(|| Candidate {
                    hit: hit.clone(),
                    fused: contribution,
                    first_seen: (strategy_idx, rank),
                });
        }
    }

    let mut ranked: Vec<Candidate> = candidates.into_values().collect();
    ranked.sort_by(|a, b| {
        b.fused
            .total_cmp(&a.fused)
            .then(a.first_seen.cmp(&b.first_seen))
    });

    let mut hits = Vec::with_capacity(budget.max_chunks.min(ranked.len()));
    let mut tokens_used = 0usize;
    for candidate in ranked {
        if hits.len() >= budget.max_chunks {
            break;
        }
        let tokens = candidate.hit.chunk.estimated_tokens();
        if let Some(limit) = budget.max_tokens {
            if tokens_used + tokens > limit {
                continue;
            }
        }
        tokens_used += tokens;
        hits.push(ScoredChunk {
            chunk: candidate.hit.chunk,
            score: candidate.fused,
        });
    }

    RetrievalResult::new("ensemble", hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::Chunk;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn hit(text: &str, score: f32) -> ScoredChunk {
        ScoredChunk { chunk: Arc::new(Chunk::new(text, "doc.pdf", None)), score }
    }

    fn weighted(name: &str, weight: f32, hits: Vec<ScoredChunk>) -> WeightedResult {
        WeightedResult { weight, result: RetrievalResult::new(name, hits) }
    }

    #[test]
    fn test_weighted_sum_and_dedup() {
        let results = vec![
            weighted("a", 0.5, vec![hit("x", 0.9), hit("y", 0.45)]),
            weighted("b", 0.5, vec![hit("y", 2.0), hit("z", 1.0)]),
        ];
        let merged = aggregate(&results, &ContextBudget::default());
        let texts: Vec<&str> = merged.hits.iter().map(|h| h.chunk.text.as_str()).collect();
        // y: 0.5*0.5 + 0.5*1.0 = 0.75 ; x: 0.5 ; z: 0.25
        assert_eq!(texts, ["y", "x", "z"]);
        assert!((merged.hits[0].score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_ties_follow_first_strategy_order() {
        let results = vec![
            weighted("a", 1.0, vec![hit("p", 1.0), hit("q", 1.0)]),
            weighted("b", 1.0, vec![hit("r", 1.0)]),
        ];
        let merged = aggregate(&results, &ContextBudget::default());
        let texts: Vec<&str> = merged.hits.iter().map(|h| h.chunk.text.as_str()).collect();
        assert_eq!(texts, ["p", "q", "r"]);
    }

    #[test]
    fn test_token_budget_skips_and_continues() {
        let long = "word ".repeat(100);
        let results = vec![weighted("a", 1.0, vec![hit(&long, 1.0), hit("short text", 0.5)])];
        let budget = ContextBudget { max_chunks: 5, max_tokens: Some(10) };
        let merged = aggregate(&results, &budget);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.hits[0].chunk.text, "short text");
    }

    #[test]
    fn test_empty_inputs() {
        assert!(aggregate(&[], &ContextBudget::default()).is_empty());
        let zero = ContextBudget { max_chunks: 0, max_tokens: None };
        assert!(aggregate(&[weighted("a", 1.0, vec![hit("x", 1.0)])], &zero).is_empty());
    }

    fn arb_results() -> impl Strategy<Value = Vec<WeightedResult>> {
        let arb_hit = (0usize..12, 1usize..40, -1.0f32..1.0).prop_map(|(id, words, score)| {
            // Same id always maps to the same text, so duplicates are real duplicates
            let text = format!("chunk{} {}", id, "w ".repeat(words + id));
            hit(&text, score)
        });
        let strategy = (0.0f32..2.0, prop::collection::vec(arb_hit, 0..15))
            .prop_map(|(w, hits)| weighted("s", w, hits));
        prop::collection::vec(strategy, 0..4)
    }

    proptest! {
        #[test]
        fn prop_output_respects_budget(
            results in arb_results(),
            max_chunks in 0usize..10,
            max_tokens in prop::option::of(0usize..200),
        ) {
            let budget = ContextBudget { max_chunks, max_tokens };
            let merged = aggregate(&results, &budget);

            prop_assert!(merged.len() <= max_chunks);
            if let Some(limit) = max_tokens {
                let used: usize = merged.hits.iter().map(|h| h.chunk.estimated_tokens()).sum();
                prop_assert!(used <= limit);
            }
        }

        #[test]
        fn prop_output_is_deduplicated(results in arb_results()) {
            let merged = aggregate(&results, &ContextBudget { max_chunks: 100, max_tokens: None });
            let ids: HashSet<&str> = merged.chunk_ids().into_iter().collect();
            prop_assert_eq!(ids.len(), merged.len());

            let input: HashSet<&str> = results
                .iter()
                .flat_map(|r| r.result.chunk_ids())
                .collect();
            prop_assert_eq!(ids, input);
        }
    }
}
