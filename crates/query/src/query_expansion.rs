use async_trait::async_trait;
use extract::{CompletionRequest, LlmBackend, LlmError, Message};
use futures::future::join_all;
use index::{ChunkFilter, ChunkStore, ScoredChunk};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::retriever::{RetrievalError, RetrievalResult, Retriever, search_text};

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s*").expect("valid list marker regex"));

fn expansion_prompt(n: usize) -> String {
    format!(
        "You are an AI language model assistant. Your task is to generate {} different versions of the given \
user question to retrieve relevant passages from a vector database of research papers. By generating multiple \
perspectives on the question, you help overcome the limitations of distance-based similarity search. \
Return a JSON object {{\"queries\": [ ... ]}} containing only the alternative questions.",
        n
    )
}

/// Read paraphrases from either a JSON answer or a plain one-per-line list.
/// Only the first JSON value is read; remarks after it are ignored.
pub fn parse_variants(text: &str) -> Vec<String> {
    let json_list = text
        .find(['{', '['])
        .and_then(|start| {
            serde_json::Deserializer::from_str(&text[start..])
                .into_iter::<Value>()
                .next()
                .and_then(Result::ok)
        })
        .and_then(|v| match v {
            Value::Array(items) => Some(items),
            Value::Object(mut obj) => match obj.remove("queries") {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            },
            _ => None,
        });

    match json_list {
        Some(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect(),
        None => text
            .lines()
            .map(|line| LIST_MARKER.replace(line, "").trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

/// Searches with the question plus N model-written paraphrases and unions
/// the hits, keeping each chunk's best score.
pub struct QueryExpansionRetriever {
    store: Arc<dyn ChunkStore>,
    llm: Arc<dyn LlmBackend>,
    num_variants: usize,
}

impl QueryExpansionRetriever {
    pub fn new(store: Arc<dyn ChunkStore>, llm: Arc<dyn LlmBackend>, num_variants: usize) -> Self {
        Self { store, llm, num_variants }
    }

    pub async fn expand(&self, query: &str) -> Result<Vec<String>, LlmError> {
        let request = CompletionRequest::new(vec![
            Message::system(expansion_prompt(self.num_variants)),
            Message::user(query),
        ]);
        let text = self.llm.complete(&request).await?;

        let mut variants: Vec<String> = Vec::new();
        for v in parse_variants(&text) {
            if !v.eq_ignore_ascii_case(query) && !variants.contains(&v) {
                variants.push(v);
            }
        }
        variants.truncate(self.num_variants);
        Ok(variants)
    }
}

#[async_trait]
impl Retriever for QueryExpansionRetriever {
    fn name(&self) -> &str {
        "query_expansion"
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let mut queries = vec![query.to_string()];
        match self.expand(query).await {
            Ok(variants) => {
                debug!(count = variants.len(), "Expanded query");
                queries.extend(variants);
            }
            Err(e) => warn!(error = %e, "Query expansion failed, searching with the original query only"),
        }

        let searches = queries
            .iter()
            .map(|q| search_text(self.store.as_ref(), q, k, filter));
        let mut results = join_all(searches).await.into_iter();

        // The original query must succeed; paraphrase failures only shrink recall
        let mut lists = vec![results.next().unwrap_or(Ok(Vec::new()))?];
        for (q, res) in queries.iter().skip(1).zip(results) {
            match res {
                Ok(hits) => lists.push(hits),
                Err(e) => warn!(query = %q, error = %e, "Sub-query search failed"),
            }
        }

        Ok(RetrievalResult::new(self.name(), union_best(lists)))
    }
}

/// Dedup by chunk id keeping the best score; order by score, then first sighting.
fn union_best(lists: Vec<Vec<ScoredChunk>>) -> Vec<ScoredChunk> {
    let mut best: HashMap<String, (usize, ScoredChunk)> = HashMap::new();
    let mut seen = 0usize;
    for hit in lists.into_iter().flatten() {
        match best.get_mut(&hit.chunk.id) {
            Some((_, existing)) => {
                if hit.score > existing.score {
                    existing.score = hit.score;
                }
            }
            None => {
                best.insert(hit.chunk.id.clone(), (seen, hit));
                seen += 1;
            }
        }
    }

    let mut merged: Vec<(usize, ScoredChunk)> = best.into_values().collect();
    merged.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
    merged.into_iter().map(|(_, hit)| hit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::InProcessBackend;
    use index::{Chunk, HashingEmbedder, MemoryStore};
    use std::collections::HashSet;

    async fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new(Arc::new(HashingEmbedder::default()));
        store
            .insert_all(vec![
                Chunk::new("endurance of 50 cycles", "1.pdf", None),
                Chunk::new("retention time of 1000 seconds", "1.pdf", None),
                Chunk::new("top electrode made of silver", "2.pdf", None),
            ])
            .await
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_parse_variants_formats() {
        assert_eq!(parse_variants(r#"{"queries": ["a", " b "]}"#), vec!["a", "b"]);
        assert_eq!(parse_variants(r#"["x"]"#), vec!["x"]);
        assert_eq!(parse_variants("1. first\n- second\n\n3) third"), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_parse_variants_ignores_trailing_remarks() {
        let answer = "Sure:\n{\"queries\": [\"endurance of CuO\", \"CuO cycling\"]}\nHope this helps! {see above}";
        assert_eq!(parse_variants(answer), vec!["endurance of CuO", "CuO cycling"]);
        assert_eq!(parse_variants("[\"a\", \"b\"] (two variants)"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_union_has_no_duplicates() {
        let llm = Arc::new(InProcessBackend::new("expand", |_: &CompletionRequest| -> Result<String, String> {
            Ok(r#"{"queries": ["retention time", "endurance cycles", "endurance cycles"]}"#.to_string())
        }));
        let retriever = QueryExpansionRetriever::new(store().await, llm, 3);
        let result = retriever.retrieve("endurance", 2, None).await.unwrap();

        let ids: HashSet<&str> = result.chunk_ids().into_iter().collect();
        assert_eq!(ids.len(), result.len());
        // Union of several top-2 lists can exceed k
        assert!(result.len() >= 2);
        assert!(result.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_expansion_failure_uses_original_only() {
        let llm = Arc::new(InProcessBackend::new("down", |_: &CompletionRequest| -> Result<String, String> { Err("offline".to_string()) }));
        let retriever = QueryExpansionRetriever::new(store().await, llm, 3);
        let result = retriever.retrieve("endurance cycles", 1, None).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.hits[0].chunk.text, "endurance of 50 cycles");
    }

    #[test]
    fn test_union_keeps_best_score() {
        let chunk = Arc::new(Chunk::new("t", "s", None));
        let merged = union_best(vec![
            vec![ScoredChunk { chunk: Arc::clone(&chunk), score: 0.2 }],
            vec![ScoredChunk { chunk, score: 0.7 }],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].score, 0.7);
    }
}
