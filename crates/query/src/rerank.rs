use async_trait::async_trait;
use index::{ChunkFilter, ChunkStore, ScoredChunk};
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::retriever::{RetrievalError, RetrievalResult, Retriever, search_text};

static TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+(?:\.[0-9]+)?").expect("valid term regex"));

const STOPWORDS: [&str; 24] = [
    "a", "an", "the", "of", "for", "in", "on", "at", "to", "and", "or", "is", "are", "was", "were",
    "what", "which", "how", "with", "by", "from", "this", "that", "device",
];

/// Scores how well `text` answers `query`; higher is better.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, text: &str) -> f32;
}

pub fn terms(text: &str) -> HashSet<String> {
    TERM.find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Query-term coverage with a bonus for adjacent query bigrams found verbatim.
#[derive(Debug, Clone, Default)]
pub struct LexicalScorer;

impl RelevanceScorer for LexicalScorer {
    fn score(&self, query: &str, text: &str) -> f32 {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let doc_terms = terms(text);
        let matched = query_terms.iter().filter(|t| doc_terms.contains(*t)).count();
        let coverage = matched as f32 / query_terms.len() as f32;

        let lowered = text.to_lowercase();
        let words: Vec<&str> = query.split_whitespace().collect();
        let bigrams = words.windows(2).count();
        let phrase_hits = words
            .windows(2)
            .filter(|w| lowered.contains(&format!("{} {}", w[0], w[1]).to_lowercase()))
            .count();
        let phrase = if bigrams == 0 { 0.0 } else { phrase_hits as f32 / bigrams as f32 };

        0.8 * coverage + 0.2 * phrase
    }
}

/// Pulls a broad candidate set and keeps the top-k by scorer relevance.
pub struct RerankRetriever {
    store: Arc<dyn ChunkStore>,
    scorer: Arc<dyn RelevanceScorer>,
    fetch_k: usize,
}

impl RerankRetriever {
    pub fn new(store: Arc<dyn ChunkStore>, fetch_k: usize) -> Self {
        Self::with_scorer(store, Arc::new(LexicalScorer), fetch_k)
    }

    pub fn with_scorer(store: Arc<dyn ChunkStore>, scorer: Arc<dyn RelevanceScorer>, fetch_k: usize) -> Self {
        Self { store, scorer, fetch_k }
    }
}

#[async_trait]
impl Retriever for RerankRetriever {
    fn name(&self) -> &str {
        "rerank"
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let candidates = search_text(self.store.as_ref(), query, self.fetch_k.max(k), filter).await?;
        let fetched = candidates.len();

        let mut rescored: Vec<ScoredChunk> = candidates
            .into_iter()
            .map(|hit| ScoredChunk {
                score: self.scorer.score(query, &hit.chunk.text),
                chunk: hit.chunk,
            })
            .collect();

        // Stable sort keeps vector order among equal relevance
        rescored.sort_by(|a, b| b.score.total_cmp(&a.score));
        rescored.truncate(k);

        debug!(fetched, kept = rescored.len(), "Reranked candidates");
        Ok(RetrievalResult::new(self.name(), rescored))
    }
}
