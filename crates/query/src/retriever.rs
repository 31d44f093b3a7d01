use async_trait::async_trait;
use index::{ChunkFilter, ChunkStore, ScoredChunk};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("chunk store error: {0}")]
    Store(String),
    #[error("strategy '{strategy}' timed out after {timeout_ms} ms")]
    Timeout { strategy: String, timeout_ms: u64 },
    #[error("all retrieval strategies failed: {0}")]
    AllStrategiesFailed(String),
    #[error("retrieval cancelled")]
    Cancelled,
}

/// Ranked chunks from one strategy (or from the aggregator), best first.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub strategy: String,
    #[serde(serialize_with = "serialize_hits")]
    pub hits: Vec<ScoredChunk>,
}

fn serialize_hits<S: serde::Serializer>(hits: &[ScoredChunk], s: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = s.serialize_seq(Some(hits.len()))?;
    for hit in hits {
        seq.serialize_element(&serde_json::json!({
            "chunk_id": hit.chunk.id,
            "source": hit.chunk.source_file,
            "score": hit.score,
        }))?;
    }
    seq.end()
}

impl RetrievalResult {
    pub fn new(strategy: impl Into<String>, hits: Vec<ScoredChunk>) -> Self {
        Self { strategy: strategy.into(), hits }
    }

    pub fn empty(strategy: impl Into<String>) -> Self {
        Self::new(strategy, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.chunk.id.as_str()).collect()
    }
}

/// A read-only ranking strategy over the chunk store.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<RetrievalResult, RetrievalError>;
}

/// Embed `text` and run one nearest-neighbour search.
pub(crate) async fn search_text(
    store: &dyn ChunkStore,
    text: &str,
    k: usize,
    filter: Option<&ChunkFilter>,
) -> Result<Vec<ScoredChunk>, RetrievalError> {
    let embedding = store
        .embed(text)
        .await
        .map_err(|e| RetrievalError::Store(format!("{:#}", e)))?;
    store
        .search(&embedding, k, filter)
        .await
        .map_err(|e| RetrievalError::Store(format!("{:#}", e)))
}

/// Plain similarity search.
pub struct VectorRetriever {
    store: Arc<dyn ChunkStore>,
}

impl VectorRetriever {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn name(&self) -> &str {
        "vector"
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let hits = search_text(self.store.as_ref(), query, k, filter).await?;
        Ok(RetrievalResult::new(self.name(), hits))
    }
}
