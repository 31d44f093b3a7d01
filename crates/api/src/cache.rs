use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use extract::{CompletionRequest, LlmBackend, LlmError};
use index::Embedder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

pub struct Cache {
    embeddings: DashMap<String, Vec<f32>>,
    llm_responses: DashMap<String, String>,
    max_entries: usize,
}

impl Cache {
    pub fn new(max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            embeddings: DashMap::new(),
            llm_responses: DashMap::new(),
            max_entries,
        })
    }

    /// Cache an embedding
    pub fn set_embedding(&self, text: &str, embedding: Vec<f32>) {
        if self.max_entries == 0 {
            return;
        }
        evict_if_full(&self.embeddings, self.max_entries);
        self.embeddings.insert(hash_text(text), embedding);
    }

    pub fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.embeddings.get(&hash_text(text)).map(|r| r.value().clone())
    }

    /// Cache an LLM response, keyed by the whole request
    pub fn set_llm_response(&self, key: &str, response: String) {
        if self.max_entries == 0 {
            return;
        }
        evict_if_full(&self.llm_responses, self.max_entries);
        self.llm_responses.insert(hash_text(key), response);
    }

    pub fn get_llm_response(&self, key: &str) -> Option<String> {
        self.llm_responses.get(&hash_text(key)).map(|r| r.value().clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            embeddings_cached: self.embeddings.len(),
            llm_responses_cached: self.llm_responses.len(),
        }
    }

    pub fn clear(&self) {
        self.embeddings.clear();
        self.llm_responses.clear();
    }
}

// Simple eviction: drop 25% when full
fn evict_if_full<V>(map: &DashMap<String, V>, max_entries: usize) {
    if map.len() < max_entries {
        return;
    }
    let to_remove: Vec<_> = map
        .iter()
        .take((max_entries / 4).max(1))
        .map(|r| r.key().clone())
        .collect();
    for key in to_remove {
        map.remove(&key);
    }
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub embeddings_cached: usize,
    pub llm_responses_cached: usize,
}

/// Query embeddings are recomputed for every strategy and every variant;
/// this keeps one copy per distinct text.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<Cache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<Cache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.get_embedding(text) {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.set_embedding(text, embedding.clone());
        Ok(embedding)
    }
}

/// Memoizes auxiliary completions (metadata derivation, query variants).
/// Not used for extraction, whose retries must see fresh answers.
pub struct CachingBackend {
    inner: Arc<dyn LlmBackend>,
    cache: Arc<Cache>,
}

impl CachingBackend {
    pub fn new(inner: Arc<dyn LlmBackend>, cache: Arc<Cache>) -> Self {
        Self { inner, cache }
    }

    fn key(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        Ok(format!("{}\n{}", self.inner.model_id(), serde_json::to_string(request)?))
    }
}

#[async_trait]
impl LlmBackend for CachingBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let key = self.key(request)?;
        if let Some(hit) = self.cache.get_llm_response(&key) {
            debug!(model = self.inner.model_id(), "LLM cache hit");
            return Ok(hit);
        }
        let response = self.inner.complete(request).await?;
        self.cache.set_llm_response(&key, response.clone());
        Ok(response)
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}
