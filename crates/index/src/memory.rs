use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::ChunkStore;
use crate::chunk::{Chunk, ChunkFilter, ScoredChunk};
use crate::embeddings::{Embedder, cosine_similarity};

struct Entry {
    chunk: Arc<Chunk>,
    vector: Vec<f32>,
}

/// Brute-force cosine store held in memory.
///
/// Ties are broken by insertion order so results are reproducible for a
/// fixed corpus.
pub struct MemoryStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<Entry>>,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Embed and add a chunk. Re-inserting an existing id is a no-op.
    pub async fn insert(&self, chunk: Chunk) -> Result<()> {
        let vector = self.embedder.embed(&chunk.text).await?;
        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.chunk.id == chunk.id) {
            return Ok(());
        }
        entries.push(Entry {
            chunk: Arc::new(chunk),
            vector,
        });
        Ok(())
    }

    pub async fn insert_all(&self, chunks: impl IntoIterator<Item = Chunk>) -> Result<()> {
        for chunk in chunks {
            self.insert(chunk).await?;
        }
        debug!(total = self.len().await, "Memory store loaded");
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let entries = self.entries.read().await;

        let mut scored: Vec<(usize, ScoredChunk)> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| filter.map_or(true, |f| f.matches(&e.chunk)))
            .map(|(i, e)| {
                (
                    i,
                    ScoredChunk {
                        chunk: Arc::clone(&e.chunk),
                        score: cosine_similarity(query_embedding, &e.vector),
                    },
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        debug!(k, candidates = scored.len(), "Memory search finished");
        Ok(scored.into_iter().take(k).map(|(_, s)| s).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;

    async fn store() -> MemoryStore {
        let store = MemoryStore::new(Arc::new(HashingEmbedder::default()));
        store
            .insert_all(vec![
                Chunk::new("The CuO device endured 50 cycles.", "1.pdf", Some(2)),
                Chunk::new("Graphene was grown by chemical vapour deposition.", "2.pdf", Some(1)),
                Chunk::new("CuO thin films were annealed at 400 C.", "2.pdf", Some(4)),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_ranks_by_similarity() {
        let store = store().await;
        let q = store.embed("CuO endurance cycles").await.unwrap();
        let hits = store.search(&q, 2, None).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits[0].chunk.text.contains("50 cycles"));
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_search_applies_filter() {
        let store = store().await;
        let q = store.embed("CuO").await.unwrap();
        let filter = ChunkFilter::by_source("2.pdf");
        let hits = store.search(&q, 10, Some(&filter)).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.chunk.source_file == "2.pdf"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let store = store().await;
        store
            .insert(Chunk::new("The CuO device endured 50 cycles.", "1.pdf", Some(2)))
            .await
            .unwrap();
        assert_eq!(store.len().await, 3);
    }
}
