pub mod chunk;
pub mod embeddings;
pub mod memory;
pub mod qdrant_index;

pub use chunk::{Chunk, ChunkFilter, ScoredChunk};
pub use embeddings::{Embedder, EmbeddingClient, HashingEmbedder, cosine_similarity};
pub use memory::MemoryStore;
pub use qdrant_index::QdrantStore;

use anyhow::Result;
use async_trait::async_trait;

/// Nearest-neighbour access to the embedded chunk corpus.
///
/// Implementations are read-only from the pipeline's point of view: nothing
/// downstream inserts, updates or deletes chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Reachability check. Stores held in process are always healthy.
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
