use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ChunkStore;
use crate::chunk::{Chunk, ChunkFilter, ScoredChunk};
use crate::embeddings::Embedder;

/// Read-only adapter over a Qdrant collection, spoken to through the REST API.
///
/// Expected payload keys per point: `chunk_id`, `text`, `source`, `page`,
/// `title`, `doi`, `year`.
pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
    embedder: Arc<dyn Embedder>,
    collection_name: String,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: CollectionResult,
}

#[derive(Deserialize)]
struct CollectionResult {
    collections: Vec<Collection>,
}

#[derive(Deserialize)]
struct Collection {
    name: String,
}

impl QdrantStore {
    pub fn new(base_url: String, embedder: Arc<dyn Embedder>, collection_name: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            embedder,
            collection_name,
        }
    }

    fn build_filter(filter: &ChunkFilter) -> Value {
        let mut must = Vec::new();
        if let Some(source) = &filter.source {
            must.push(json!({"key": "source", "match": {"value": source}}));
        }
        if let Some(title) = &filter.title {
            must.push(json!({"key": "title", "match": {"text": title}}));
        }
        if let Some(doi) = &filter.doi {
            must.push(json!({"key": "doi", "match": {"value": doi}}));
        }
        if let Some(year) = filter.year {
            must.push(json!({"key": "year", "match": {"value": year}}));
        }
        json!({ "must": must })
    }

    fn parse_point(point: &Value) -> Result<ScoredChunk> {
        let score = point["score"].as_f64().unwrap_or(0.0) as f32;
        let payload = point["payload"].as_object()
            .context("Missing payload")?;

        let text_field = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let chunk = Chunk {
            id: text_field("chunk_id").context("Point payload without chunk_id")?,
            text: text_field("text").unwrap_or_default(),
            source_file: text_field("source").unwrap_or_else(|| "unknown".to_string()),
            page: payload.get("page").and_then(|v| v.as_u64()).map(|p| p as u32),
            offset: None,
            title: text_field("title"),
            doi: text_field("doi"),
            year: payload.get("year").and_then(|v| v.as_i64()).map(|y| y as i32),
        };

        Ok(ScoredChunk {
            chunk: Arc::new(chunk),
            score,
        })
    }
}

#[async_trait]
impl ChunkStore for QdrantStore {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<Vec<ScoredChunk>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection_name
        );

        let mut body = json!({
            "vector": query_embedding,
            "limit": k,
            "with_payload": true
        });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = Self::build_filter(filter);
        }

        let response = self.client.post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send search request to Qdrant")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Qdrant search failed: {}", error_text);
        }

        let result: Value = response.json().await
            .context("Failed to parse Qdrant response")?;

        let points = result["result"].as_array()
            .context("Invalid Qdrant response format")?;

        let hits: Vec<ScoredChunk> = points
            .iter()
            .filter_map(|point| match Self::parse_point(point) {
                Ok(hit) => Some(hit),
                Err(e) => {
                    warn!(error = %e, collection = %self.collection_name, "Skipping malformed Qdrant point");
                    None
                }
            })
            .collect();
        debug!(collection = %self.collection_name, hits = hits.len(), "Qdrant search finished");
        Ok(hits)
    }

    /// Check that the server is reachable and the collection exists.
    async fn health(&self) -> Result<()> {
        let url = format!("{}/collections", self.base_url);
        let response = self.client.get(&url).send().await
            .context("Failed to reach Qdrant")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list collections: {}", response.status());
        }

        let info: CollectionInfo = response.json().await?;
        let exists = info.result.collections.iter()
            .any(|c| c.name == self.collection_name);

        if !exists {
            anyhow::bail!("Collection '{}' does not exist", self.collection_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter() {
        let filter = ChunkFilter {
            source: Some("1.pdf".to_string()),
            year: Some(2021),
            ..ChunkFilter::default()
        };
        let value = QdrantStore::build_filter(&filter);
        let must = value["must"].as_array().unwrap();

        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["key"], "source");
        assert_eq!(must[1]["match"]["value"], 2021);
    }

    #[test]
    fn test_parse_point() {
        let point = json!({
            "score": 0.82,
            "payload": {
                "chunk_id": "abc",
                "text": "50 cycles",
                "source": "1.pdf",
                "page": 4,
                "title": "CuO memristors"
            }
        });
        let hit = QdrantStore::parse_point(&point).unwrap();

        assert_eq!(hit.chunk.id, "abc");
        assert_eq!(hit.chunk.page, Some(4));
        assert_eq!(hit.chunk.doi, None);
        assert!((hit.score - 0.82).abs() < 1e-6);
    }

    #[test]
    fn test_parse_point_requires_chunk_id() {
        let point = json!({"score": 0.1, "payload": {"text": "x"}});
        assert!(QdrantStore::parse_point(&point).is_err());
    }
}
