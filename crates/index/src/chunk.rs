use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A span of paper text with its provenance. Chunks are produced upstream and
/// never modified here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_file: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub offset: Option<(usize, usize)>, // [start, end] character positions within the page
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

impl Chunk {
    pub fn new(text: impl Into<String>, source_file: impl Into<String>, page: Option<u32>) -> Self {
        let text = text.into();
        let source_file = source_file.into();
        // Generate stable id from content
        let id = Self::generate_chunk_id(&source_file, &text, page);

        Self {
            id,
            text,
            source_file,
            page,
            offset: None,
            title: None,
            doi: None,
            year: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_doi(mut self, doi: impl Into<String>) -> Self {
        self.doi = Some(doi.into());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_offset(mut self, start: usize, end: usize) -> Self {
        self.offset = Some((start, end));
        self
    }

    fn generate_chunk_id(source_file: &str, text: &str, page: Option<u32>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_file.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(page.unwrap_or(0).to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }

    /// Estimate token count (rough: 1.3 tokens per word)
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 * 1.3).ceil() as usize
    }
}

/// Metadata predicate applied by the store before ranking.
///
/// `source` and `doi` match exactly (case-insensitive); `title` matches when the
/// chunk title contains the requested text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl ChunkFilter {
    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.title.is_none() && self.doi.is_none() && self.year.is_none()
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(source) = &self.source {
            if !chunk.source_file.eq_ignore_ascii_case(source) {
                return false;
            }
        }
        if let Some(doi) = &self.doi {
            match &chunk.doi {
                Some(d) if d.eq_ignore_ascii_case(doi) => {}
                _ => return false,
            }
        }
        if let Some(title) = &self.title {
            match &chunk.title {
                Some(t) if t.to_lowercase().contains(&title.to_lowercase()) => {}
                _ => return false,
            }
        }
        if let Some(year) = self.year {
            if chunk.year != Some(year) {
                return false;
            }
        }
        true
    }

    /// Combine two filters. Constraints set on `self` win over `other`.
    pub fn merged_with(&self, other: &ChunkFilter) -> ChunkFilter {
        ChunkFilter {
            source: self.source.clone().or_else(|| other.source.clone()),
            title: self.title.clone().or_else(|| other.title.clone()),
            doi: self.doi.clone().or_else(|| other.doi.clone()),
            year: self.year.or(other.year),
        }
    }
}

/// A chunk returned by a similarity search, with the store's score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Arc<Chunk>,
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_stable() {
        let a = Chunk::new("The device endured 50 cycles.", "1.pdf", Some(3));
        let b = Chunk::new("The device endured 50 cycles.", "1.pdf", Some(3));
        let c = Chunk::new("The device endured 50 cycles.", "2.pdf", Some(3));

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 32);
    }

    #[test]
    fn test_filter_matching() {
        let chunk = Chunk::new("text", "1.pdf", None)
            .with_title("Memristive Devices from CuO Nanoparticles")
            .with_doi("10.1000/xyz")
            .with_year(2020);

        assert!(ChunkFilter::default().matches(&chunk));
        assert!(ChunkFilter::by_source("1.PDF").matches(&chunk));
        assert!(!ChunkFilter::by_source("2.pdf").matches(&chunk));

        let title = ChunkFilter {
            title: Some("cuo nanoparticles".to_string()),
            ..ChunkFilter::default()
        };
        assert!(title.matches(&chunk));

        let year = ChunkFilter {
            year: Some(2019),
            ..ChunkFilter::default()
        };
        assert!(!year.matches(&chunk));
    }

    #[test]
    fn test_merged_filter_prefers_self() {
        let caller = ChunkFilter::by_source("1.pdf");
        let derived = ChunkFilter {
            source: Some("2.pdf".to_string()),
            doi: Some("10.1/abc".to_string()),
            ..ChunkFilter::default()
        };

        let merged = caller.merged_with(&derived);
        assert_eq!(merged.source.as_deref(), Some("1.pdf"));
        assert_eq!(merged.doi.as_deref(), Some("10.1/abc"));
    }
}
