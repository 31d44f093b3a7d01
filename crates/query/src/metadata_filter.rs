use async_trait::async_trait;
use extract::{CompletionRequest, LlmBackend, Message};
use index::{ChunkFilter, ChunkStore};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::retriever::{RetrievalError, RetrievalResult, Retriever, search_text};

const FILTER_PROMPT: &str = "You turn a question about research papers into a structured search request. \
The corpus is extracted text from chemistry and materials-science papers (abstract, methods, results, discussion, supplementary data). \
Each chunk carries metadata: source (PDF file name), title, doi, year. \
Return a JSON object with the keys \"query\" (the question with the metadata constraints removed), \
\"source\", \"title\", \"doi\" and \"year\". Use null for any constraint the question does not state explicitly.";

/// What the auxiliary model derived from the question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedQuery {
    pub query: Option<String>,
    pub filter: ChunkFilter,
}

fn non_empty_string(v: &Value) -> Option<String> {
    v.as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

/// Lenient read of the model's filter answer.
pub fn parse_derived(text: &str) -> Option<DerivedQuery> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;
    let obj = value.as_object()?;

    let year = match obj.get("year") {
        Some(Value::Number(n)) => n.as_i64().map(|y| y as i32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };

    Some(DerivedQuery {
        query: obj.get("query").and_then(non_empty_string),
        filter: ChunkFilter {
            source: obj.get("source").and_then(non_empty_string),
            title: obj.get("title").and_then(non_empty_string),
            doi: obj.get("doi").and_then(non_empty_string),
            year,
        },
    })
}

/// Derives metadata constraints from the question, then searches with them.
///
/// Fails open: when derivation fails, or the filtered search comes back
/// empty, the search is repeated with only the caller's filter.
pub struct MetadataFilterRetriever {
    store: Arc<dyn ChunkStore>,
    llm: Arc<dyn LlmBackend>,
}

impl MetadataFilterRetriever {
    pub fn new(store: Arc<dyn ChunkStore>, llm: Arc<dyn LlmBackend>) -> Self {
        Self { store, llm }
    }

    pub async fn derive(&self, query: &str) -> Option<DerivedQuery> {
        let request = CompletionRequest::new(vec![
            Message::system(FILTER_PROMPT),
            Message::user(query),
        ])
        .with_shape(json!({
            "type": "object",
            "properties": {
                "query": {"type": ["string", "null"]},
                "source": {"type": ["string", "null"]},
                "title": {"type": ["string", "null"]},
                "doi": {"type": ["string", "null"]},
                "year": {"type": ["integer", "null"]},
            }
        }));

        match self.llm.complete(&request).await {
            Ok(text) => {
                let derived = parse_derived(&text);
                if derived.is_none() {
                    warn!(response = %text, "Could not parse derived metadata filter, searching unfiltered");
                }
                derived
            }
            Err(e) => {
                warn!(error = %e, "Metadata filter derivation failed, searching unfiltered");
                None
            }
        }
    }
}

#[async_trait]
impl Retriever for MetadataFilterRetriever {
    fn name(&self) -> &str {
        "metadata_filter"
    }

    async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let base = filter.cloned().unwrap_or_default();

        if let Some(derived) = self.derive(query).await {
            // Caller constraints win over derived ones
            let combined = base.merged_with(&derived.filter);
            let search_query = derived.query.as_deref().unwrap_or(query);

            if combined != base {
                debug!(filter = ?combined, "Searching with derived metadata filter");
                let hits = search_text(self.store.as_ref(), search_query, k, Some(&combined)).await?;
                if !hits.is_empty() {
                    return Ok(RetrievalResult::new(self.name(), hits));
                }
                warn!(filter = ?combined, "Derived filter matched nothing, falling back");
            }
        }

        let base_filter = (!base.is_empty()).then_some(&base);
        let hits = search_text(self.store.as_ref(), query, k, base_filter).await?;
        Ok(RetrievalResult::new(self.name(), hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::InProcessBackend;
    use index::{Chunk, HashingEmbedder, MemoryStore};

    async fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new(Arc::new(HashingEmbedder::default()));
        store
            .insert_all(vec![
                Chunk::new("CuO device endurance of 50 cycles", "1.pdf", Some(1)).with_year(2019),
                Chunk::new("HfO2 device endurance of 1000 cycles", "2.pdf", Some(1)).with_year(2021),
            ])
            .await
            .unwrap();
        Arc::new(store)
    }

    fn backend(answer: &'static str) -> Arc<dyn LlmBackend> {
        Arc::new(InProcessBackend::new("filter", move |_: &CompletionRequest| -> Result<String, String> { Ok(answer.to_string()) }))
    }

    #[test]
    fn test_parse_derived_lenient() {
        let derived = parse_derived("Sure: {\"query\": \"endurance\", \"source\": \"2.pdf\", \"year\": \"2021\", \"doi\": null}").unwrap();
        assert_eq!(derived.query.as_deref(), Some("endurance"));
        assert_eq!(derived.filter.source.as_deref(), Some("2.pdf"));
        assert_eq!(derived.filter.year, Some(2021));
        assert!(derived.filter.doi.is_none());
        assert!(parse_derived("no json").is_none());
    }

    #[tokio::test]
    async fn test_derived_filter_is_applied() {
        let retriever = MetadataFilterRetriever::new(
            store().await,
            backend(r#"{"query": "device endurance", "source": "2.pdf"}"#),
        );
        let result = retriever.retrieve("endurance in 2.pdf", 5, None).await.unwrap();
        assert!(!result.is_empty());
        assert!(result.hits.iter().all(|h| h.chunk.source_file == "2.pdf"));
    }

    #[tokio::test]
    async fn test_fails_open_on_bad_derivation() {
        let retriever = MetadataFilterRetriever::new(store().await, backend("I cannot help with that"));
        let result = retriever.retrieve("device endurance", 5, None).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_fails_open_when_filter_matches_nothing() {
        let retriever = MetadataFilterRetriever::new(store().await, backend(r#"{"source": "missing.pdf"}"#));
        let result = retriever.retrieve("device endurance", 5, None).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn test_caller_filter_survives_fallback() {
        let retriever = MetadataFilterRetriever::new(store().await, backend("garbage"));
        let base = ChunkFilter::by_source("1.pdf");
        let result = retriever.retrieve("device endurance", 5, Some(&base)).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.hits[0].chunk.source_file, "1.pdf");
    }
}
