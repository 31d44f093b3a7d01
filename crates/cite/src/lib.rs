//! Links extracted values back to the context chunks that state them.

pub mod judge;
pub mod lexical;

pub use judge::{LlmJudge, SupportJudge};

use extract::ExtractionRecord;
use futures::future::join_all;
use index::ScoredChunk;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// A supporting excerpt. Everything is copied out of the chunk, so the
/// citation stays valid after the context is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Position of the chunk in this extraction's context.
    #[serde(rename = "Source_ID")]
    pub source_id: usize,
    #[serde(rename = "Article_ID")]
    pub article_id: String,
    #[serde(rename = "Article_Snippet")]
    pub snippet: String,
    #[serde(rename = "Article_Title")]
    pub title: Option<String>,
    #[serde(rename = "Article_Source")]
    pub source_file: String,
}

/// Persisted as `{"citations": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationList {
    pub citations: Vec<Citation>,
}

/// A chunk whose support could not be judged; its citations are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("could not judge support for source {source_id} (chunk {chunk_id}): {reason}")]
pub struct CitationLinkFailure {
    pub source_id: usize,
    pub chunk_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CitationReport {
    pub citations: Vec<Citation>,
    /// field -> Source_IDs of chunks supporting it
    pub field_support: BTreeMap<String, Vec<usize>>,
    /// Non-null fields no chunk was found to support.
    pub unsupported_fields: Vec<String>,
    pub failures: Vec<CitationLinkFailure>,
}

impl CitationReport {
    pub fn is_fully_supported(&self) -> bool {
        self.unsupported_fields.is_empty() && self.failures.is_empty()
    }

    pub fn into_list(self) -> CitationList {
        CitationList { citations: self.citations }
    }
}

pub struct CitationLinker {
    judge: Option<Arc<dyn SupportJudge>>,
}

impl Default for CitationLinker {
    fn default() -> Self {
        Self::lexical()
    }
}

impl CitationLinker {
    pub fn lexical() -> Self {
        Self { judge: None }
    }

    pub fn with_judge(judge: Arc<dyn SupportJudge>) -> Self {
        Self { judge: Some(judge) }
    }

    /// Cite every chunk of `context` that supports a non-null field of `record`.
    pub async fn link(&self, record: &ExtractionRecord, context: &[ScoredChunk]) -> CitationReport {
        let indexed: Vec<(usize, &ScoredChunk)> = context.iter().enumerate().collect();
        self.link_indexed(record, &indexed).await
    }

    /// Like [`link`](Self::link), with caller-chosen Source_IDs. Used when the
    /// record was drawn from a subset of a larger context.
    pub async fn link_indexed(
        &self,
        record: &ExtractionRecord,
        context: &[(usize, &ScoredChunk)],
    ) -> CitationReport {
        let fields = record.non_null_fields();
        let mut report = CitationReport::default();

        if fields.is_empty() {
            return report;
        }

        let verdicts = self.judge_all(&fields, context).await;

        for ((source_id, scored), verdict) in context.iter().zip(verdicts) {
            let chunk = &scored.chunk;
            let (supported, span) = match verdict {
                Ok(found) => found,
                Err(reason) => {
                    let failure = CitationLinkFailure {
                        source_id: *source_id,
                        chunk_id: chunk.id.clone(),
                        reason,
                    };
                    warn!(error = %failure, "Citation link failure, omitting chunk");
                    report.failures.push(failure);
                    continue;
                }
            };

            let Some(span) = span else { continue };
            for field in &supported {
                report.field_support.entry(field.clone()).or_default().push(*source_id);
            }
            report.citations.push(Citation {
                source_id: *source_id,
                article_id: Uuid::new_v4().to_string(),
                snippet: chunk.text[span].to_string(),
                title: chunk.title.clone(),
                source_file: chunk.source_file.clone(),
            });
        }

        let mut unsupported: Vec<String> = Vec::new();
        for (field, _) in &fields {
            if !report.field_support.contains_key(*field) && !unsupported.iter().any(|u| u == field) {
                unsupported.push(field.to_string());
            }
        }
        if !unsupported.is_empty() {
            warn!(fields = ?unsupported, "Extracted values without a supporting citation");
        }
        report.unsupported_fields = unsupported;

        debug!(
            citations = report.citations.len(),
            failures = report.failures.len(),
            "Citation linking finished"
        );
        report
    }

    /// Per chunk: the supported field names and the snippet span, or the
    /// reason judging failed.
    async fn judge_all(
        &self,
        fields: &[(&str, &Value)],
        context: &[(usize, &ScoredChunk)],
    ) -> Vec<Result<(Vec<String>, Option<Range<usize>>), String>> {
        match &self.judge {
            None => context
                .iter()
                .map(|(_, scored)| Ok(lexical_verdict(fields, &scored.chunk.text)))
                .collect(),
            Some(judge) => {
                let calls = context
                    .iter()
                    .map(|(_, scored)| judge.supported_fields(fields, &scored.chunk));
                join_all(calls)
                    .await
                    .into_iter()
                    .zip(context)
                    .map(|(res, (_, scored))| {
                        res.map(|names| judged_verdict(fields, names, &scored.chunk.text))
                            .map_err(|e| e.to_string())
                    })
                    .collect()
            }
        }
    }
}

/// Lexical support: the snippet is the earliest sentence supporting any field.
fn lexical_verdict(fields: &[(&str, &Value)], text: &str) -> (Vec<String>, Option<Range<usize>>) {
    let mut supported = Vec::new();
    let mut earliest: Option<Range<usize>> = None;
    for (name, value) in fields {
        if let Some(span) = lexical::supporting_span(value, text) {
            if !supported.iter().any(|s: &String| s == name) {
                supported.push(name.to_string());
            }
            if earliest.as_ref().is_none_or(|e| span.start < e.start) {
                earliest = Some(span);
            }
        }
    }
    (supported, earliest)
}

/// Judge-backed support: prefer a lexically matching sentence for the
/// snippet, else the sentence with the most overlap.
fn judged_verdict(
    fields: &[(&str, &Value)],
    names: Vec<String>,
    text: &str,
) -> (Vec<String>, Option<Range<usize>>) {
    if names.is_empty() {
        return (names, None);
    }
    let values: Vec<&Value> = fields
        .iter()
        .filter(|(f, _)| names.iter().any(|n| n == f))
        .map(|(_, v)| *v)
        .collect();

    let span = values
        .iter()
        .filter_map(|v| lexical::supporting_span(v, text))
        .min_by_key(|s| s.start)
        .or_else(|| lexical::best_overlap_span(&values, text));
    (names, span)
}
