pub mod cancel;
pub mod error;
pub mod llm;
pub mod normalizer;
pub mod parse;
pub mod prompt;
pub mod record;
pub mod registry;
pub mod schema;
pub mod store;

pub use cancel::CancellationToken;
pub use error::{ExtractError, LlmError, SchemaError};
pub use llm::{
    CompletionRequest, FallbackBackend, GeminiBackend, InProcessBackend, LlmBackend, Message,
    OllamaBackend, Role, TextGenerator,
};
pub use prompt::{PromptContract, render_prompt_contract};
pub use record::{ExtractionOutcome, ExtractionRecord, ExtractionStatus};
pub use registry::SchemaRegistry;
pub use schema::{FieldDefinition, FieldSpec, FieldType, SchemaSpec, build_static_schema};
pub use store::{
    HistoryStore, InMemoryHistoryStore, InMemorySchemaStore, SchemaStore, Turn, TurnRole,
};

use index::ScoredChunk;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::prompt::{FewShotExample, PromptParts, build_messages, build_retry_message, builtin_examples, select_example};

/// One extraction over the merged context, or one per source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    #[default]
    Merged,
    PerDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Corrective attempts after the first; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub temperature: Option<f32>,
    pub use_examples: bool,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            temperature: Some(0.0),
            use_examples: true,
        }
    }
}

/// Retry loop states. Every transition is explicit; the loop ends only in
/// `Succeeded` or `Degraded`.
#[derive(Debug)]
enum AttemptState {
    Drafting { attempt: u32 },
    Validating { attempt: u32, raw: String },
    Retrying { attempt: u32, raw: String, reason: String },
    Succeeded { attempts: u32, record: ExtractionRecord },
    Degraded { attempts: u32 },
}

pub struct Extractor {
    backend: Arc<dyn LlmBackend>,
    examples: Vec<FewShotExample>,
    config: ExtractorConfig,
}

impl Extractor {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self::with_config(backend, ExtractorConfig::default())
    }

    pub fn with_config(backend: Arc<dyn LlmBackend>, config: ExtractorConfig) -> Self {
        Self {
            backend,
            examples: builtin_examples(),
            config,
        }
    }

    pub fn with_examples(mut self, examples: Vec<FewShotExample>) -> Self {
        self.examples = examples;
        self
    }

    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Draft, validate and retry until the answer conforms to `schema` or the
    /// attempt budget runs out. Schema failures end as a degraded all-null
    /// record; only an unavailable backend or cancellation is an error.
    pub async fn extract(
        &self,
        query: &str,
        schema: &SchemaSpec,
        context: &[ScoredChunk],
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let contract = render_prompt_contract(schema);
        let example = if self.config.use_examples {
            select_example(query, &self.examples).and_then(|ex| ex.project(schema).map(|p| (ex, p)))
        } else {
            None
        };

        let mut messages = build_messages(PromptParts {
            contract: &contract,
            example,
            history,
            context,
            query,
        });

        let mut issues = Vec::new();
        let mut state = AttemptState::Drafting { attempt: 1 };

        let (record, status, attempts) = loop {
            state = match state {
                AttemptState::Drafting { attempt } => {
                    let request = CompletionRequest {
                        messages: messages.clone(),
                        response_shape: Some(contract.json_schema.clone()),
                        temperature: self.config.temperature,
                    };
                    debug!(attempt, model = self.backend.model_id(), "Requesting extraction");
                    let raw = cancel
                        .run(self.backend.complete(&request))
                        .await
                        .ok_or(ExtractError::Cancelled)??;
                    AttemptState::Validating { attempt, raw }
                }

                AttemptState::Validating { attempt, raw } => {
                    let validated = parse::parse_items(&raw, schema)
                        .and_then(|items| record::validate_response(schema, &items).map_err(|v| v.join("; ")));
                    match validated {
                        Ok(record) => AttemptState::Succeeded { attempts: attempt, record },
                        Err(reason) => {
                            issues.push(format!("attempt {}: {}", attempt, reason));
                            if attempt <= self.config.max_retries {
                                AttemptState::Retrying { attempt, raw, reason }
                            } else {
                                AttemptState::Degraded { attempts: attempt }
                            }
                        }
                    }
                }

                AttemptState::Retrying { attempt, raw, reason } => {
                    warn!(attempt, reason = %reason, "Response did not match schema, retrying");
                    messages.push(Message::assistant(raw));
                    messages.push(build_retry_message(&reason));
                    AttemptState::Drafting { attempt: attempt + 1 }
                }

                AttemptState::Succeeded { attempts, record } => {
                    break (record, ExtractionStatus::Ok, attempts);
                }

                AttemptState::Degraded { attempts } => {
                    warn!(attempts, schema = %schema.id, "Schema validation retries exhausted, returning null record");
                    break (ExtractionRecord::all_null(schema), ExtractionStatus::Degraded, attempts);
                }
            };
        };

        info!(
            attempts,
            status = ?status,
            chunks = context.len(),
            fields = schema.len(),
            "Extraction finished"
        );

        Ok(ExtractionOutcome {
            record,
            status,
            unit: None,
            attempts,
            issues,
        })
    }

    /// One extraction per source document, in ranking order of each
    /// document's best chunk.
    pub async fn extract_per_document(
        &self,
        query: &str,
        schema: &SchemaSpec,
        context: &[ScoredChunk],
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractionOutcome>, ExtractError> {
        let groups = group_by_source(context);
        if groups.is_empty() {
            return Ok(vec![self.extract(query, schema, context, history, cancel).await?]);
        }

        let mut outcomes = Vec::with_capacity(groups.len());
        for (source, chunks) in groups {
            let mut outcome = self.extract(query, schema, &chunks, history, cancel).await?;
            outcome.unit = Some(source);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn extract_with_mode(
        &self,
        mode: ExtractionMode,
        query: &str,
        schema: &SchemaSpec,
        context: &[ScoredChunk],
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractionOutcome>, ExtractError> {
        match mode {
            ExtractionMode::Merged => Ok(vec![self.extract(query, schema, context, history, cancel).await?]),
            ExtractionMode::PerDocument => {
                self.extract_per_document(query, schema, context, history, cancel).await
            }
        }
    }
}

/// Group chunks by `source_file`, keeping first-appearance order.
pub fn group_by_source(context: &[ScoredChunk]) -> Vec<(String, Vec<ScoredChunk>)> {
    let mut groups: Vec<(String, Vec<ScoredChunk>)> = Vec::new();
    for sc in context {
        match groups.iter_mut().find(|(source, _)| *source == sc.chunk.source_file) {
            Some((_, chunks)) => chunks.push(sc.clone()),
            None => groups.push((sc.chunk.source_file.clone(), vec![sc.clone()])),
        }
    }
    groups
}
