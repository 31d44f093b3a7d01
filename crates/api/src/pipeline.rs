use anyhow::{Context, Result};
use cite::{CitationLinkFailure, CitationLinker, CitationList, LlmJudge};
use extract::{
    CancellationToken, ExtractError, ExtractionMode, ExtractionOutcome, ExtractionRecord,
    ExtractionStatus, Extractor, FallbackBackend, FieldDefinition, FieldType, GeminiBackend,
    HistoryStore, InMemoryHistoryStore, InMemorySchemaStore, LlmBackend, LlmError, OllamaBackend,
    SchemaError, SchemaRegistry, SchemaSpec, SchemaStore, Turn,
};
use index::{
    Chunk, ChunkFilter, ChunkStore, Embedder, EmbeddingClient, HashingEmbedder, MemoryStore,
    QdrantStore, ScoredChunk,
};
use query::{
    ContextBudget, DegradedStrategy, EnsembleRetriever, MetadataFilterRetriever,
    QueryExpansionRetriever, RerankRetriever, RetrievalError, VectorRetriever,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{Cache, CachedEmbedder, CachingBackend};
use crate::config::{AppConfig, BackendConfig, EmbeddingConfig, StoreConfig};
use crate::metrics::{Metrics, TimedOperation};
use crate::persistence::{FileHistoryStore, FileSchemaStore, write_outputs};
use crate::retry::{RetryPolicy, RetryingBackend};

/// Which schema a request extracts against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaRef {
    #[default]
    Static,
    Owner(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub query: String,
    #[serde(default)]
    pub schema: SchemaRef,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: ExtractionMode,
    #[serde(default)]
    pub filter: Option<ChunkFilter>,
}

impl ExtractionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            schema: SchemaRef::Static,
            session_id: None,
            mode: ExtractionMode::Merged,
            filter: None,
        }
    }

    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, filter: ChunkFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Everything behind the `status` field: what degraded and why.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestReport {
    pub schema_id: String,
    pub schema_version: u32,
    /// Chunk ids handed to the model, in Source_ID order.
    pub context: Vec<String>,
    pub degraded_strategies: Vec<DegradedStrategy>,
    /// Source file of each record in per-document mode.
    pub units: Vec<Option<String>>,
    pub attempts: Vec<u32>,
    pub extraction_issues: Vec<String>,
    /// Non-null fields with no supporting citation.
    pub unsupported_fields: Vec<String>,
    pub citation_failures: Vec<CitationLinkFailure>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResponse {
    pub request_id: String,
    pub records: Vec<ExtractionRecord>,
    pub citations: CitationList,
    pub status: ExtractionStatus,
    pub report: RequestReport,
}

/// Hard failures. Everything else comes back as a degraded response.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Retrieval(RetrievalError),
    #[error("LLM backend unavailable: {0}")]
    BackendUnavailable(#[source] LlmError),
    #[error("request cancelled")]
    Cancelled,
}

impl From<RetrievalError> for PipelineError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Retrieval(other),
        }
    }
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::BackendUnavailable(e) => PipelineError::BackendUnavailable(e),
            ExtractError::Cancelled => PipelineError::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub k: usize,
    pub budget: ContextBudget,
    pub history_tail: usize,
    pub output_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            k: 7,
            budget: ContextBudget::default(),
            history_tail: 2,
            output_dir: None,
        }
    }
}

pub struct ExtractionService {
    ensemble: EnsembleRetriever,
    extractor: Extractor,
    linker: CitationLinker,
    registry: Arc<SchemaRegistry>,
    history: Arc<dyn HistoryStore>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
    store: Option<Arc<dyn ChunkStore>>,
}

impl ExtractionService {
    pub fn new(
        ensemble: EnsembleRetriever,
        extractor: Extractor,
        linker: CitationLinker,
        registry: Arc<SchemaRegistry>,
        history: Arc<dyn HistoryStore>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ensemble,
            extractor,
            linker,
            registry,
            history,
            metrics,
            settings,
            store: None,
        }
    }

    /// Attach the chunk store so health checks can probe it.
    pub fn with_store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wire every component from configuration. Fails on configuration
    /// errors only; backends are not contacted here.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new();
        let cache = config.cache.enabled.then(|| Cache::new(config.cache.max_entries));
        let policy = RetryPolicy::from_config(&config.retry);

        let primary: Arc<dyn LlmBackend> = Arc::new(RetryingBackend::new(build_backend(&config.backend)?, policy.clone()));
        let backend: Arc<dyn LlmBackend> = match &config.fallback {
            Some(fallback) => {
                let secondary = Arc::new(RetryingBackend::new(build_backend(fallback)?, policy.clone()));
                Arc::new(FallbackBackend::new(primary, secondary))
            }
            None => primary,
        };

        let mut auxiliary: Arc<dyn LlmBackend> = match &config.auxiliary {
            Some(aux) => Arc::new(RetryingBackend::new(build_backend(aux)?, policy)),
            None => Arc::clone(&backend),
        };
        if let Some(cache) = &cache {
            auxiliary = Arc::new(CachingBackend::new(auxiliary, Arc::clone(cache)));
        }

        let store = build_store(&config.store, cache.as_ref()).await?;

        let r = &config.retrieval;
        let mut ensemble = EnsembleRetriever::new(Duration::from_millis(config.concurrency.strategy_timeout_ms));
        if let Some(weight) = r.metadata_filter_weight {
            let retriever = MetadataFilterRetriever::new(Arc::clone(&store), Arc::clone(&auxiliary));
            ensemble = ensemble.with_strategy(Arc::new(retriever), weight);
        }
        if let Some(weight) = r.query_expansion_weight {
            let retriever = QueryExpansionRetriever::new(Arc::clone(&store), Arc::clone(&auxiliary), r.num_variants);
            ensemble = ensemble.with_strategy(Arc::new(retriever), weight);
        }
        if let Some(weight) = r.rerank_weight {
            ensemble = ensemble.with_strategy(Arc::new(RerankRetriever::new(Arc::clone(&store), r.fetch_k)), weight);
        }
        if ensemble.strategy_names().is_empty() {
            info!("No retrieval strategy weighted, using plain vector search");
            ensemble = ensemble.with_strategy(Arc::new(VectorRetriever::new(Arc::clone(&store))), 1.0);
        }

        let linker = if config.citation.use_judge {
            CitationLinker::with_judge(Arc::new(LlmJudge::new(Arc::clone(&auxiliary))))
        } else {
            CitationLinker::lexical()
        };

        let schema_store: Arc<dyn SchemaStore> = match &config.schemas.dir {
            Some(dir) => Arc::new(FileSchemaStore::open(dir).await?),
            None => Arc::new(InMemorySchemaStore::new()),
        };
        let history: Arc<dyn HistoryStore> = match &config.history.dir {
            Some(dir) => Arc::new(FileHistoryStore::open(dir).await?),
            None => Arc::new(InMemoryHistoryStore::new()),
        };

        info!(
            mode = ?config.mode,
            backend = backend.model_id(),
            strategies = ?ensemble.strategy_names(),
            cache = cache.is_some(),
            judge = config.citation.use_judge,
            "Extraction service ready"
        );

        Ok(Self::new(
            ensemble,
            Extractor::with_config(backend, config.extraction.clone()),
            linker,
            Arc::new(SchemaRegistry::new(schema_store)),
            history,
            metrics,
            PipelineSettings {
                k: r.k,
                budget: config.budget,
                history_tail: config.history.tail,
                output_dir: config.output.dir.clone(),
            },
        )
        .with_store(store))
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn backend_model(&self) -> &str {
        self.extractor.backend().model_id()
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.ensemble.strategy_names()
    }

    pub async fn store_health(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.health().await,
            None => Ok(()),
        }
    }

    async fn resolve_schema(&self, schema: &SchemaRef) -> Result<Arc<SchemaSpec>, SchemaError> {
        match schema {
            SchemaRef::Static => Ok(self.registry.static_schema()),
            SchemaRef::Owner(owner) => self.registry.get(owner).await,
        }
    }

    async fn history_tail(&self, session_id: Option<&str>) -> Vec<Turn> {
        let Some(session) = session_id else { return Vec::new() };
        if self.settings.history_tail == 0 {
            return Vec::new();
        }
        match self.history.recent_turns(session, self.settings.history_tail).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(session, error = %e, "Could not load history, continuing without it");
                Vec::new()
            }
        }
    }

    async fn remember(&self, session_id: Option<&str>, query: &str, records: &[ExtractionRecord]) {
        let Some(session) = session_id else { return };
        let answer = match serde_json::to_string(records) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session, error = %e, "Could not serialize records for history");
                return;
            }
        };
        for turn in [Turn::human(query), Turn::ai(answer)] {
            if let Err(e) = self.history.append_turn(session, turn).await {
                warn!(session, error = %e, "Could not append history turn");
                return;
            }
        }
    }

    /// Retrieve, extract, cite. Returns a degraded response rather than an
    /// error for strategy timeouts and schema validation failures.
    pub async fn run_extraction(
        &self,
        request: ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResponse, PipelineError> {
        let result = self.run_inner(request, cancel).await;
        match &result {
            Ok(response) => self.metrics.record_request(response.status),
            Err(e) => self.metrics.record_failure(matches!(e, PipelineError::Cancelled)),
        }
        result
    }

    async fn run_inner(
        &self,
        request: ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResponse, PipelineError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidRequest("query must not be empty".into()));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        let session = request.session_id.as_deref();

        let schema = self.resolve_schema(&request.schema).await?;
        let history = self.history_tail(session).await;

        let timer = TimedOperation::start();
        let retrieved = self
            .ensemble
            .retrieve(query, self.settings.k, request.filter.as_ref(), &self.settings.budget, cancel)
            .await?;
        let timeouts = retrieved.degraded.iter().filter(|d| d.timed_out).count();
        self.metrics.record_retrieval(timer.elapsed(), retrieved.result.len(), timeouts);
        let context = retrieved.result.hits;

        let timer = TimedOperation::start();
        let outcomes = self
            .extractor
            .extract_with_mode(request.mode, query, &schema, &context, &history, cancel)
            .await?;
        let attempts = outcomes.iter().map(|o| o.attempts).sum();
        self.metrics.record_extraction(timer.elapsed(), attempts);

        let timer = TimedOperation::start();
        let mut citations = CitationList::default();
        let mut unsupported_fields = Vec::new();
        let mut citation_failures = Vec::new();
        for outcome in &outcomes {
            let linked = cancel
                .run(self.link_outcome(outcome, &context))
                .await
                .ok_or(PipelineError::Cancelled)?;
            citations.citations.extend(linked.citations);
            for field in linked.unsupported_fields {
                if !unsupported_fields.contains(&field) {
                    unsupported_fields.push(field);
                }
            }
            citation_failures.extend(linked.failures);
        }
        self.metrics
            .record_citation(timer.elapsed(), citations.citations.len(), unsupported_fields.len());
        if !unsupported_fields.is_empty() {
            warn!(request_id = %request_id, fields = ?unsupported_fields, "Fields without a supporting citation");
        }

        let status = outcomes
            .iter()
            .fold(ExtractionStatus::Ok, |acc, o| acc.combine(o.status))
            .combine(if retrieved.degraded.is_empty() && citation_failures.is_empty() {
                ExtractionStatus::Ok
            } else {
                ExtractionStatus::Degraded
            });

        let records: Vec<ExtractionRecord> = outcomes.iter().map(|o| o.record.clone()).collect();
        self.remember(session, query, &records).await;

        let output_dir = match &self.settings.output_dir {
            Some(dir) => match write_outputs(dir, &request_id, &records, &citations).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Could not write outputs");
                    None
                }
            },
            None => None,
        };

        info!(
            request_id = %request_id,
            schema = %schema.id,
            mode = ?request.mode,
            status = ?status,
            records = records.len(),
            citations = citations.citations.len(),
            "Extraction request finished"
        );

        let report = RequestReport {
            schema_id: schema.id.clone(),
            schema_version: schema.version,
            context: context.iter().map(|c| c.chunk.id.clone()).collect(),
            degraded_strategies: retrieved.degraded,
            units: outcomes.iter().map(|o| o.unit.clone()).collect(),
            attempts: outcomes.iter().map(|o| o.attempts).collect(),
            extraction_issues: outcomes.iter().flat_map(|o| o.issues.iter().cloned()).collect(),
            unsupported_fields,
            citation_failures,
            output_dir,
        };

        Ok(ExtractionResponse {
            request_id,
            records,
            citations,
            status,
            report,
        })
    }

    /// Source_IDs always refer to positions in the full context, also when
    /// a per-document record only saw its own document's chunks.
    async fn link_outcome(&self, outcome: &ExtractionOutcome, context: &[ScoredChunk]) -> cite::CitationReport {
        match &outcome.unit {
            None => self.linker.link(&outcome.record, context).await,
            Some(unit) => {
                let subset: Vec<(usize, &ScoredChunk)> = context
                    .iter()
                    .enumerate()
                    .filter(|(_, sc)| &sc.chunk.source_file == unit)
                    .collect();
                self.linker.link_indexed(&outcome.record, &subset).await
            }
        }
    }
}

/// Body of a schema registration: a list of field definitions, or a mapping
/// from field name to description (or to a full definition object).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SchemaDefinition {
    List { fields: Vec<FieldDefinition> },
    Mapping(Map<String, Value>),
}

impl SchemaDefinition {
    pub fn into_field_defs(self) -> Result<Vec<FieldDefinition>, PipelineError> {
        match self {
            SchemaDefinition::List { fields } => Ok(fields),
            SchemaDefinition::Mapping(map) => map
                .into_iter()
                .map(|(name, value)| match value {
                    Value::String(description) => Ok(FieldDefinition::Full {
                        name,
                        description: Some(description),
                        field_type: FieldType::default(),
                        required: false,
                    }),
                    Value::Object(mut obj) => {
                        obj.insert("name".to_string(), Value::String(name.clone()));
                        serde_json::from_value(Value::Object(obj)).map_err(|e| {
                            PipelineError::InvalidRequest(format!("field '{}': {}", name, e))
                        })
                    }
                    other => Err(PipelineError::InvalidRequest(format!(
                        "field '{}': expected a description or a definition object, got {}",
                        name, other
                    ))),
                })
                .collect(),
        }
    }
}

fn build_backend(config: &BackendConfig) -> Result<Arc<dyn LlmBackend>> {
    match config {
        BackendConfig::Ollama { base_url, model, timeout_secs } => Ok(Arc::new(OllamaBackend::new(
            base_url.clone(),
            model.clone(),
            Duration::from_secs(*timeout_secs),
        )?)),
        BackendConfig::Gemini { model, api_key_env, timeout_secs } => {
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("Environment variable {} is not set", api_key_env))?;
            Ok(Arc::new(GeminiBackend::new(api_key, model.clone(), Duration::from_secs(*timeout_secs))?))
        }
    }
}

fn build_embedder(config: &EmbeddingConfig, cache: Option<&Arc<Cache>>) -> Arc<dyn Embedder> {
    let embedder: Arc<dyn Embedder> = match config {
        EmbeddingConfig::Hashing { dimension } => Arc::new(HashingEmbedder::new(*dimension)),
        EmbeddingConfig::Ollama { base_url, model } => {
            Arc::new(EmbeddingClient::new(base_url.clone(), model.clone()))
        }
    };
    match cache {
        Some(cache) => Arc::new(CachedEmbedder::new(embedder, Arc::clone(cache))),
        None => embedder,
    }
}

async fn build_store(config: &StoreConfig, cache: Option<&Arc<Cache>>) -> Result<Arc<dyn ChunkStore>> {
    match config {
        StoreConfig::Memory { corpus, embedding } => {
            let store = MemoryStore::new(build_embedder(embedding, cache));
            if let Some(path) = corpus {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read corpus {}", path.display()))?;
                let chunks: Vec<Chunk> = serde_json::from_str(&raw)
                    .with_context(|| format!("Corpus {} is not a JSON array of chunks", path.display()))?;
                let count = chunks.len();
                store.insert_all(chunks).await?;
                info!(path = %path.display(), chunks = count, "Loaded corpus into memory store");
            }
            Ok(Arc::new(store))
        }
        StoreConfig::Qdrant { url, collection, embedding } => Ok(Arc::new(QdrantStore::new(
            url.clone(),
            build_embedder(embedding, cache),
            collection.clone(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_defaults() {
        let request: ExtractionRequest =
            serde_json::from_str(r#"{"query": "endurance of CuO devices"}"#).unwrap();
        assert_eq!(request.schema, SchemaRef::Static);
        assert_eq!(request.mode, ExtractionMode::Merged);
        assert!(request.session_id.is_none());

        let request: ExtractionRequest = serde_json::from_str(
            r#"{"query": "q", "schema": {"owner": "lab-7"}, "mode": "per_document"}"#,
        )
        .unwrap();
        assert_eq!(request.schema, SchemaRef::Owner("lab-7".into()));
        assert_eq!(request.mode, ExtractionMode::PerDocument);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(PipelineError::from(RetrievalError::Cancelled), PipelineError::Cancelled));
        assert!(matches!(PipelineError::from(ExtractError::Cancelled), PipelineError::Cancelled));
        assert!(matches!(
            PipelineError::from(ExtractError::BackendUnavailable(LlmError::Unavailable("down".into()))),
            PipelineError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn test_schema_definition_forms() {
        let mapping: SchemaDefinition = serde_json::from_str(
            r#"{"device_area": "Device area in um^2", "cycles": {"type": "integer", "required": true}}"#,
        )
        .unwrap();
        let defs = mapping.into_field_defs().unwrap();
        assert_eq!(defs[0].name(), "device_area");
        assert_eq!(
            defs[1],
            FieldDefinition::Full {
                name: "cycles".into(),
                description: None,
                field_type: FieldType::Integer,
                required: true,
            }
        );

        let list: SchemaDefinition = serde_json::from_str(r#"{"fields": ["top_electrode"]}"#).unwrap();
        assert_eq!(list.into_field_defs().unwrap(), vec![FieldDefinition::Name("top_electrode".into())]);

        let bad: SchemaDefinition = serde_json::from_str(r#"{"cycles": 5}"#).unwrap();
        assert!(matches!(bad.into_field_defs(), Err(PipelineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_from_config_defaults_to_local_wiring() {
        let service = ExtractionService::from_config(&AppConfig::default()).await.unwrap();
        assert_eq!(service.strategy_names(), ["metadata_filter", "query_expansion", "rerank"]);
        assert!(service.registry().static_schema().is_static());
    }
}
