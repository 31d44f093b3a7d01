use anyhow::{Context, Result};
use extract::ExtractorConfig;
use query::ContextBudget;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_ENV: &str = "SCIEXTRACT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "sciextract.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: OperationMode,
    pub backend: BackendConfig,
    /// Used only when the primary backend is unavailable. Never implied.
    pub fallback: Option<BackendConfig>,
    /// Model for metadata derivation, query variants and the citation judge.
    /// Defaults to the primary backend.
    pub auxiliary: Option<BackendConfig>,
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
    pub budget: ContextBudget,
    pub extraction: ExtractorConfig,
    pub citation: CitationConfig,
    pub history: HistoryConfig,
    pub schemas: SchemaStoreConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Fast,      // Cache auxiliary calls aggressively, tight deadlines
    Accurate,  // No cache, LLM citation judge, generous deadlines
    Balanced,  // Default
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Ollama {
        base_url: String,
        model: String,
        #[serde(default = "default_backend_timeout")]
        timeout_secs: u64,
    },
    Gemini {
        model: String,
        /// Name of the environment variable holding the API key.
        api_key_env: String,
        #[serde(default = "default_backend_timeout")]
        timeout_secs: u64,
    },
}

fn default_backend_timeout() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Ollama {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1".to_string(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-process store, optionally seeded from a JSON array of chunks.
    Memory {
        corpus: Option<PathBuf>,
        #[serde(default)]
        embedding: EmbeddingConfig,
    },
    Qdrant {
        url: String,
        collection: String,
        #[serde(default)]
        embedding: EmbeddingConfig,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            corpus: None,
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EmbeddingConfig {
    /// Deterministic feature hashing, no model server needed.
    Hashing { dimension: usize },
    Ollama { base_url: String, model: String },
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig::Hashing { dimension: 512 }
    }
}

/// Per-strategy weights; a strategy with no weight is not run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    pub fetch_k: usize,
    pub num_variants: usize,
    pub metadata_filter_weight: Option<f32>,
    pub query_expansion_weight: Option<f32>,
    pub rerank_weight: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 7,
            fetch_k: 20,
            num_variants: 3,
            metadata_filter_weight: Some(0.5),
            query_expansion_weight: Some(0.5),
            rerank_weight: Some(0.5),
        }
    }
}

impl RetrievalConfig {
    pub fn weights_are_valid(&self) -> bool {
        [self.metadata_filter_weight, self.query_expansion_weight, self.rerank_weight]
            .into_iter()
            .flatten()
            .all(|w| w.is_finite() && w > 0.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CitationConfig {
    /// Ask the auxiliary model which fields a chunk supports instead of
    /// relying on lexical overlap alone.
    pub use_judge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub tail: usize,
    /// JSON file per session; in-memory when unset.
    pub dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { tail: 2, dir: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaStoreConfig {
    /// JSON file per owner; in-memory when unset.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub strategy_timeout_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            strategy_timeout_ms: 10_000,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// When set, each request writes `<dir>/<request_id>/structured.json`
    /// and `citations.json`.
    pub dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Balanced,
            backend: BackendConfig::default(),
            fallback: None,
            auxiliary: None,
            store: StoreConfig::default(),
            retrieval: RetrievalConfig::default(),
            budget: ContextBudget::default(),
            extraction: ExtractorConfig::default(),
            citation: CitationConfig::default(),
            history: HistoryConfig::default(),
            schemas: SchemaStoreConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn fast_mode() -> Self {
        Self {
            mode: OperationMode::Fast,
            retrieval: RetrievalConfig {
                num_variants: 2,
                rerank_weight: None,
                ..RetrievalConfig::default()
            },
            extraction: ExtractorConfig {
                max_retries: 1,
                ..ExtractorConfig::default()
            },
            concurrency: ConcurrencyConfig {
                strategy_timeout_ms: 5_000,
                request_timeout_secs: 120,
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 500,
                max_backoff_ms: 5000,
            },
            cache: CacheConfig {
                enabled: true,
                max_entries: 50000,
            },
            ..Self::default()
        }
    }

    pub fn accurate_mode() -> Self {
        Self {
            mode: OperationMode::Accurate,
            retrieval: RetrievalConfig {
                fetch_k: 40,
                num_variants: 5,
                ..RetrievalConfig::default()
            },
            extraction: ExtractorConfig {
                max_retries: 3,
                ..ExtractorConfig::default()
            },
            citation: CitationConfig { use_judge: true },
            concurrency: ConcurrencyConfig {
                strategy_timeout_ms: 30_000,
                request_timeout_secs: 600,
            },
            retry: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 2000,
                max_backoff_ms: 20000,
            },
            cache: CacheConfig {
                enabled: false,
                max_entries: 0,
            },
            ..Self::default()
        }
    }

    /// Reads the file named by `SCIEXTRACT_CONFIG`, else `sciextract.toml`.
    /// A missing file means defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&raw).with_context(|| format!("Invalid config {}", path.display()))?;
        info!(path = %path.display(), mode = ?config.mode, "Loaded config");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(raw).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retrieval.k == 0 {
            anyhow::bail!("retrieval.k must be at least 1");
        }
        if self.budget.max_chunks == 0 {
            anyhow::bail!("budget.max_chunks must be at least 1");
        }
        if !self.retrieval.weights_are_valid() {
            anyhow::bail!("retrieval weights must be positive numbers");
        }
        if self.concurrency.strategy_timeout_ms == 0 {
            anyhow::bail!("concurrency.strategy_timeout_ms must be positive");
        }
        Ok(())
    }
}
