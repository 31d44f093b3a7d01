pub mod cache;
pub mod config;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod retry;

pub use config::AppConfig;
pub use pipeline::{
    ExtractionRequest, ExtractionResponse, ExtractionService, PipelineError, PipelineSettings,
    RequestReport, SchemaDefinition, SchemaRef,
};
