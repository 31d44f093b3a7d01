pub mod aggregate;
pub mod ensemble;
pub mod metadata_filter;
pub mod query_expansion;
pub mod rerank;
pub mod retriever;

pub use aggregate::{ContextBudget, WeightedResult, aggregate};
pub use ensemble::{DegradedStrategy, EnsembleOutcome, EnsembleRetriever};
pub use metadata_filter::MetadataFilterRetriever;
pub use query_expansion::QueryExpansionRetriever;
pub use rerank::{LexicalScorer, RelevanceScorer, RerankRetriever};
pub use retriever::{RetrievalError, RetrievalResult, Retriever, VectorRetriever};
