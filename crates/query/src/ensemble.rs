use extract::CancellationToken;
use futures::future::join_all;
use index::ChunkFilter;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::aggregate::{ContextBudget, WeightedResult, aggregate};
use crate::retriever::{RetrievalError, RetrievalResult, Retriever};

pub struct WeightedRetriever {
    pub retriever: Arc<dyn Retriever>,
    pub weight: f32,
}

/// A strategy that contributed nothing this round, and why.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedStrategy {
    pub strategy: String,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsembleOutcome {
    pub result: RetrievalResult,
    pub degraded: Vec<DegradedStrategy>,
}

impl EnsembleOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Runs every strategy concurrently, each under its own deadline, and merges
/// whatever came back.
pub struct EnsembleRetriever {
    strategies: Vec<WeightedRetriever>,
    per_strategy_timeout: Duration,
}

impl EnsembleRetriever {
    pub fn new(per_strategy_timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            per_strategy_timeout,
        }
    }

    pub fn with_strategy(mut self, retriever: Arc<dyn Retriever>, weight: f32) -> Self {
        self.strategies.push(WeightedRetriever { retriever, weight });
        self
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.retriever.name()).collect()
    }

    /// A strategy that times out or errors contributes nothing and is
    /// reported as degraded. Only when every strategy fails outright (and
    /// none merely timed out) does the call fail.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
        budget: &ContextBudget,
        cancel: &CancellationToken,
    ) -> Result<EnsembleOutcome, RetrievalError> {
        let started = Instant::now();
        let timeout = self.per_strategy_timeout;

        let runs = self.strategies.iter().map(|s| async move {
            let began = Instant::now();
            let res = tokio::time::timeout(timeout, s.retriever.retrieve(query, k, filter)).await;
            (s, res, began.elapsed())
        });

        let finished = cancel
            .run(join_all(runs))
            .await
            .ok_or(RetrievalError::Cancelled)?;

        let mut weighted = Vec::new();
        let mut degraded = Vec::new();
        let mut errors = Vec::new();

        for (s, res, elapsed) in finished {
            let name = s.retriever.name().to_string();
            match res {
                Ok(Ok(result)) => {
                    info!(strategy = %name, hits = result.len(), elapsed_ms = elapsed.as_millis() as u64, "Strategy finished");
                    weighted.push(WeightedResult { weight: s.weight, result });
                }
                Ok(Err(e)) => {
                    warn!(strategy = %name, error = %e, "Strategy failed, contributing no results");
                    errors.push(format!("{}: {}", name, e));
                    degraded.push(DegradedStrategy { strategy: name, reason: e.to_string(), timed_out: false });
                }
                Err(_) => {
                    let err = RetrievalError::Timeout {
                        strategy: name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    warn!(strategy = %name, timeout_ms = timeout.as_millis() as u64, "Strategy timed out, contributing no results");
                    degraded.push(DegradedStrategy { strategy: name, reason: err.to_string(), timed_out: true });
                }
            }
        }

        if weighted.is_empty() && !self.strategies.is_empty() && errors.len() == self.strategies.len() {
            return Err(RetrievalError::AllStrategiesFailed(errors.join("; ")));
        }

        let result = aggregate(&weighted, budget);
        info!(
            strategies = self.strategies.len(),
            degraded = degraded.len(),
            chunks = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ensemble retrieval finished"
        );

        Ok(EnsembleOutcome { result, degraded })
    }
}
