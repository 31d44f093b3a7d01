use extract::ExtractionStatus;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub struct Metrics {
    // Counters
    total_requests: AtomicUsize,
    ok_requests: AtomicUsize,
    degraded_requests: AtomicUsize,
    failed_requests: AtomicUsize,
    cancelled_requests: AtomicUsize,

    // Timing (in microseconds)
    total_retrieval_time_us: AtomicU64,
    total_extraction_time_us: AtomicU64,
    total_citation_time_us: AtomicU64,

    // Counts
    strategy_timeouts: AtomicUsize,
    extraction_attempts: AtomicUsize,
    total_chunks_retrieved: AtomicUsize,
    total_citations: AtomicUsize,
    unsupported_fields: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_requests: AtomicUsize::new(0),
            ok_requests: AtomicUsize::new(0),
            degraded_requests: AtomicUsize::new(0),
            failed_requests: AtomicUsize::new(0),
            cancelled_requests: AtomicUsize::new(0),
            total_retrieval_time_us: AtomicU64::new(0),
            total_extraction_time_us: AtomicU64::new(0),
            total_citation_time_us: AtomicU64::new(0),
            strategy_timeouts: AtomicUsize::new(0),
            extraction_attempts: AtomicUsize::new(0),
            total_chunks_retrieved: AtomicUsize::new(0),
            total_citations: AtomicUsize::new(0),
            unsupported_fields: AtomicUsize::new(0),
        })
    }

    pub fn record_request(&self, status: ExtractionStatus) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match status {
            ExtractionStatus::Ok => self.ok_requests.fetch_add(1, Ordering::Relaxed),
            ExtractionStatus::Degraded => self.degraded_requests.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_failure(&self, cancelled: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.cancelled_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retrieval(&self, duration: Duration, chunks: usize, timeouts: usize) {
        self.total_retrieval_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_chunks_retrieved.fetch_add(chunks, Ordering::Relaxed);
        self.strategy_timeouts.fetch_add(timeouts, Ordering::Relaxed);
    }

    pub fn record_extraction(&self, duration: Duration, attempts: u32) {
        self.total_extraction_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.extraction_attempts.fetch_add(attempts as usize, Ordering::Relaxed);
    }

    pub fn record_citation(&self, duration: Duration, citations: usize, unsupported: usize) {
        self.total_citation_time_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_citations.fetch_add(citations, Ordering::Relaxed);
        self.unsupported_fields.fetch_add(unsupported, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.ok_requests.load(Ordering::Relaxed) + self.degraded_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            ok_requests: self.ok_requests.load(Ordering::Relaxed),
            degraded_requests: self.degraded_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            avg_retrieval_time_ms: avg_time_ms(&self.total_retrieval_time_us, completed),
            avg_extraction_time_ms: avg_time_ms(&self.total_extraction_time_us, completed),
            avg_citation_time_ms: avg_time_ms(&self.total_citation_time_us, completed),
            strategy_timeouts: self.strategy_timeouts.load(Ordering::Relaxed),
            extraction_attempts: self.extraction_attempts.load(Ordering::Relaxed),
            total_chunks_retrieved: self.total_chunks_retrieved.load(Ordering::Relaxed),
            total_citations: self.total_citations.load(Ordering::Relaxed),
            unsupported_fields: self.unsupported_fields.load(Ordering::Relaxed),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: usize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    if count > 0 {
        total / count as f64 / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub ok_requests: usize,
    pub degraded_requests: usize,
    pub failed_requests: usize,
    pub cancelled_requests: usize,
    pub avg_retrieval_time_ms: f64,
    pub avg_extraction_time_ms: f64,
    pub avg_citation_time_ms: f64,
    pub strategy_timeouts: usize,
    pub extraction_attempts: usize,
    pub total_chunks_retrieved: usize,
    pub total_citations: usize,
    pub unsupported_fields: usize,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_by_status() {
        let metrics = Metrics::new();
        metrics.record_request(ExtractionStatus::Ok);
        metrics.record_request(ExtractionStatus::Degraded);
        metrics.record_failure(true);
        metrics.record_retrieval(Duration::from_millis(4), 7, 1);
        metrics.record_retrieval(Duration::from_millis(2), 5, 0);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.ok_requests, 1);
        assert_eq!(snap.degraded_requests, 1);
        assert_eq!(snap.cancelled_requests, 1);
        assert_eq!(snap.strategy_timeouts, 1);
        assert_eq!(snap.total_chunks_retrieved, 12);
        assert!((snap.avg_retrieval_time_ms - 3.0).abs() < 1e-9);
    }
}
