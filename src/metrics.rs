use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion and answering activity.
#[derive(Default)]
pub struct ServiceMetrics {
    artifacts_ingested: AtomicU64,
    chunks_indexed: AtomicU64,
    ingestion_failures: AtomicU64,
    answers_streamed: AtomicU64,
    degraded_retrievals: AtomicU64,
}

impl ServiceMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed ingestion run and the number of chunks it persisted.
    pub fn record_ingestion(&self, chunk_count: u64) {
        self.artifacts_ingested.fetch_add(1, Ordering::Relaxed);
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record an ingestion run that ended in the `failed` state.
    pub fn record_ingestion_failure(&self) {
        self.ingestion_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a streamed answer, noting whether retrieval had to be skipped.
    pub fn record_answer(&self, retrieval_degraded: bool) {
        self.answers_streamed.fetch_add(1, Ordering::Relaxed);
        if retrieval_degraded {
            self.degraded_retrievals.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            artifacts_ingested: self.artifacts_ingested.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
            ingestion_failures: self.ingestion_failures.load(Ordering::Relaxed),
            answers_streamed: self.answers_streamed.load(Ordering::Relaxed),
            degraded_retrievals: self.degraded_retrievals.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the service counters used for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Artifacts that completed ingestion since startup.
    pub artifacts_ingested: u64,
    /// Chunks persisted across all completed runs.
    pub chunks_indexed: u64,
    /// Runs that left their artifact in the `failed` state.
    pub ingestion_failures: u64,
    /// Answers streamed by the orchestrator and single-scope chat.
    pub answers_streamed: u64,
    /// Answers produced without context because retrieval failed.
    pub degraded_retrievals: u64,
}
