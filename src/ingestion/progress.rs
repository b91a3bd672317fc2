//! Progress log writer for one ingestion run.

use crate::catalog::{ArtifactRepository, CatalogError, ProgressEntry};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use uuid::Uuid;

/// First and last progress values of the embedding phase.
pub const EMBED_PROGRESS_START: u8 = 40;
/// Progress reached once every chunk is embedded.
pub const EMBED_PROGRESS_END: u8 = 80;

/// Appends timestamped entries to an artifact's progress log.
pub struct ProgressTracker {
    artifacts: Arc<dyn ArtifactRepository>,
    artifact_id: Uuid,
    last: AtomicU8,
}

impl ProgressTracker {
    /// Tracker writing to `artifact_id`'s log.
    pub fn new(artifacts: Arc<dyn ArtifactRepository>, artifact_id: Uuid) -> Self {
        Self {
            artifacts,
            artifact_id,
            last: AtomicU8::new(0),
        }
    }

    /// Progress value of the most recent entry.
    pub fn last(&self) -> u8 {
        self.last.load(Ordering::Relaxed)
    }

    /// Append an entry.
    pub async fn log(&self, message: impl Into<String>, progress: u8) -> Result<(), CatalogError> {
        let entry = ProgressEntry::now(message, progress.min(100));
        tracing::info!(
            artifact_id = %self.artifact_id,
            progress = entry.progress,
            "{}",
            entry.message
        );
        self.artifacts
            .append_progress(self.artifact_id, &entry)
            .await?;
        self.last.store(entry.progress, Ordering::Relaxed);
        Ok(())
    }

    /// Append an entry, logging instead of failing when the write does not go through.
    pub async fn log_best_effort(&self, message: impl Into<String>, progress: u8) {
        if let Err(error) = self.log(message, progress).await {
            tracing::warn!(
                artifact_id = %self.artifact_id,
                error = %error,
                "Failed to append progress entry"
            );
        }
    }
}

/// Progress after `done` of `total` chunks, interpolated across the embedding phase.
pub fn embedding_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return EMBED_PROGRESS_END;
    }
    let span = usize::from(EMBED_PROGRESS_END - EMBED_PROGRESS_START);
    EMBED_PROGRESS_START + (span * done.min(total) / total) as u8
}

/// Whether the `done`-th completion gets its own log entry: the first, the last, every `every`th.
pub fn should_log_completion(done: usize, total: usize, every: usize) -> bool {
    done == 1 || done == total || (every > 0 && done % every == 0)
}
