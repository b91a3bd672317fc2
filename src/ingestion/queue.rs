//! Durable ingestion queue and its worker pool.
//!
//! Jobs live in the [`JobStore`], so a restart loses nothing: [`IngestionQueue::recover`] puts
//! interrupted jobs back in line and re-enqueues artifacts stranded in `processing`. Runs for the
//! same artifact never overlap; a second trigger waits for the first run to finish and then
//! reprocesses from scratch.

use super::IngestionError;
use super::pipeline::{IngestionOutcome, IngestionPipeline};
use crate::catalog::{ArtifactRepository, IngestionJob, JobStore, ProcessingStatus};
use crate::config::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Worker pool and retry tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Concurrent ingestion workers.
    pub workers: usize,
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further attempt.
    pub retry_delay: Duration,
    /// How long an idle worker sleeps before polling for due jobs again.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl QueueSettings {
    /// Settings from process configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.ingestion_workers.max(1),
            max_attempts: config.ingestion_max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_base_delay_ms),
            ..Self::default()
        }
    }

    fn backoff(&self, failed_attempts: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(failed_attempts.saturating_sub(1)))
    }
}

/// What [`IngestionQueue::recover`] put back in line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Jobs found `running` from a previous process.
    pub requeued_jobs: usize,
    /// Artifacts stuck in `processing` that had no queued job.
    pub reenqueued_artifacts: usize,
}

/// Queue front-end plus the workers draining it.
pub struct IngestionQueue {
    jobs: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactRepository>,
    pipeline: Arc<IngestionPipeline>,
    settings: QueueSettings,
    notify: Notify,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl IngestionQueue {
    /// Queue over `jobs`, running `pipeline` for each claimed job.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactRepository>,
        pipeline: Arc<IngestionPipeline>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            jobs,
            artifacts,
            pipeline,
            settings,
            notify: Notify::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an artifact for (re)processing and wake a worker.
    ///
    /// Returns `false` when a job for the artifact was already waiting.
    pub async fn trigger(&self, artifact_id: Uuid) -> Result<bool, IngestionError> {
        self.artifacts.artifact(artifact_id).await?;
        let queued = self.jobs.enqueue(artifact_id).await?;
        tracing::info!(artifact_id = %artifact_id, queued, "Ingestion triggered");
        self.notify.notify_one();
        Ok(queued)
    }

    /// Re-queue work interrupted by a previous shutdown or crash.
    pub async fn recover(&self) -> Result<RecoveryReport, IngestionError> {
        let requeued_jobs = self.jobs.requeue_interrupted().await?;
        let mut reenqueued_artifacts = 0;
        for artifact_id in self
            .artifacts
            .artifacts_in_status(ProcessingStatus::Processing)
            .await?
        {
            if self.jobs.enqueue(artifact_id).await? {
                reenqueued_artifacts += 1;
            }
        }
        let report = RecoveryReport {
            requeued_jobs,
            reenqueued_artifacts,
        };
        tracing::info!(
            requeued_jobs = report.requeued_jobs,
            reenqueued_artifacts = report.reenqueued_artifacts,
            "Recovered ingestion queue"
        );
        if requeued_jobs + reenqueued_artifacts > 0 {
            self.notify.notify_waiters();
        }
        Ok(report)
    }

    /// Spawn the worker pool. Workers exit once `cancel` fires and their current job is done.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers.max(1))
            .map(|worker| {
                let queue = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.work(worker, cancel).await })
            })
            .collect()
    }

    /// Process every job that is due right now, in the calling task. Returns how many ran.
    pub async fn run_pending(&self) -> Result<usize, IngestionError> {
        let mut processed = 0;
        while let Some(job) = self.jobs.claim_next().await? {
            self.process_job(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the pipeline for an artifact now, waiting for any run already in flight for it.
    pub async fn run_now(&self, artifact_id: Uuid) -> Result<IngestionOutcome, IngestionError> {
        let lock = self.artifact_lock(artifact_id);
        let result = {
            let _guard = lock.lock().await;
            self.pipeline.run(artifact_id).await
        };
        self.release_lock(artifact_id, lock);
        result
    }

    async fn work(&self, worker: usize, cancel: CancellationToken) {
        tracing::debug!(worker, "Ingestion worker started");
        while !cancel.is_cancelled() {
            match self.jobs.claim_next().await {
                Ok(Some(job)) => {
                    self.process_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(worker, error = %error, "Failed to claim ingestion job");
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.notify.notified() => {}
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::debug!(worker, "Ingestion worker stopped");
    }

    async fn process_job(&self, job: IngestionJob) {
        let outcome = self.run_now(job.artifact_id).await;
        let stored = match outcome {
            Ok(_) => self.jobs.complete_job(job.id).await,
            Err(error) => {
                let message = error.to_string();
                let failed_attempts = job.attempts + 1;
                if error.is_transient() && failed_attempts < self.settings.max_attempts {
                    let delay = self.settings.backoff(failed_attempts);
                    tracing::warn!(
                        job_id = job.id,
                        artifact_id = %job.artifact_id,
                        attempt = failed_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Ingestion job will be retried"
                    );
                    self.jobs.reschedule_job(job.id, &message, delay).await
                } else {
                    tracing::error!(
                        job_id = job.id,
                        artifact_id = %job.artifact_id,
                        attempts = failed_attempts,
                        error = %message,
                        "Ingestion job abandoned"
                    );
                    self.jobs.abandon_job(job.id, &message).await
                }
            }
        };
        if let Err(error) = stored {
            tracing::error!(job_id = job.id, error = %error, "Failed to update ingestion job");
        }
    }

    fn artifact_lock(&self, artifact_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(artifact_id).or_default())
    }

    fn release_lock(&self, artifact_id: Uuid, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        // Only the map still holds it: nobody is running or waiting.
        if locks
            .get(&artifact_id)
            .is_some_and(|held| Arc::strong_count(held) == 1)
        {
            locks.remove(&artifact_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        ArtifactKind, NewArtifact, OrganizationPolicy, ProviderSettings, SqliteCatalog,
    };
    use crate::index::MemoryChunkIndex;
    use crate::ingestion::IngestionSettings;
    use crate::metrics::ServiceMetrics;
    use crate::testing::{ScriptedProvider, StaticResolver};

    const ORG: Uuid = Uuid::from_u128(1);

    fn setup() -> (Arc<SqliteCatalog>, Arc<ScriptedProvider>, Arc<IngestionQueue>) {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        catalog
            .create_organization(
                ORG,
                "Acme",
                &ProviderSettings::default(),
                OrganizationPolicy::default(),
            )
            .expect("org");
        let provider = Arc::new(ScriptedProvider::new(16));
        let pipeline = Arc::new(IngestionPipeline::new(
            catalog.clone(),
            catalog.clone(),
            Arc::new(MemoryChunkIndex::new(16)),
            Arc::new(StaticResolver::new(provider.clone())),
            Arc::new(ServiceMetrics::new()),
            IngestionSettings::default(),
        ));
        let settings = QueueSettings {
            workers: 1,
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
        };
        let queue = Arc::new(IngestionQueue::new(
            catalog.clone(),
            catalog.clone(),
            pipeline,
            settings,
        ));
        (catalog, provider, queue)
    }

    fn add_document(catalog: &SqliteCatalog, id: u128) -> Uuid {
        let id = Uuid::from_u128(id);
        catalog
            .create_artifact(&NewArtifact {
                id,
                organization_id: ORG,
                division_id: None,
                kind: ArtifactKind::Document,
                title: "Travel policy".into(),
                file_name: Some("travel.txt".into()),
                media_type: "text/plain".into(),
                summary: None,
                content: b"Book flights at least two weeks ahead of travel.".to_vec(),
            })
            .expect("artifact");
        id
    }

    #[test]
    fn backoff_doubles_per_failed_attempt() {
        let settings = QueueSettings {
            retry_delay: Duration::from_secs(3),
            ..QueueSettings::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_secs(3));
        assert_eq!(settings.backoff(2), Duration::from_secs(6));
        assert_eq!(settings.backoff(3), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn trigger_rejects_unknown_artifacts() {
        let (_, _, queue) = setup();
        let error = queue
            .trigger(Uuid::from_u128(404))
            .await
            .expect_err("missing artifact");
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn duplicate_triggers_share_one_queued_job() {
        let (catalog, _, queue) = setup();
        let id = add_document(&catalog, 20);

        assert!(queue.trigger(id).await.expect("first"));
        assert!(!queue.trigger(id).await.expect("second"));
        assert_eq!(queue.run_pending().await.expect("drain"), 1);

        assert_eq!(
            catalog.job_states(id).expect("jobs"),
            vec![("completed".to_string(), 0)]
        );
        let record = catalog.artifact(id).await.expect("record");
        assert_eq!(record.status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let (catalog, provider, queue) = setup();
        let id = add_document(&catalog, 21);
        provider.fail_embeddings("invalid api key");

        queue.trigger(id).await.expect("trigger");
        assert_eq!(queue.run_pending().await.expect("drain"), 1);

        assert_eq!(
            catalog.job_states(id).expect("jobs"),
            vec![("failed".to_string(), 1)]
        );
        let record = catalog.artifact(id).await.expect("record");
        assert_eq!(record.status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn recovery_reenqueues_artifacts_stranded_in_processing() {
        let (catalog, _, queue) = setup();
        let id = add_document(&catalog, 22);
        catalog.begin_processing(id).await.expect("begin");

        let report = queue.recover().await.expect("recover");
        assert_eq!(
            report,
            RecoveryReport {
                requeued_jobs: 0,
                reenqueued_artifacts: 1
            }
        );
        assert_eq!(queue.run_pending().await.expect("drain"), 1);
        let record = catalog.artifact(id).await.expect("record");
        assert_eq!(record.status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn workers_pick_up_triggered_jobs_and_stop_on_cancel() {
        let (catalog, _, queue) = setup();
        let id = add_document(&catalog, 23);
        let cancel = CancellationToken::new();
        let handles = queue.start(cancel.clone());

        queue.trigger(id).await.expect("trigger");
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = catalog.artifact(id).await.expect("record");
                if record.status == ProcessingStatus::Completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job finished in time");

        cancel.cancel();
        for handle in handles {
            handle.await.expect("worker exits cleanly");
        }
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_artifact_are_serialized() {
        let (catalog, _, queue) = setup();
        let id = add_document(&catalog, 24);

        let (first, second) = tokio::join!(queue.run_now(id), queue.run_now(id));
        let versions = [
            first.expect("first").embedding_version,
            second.expect("second").embedding_version,
        ];
        assert!(versions.contains(&1) && versions.contains(&2));
        assert!(queue.locks.lock().expect("locks").is_empty());
    }
}
