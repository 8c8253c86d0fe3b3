use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::storage::entities::{CrawlJob, JobRecord};
use crate::storage::Storage;

/// Durable crawl-job channel. Jobs live in the `crawl_jobs` table, so they
/// survive process restarts; delivery is at-least-once (an interrupted job
/// is requeued on the next boot and may therefore run twice), which the
/// dedup store's idempotent writes make harmless.
pub struct JobQueue {
    storage: Arc<Storage>,
    work_available: Notify,
}

impl JobQueue {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            work_available: Notify::new(),
        }
    }

    /// Requeues jobs a previous process claimed but never finished. Call
    /// once on boot, before the workers start.
    pub async fn recover(&self) -> Result<u64> {
        let mut tx = self.storage.begin().await?;
        let requeued = tx.requeue_interrupted_jobs().await?;
        tx.commit().await?;

        if requeued > 0 {
            info!(requeued, "Requeued crawl jobs interrupted by a previous shutdown");
        }

        Ok(requeued)
    }

    /// Adds a job to the queue and wakes an idle worker. Safe to call with
    /// a (category, owner) pair that is already queued or running.
    pub async fn enqueue(&self, job: CrawlJob) -> Result<i64> {
        let mut tx = self.storage.begin().await?;
        let id = tx.enqueue_job(&job).await?;
        tx.commit().await?;

        debug!(id, category = %job.category, owner_id = job.owner_id, "Enqueued a crawl job");
        self.work_available.notify_one();

        Ok(id)
    }

    /// Producer interface for the API layer: one crawl for a freshly
    /// subscribed category.
    #[allow(dead_code)]
    pub async fn enqueue_crawl(&self, category: &str, owner_id: i64, limit: u32) -> Result<i64> {
        self.enqueue(CrawlJob {
            category: category.into(),
            owner_id,
            limit,
        })
        .await
    }

    /// Takes ownership of the oldest queued job, if any.
    pub async fn claim(&self) -> Result<Option<(i64, CrawlJob)>> {
        let mut tx = self.storage.begin().await?;
        let claimed = tx.claim_job().await?;
        tx.commit().await?;

        Ok(claimed)
    }

    pub async fn mark_done(&self, id: i64) -> Result<()> {
        let mut tx = self.storage.begin().await?;
        tx.finish_job(id).await?;
        tx.commit().await
    }

    /// Records a failed execution. Failed jobs are not retried by this
    /// layer; an external policy may re-enqueue them.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let mut tx = self.storage.begin().await?;
        tx.fail_job(id, error).await?;
        tx.commit().await
    }

    #[allow(dead_code)]
    pub async fn status(&self, id: i64) -> Result<Option<JobRecord>> {
        let mut tx = self.storage.begin().await?;
        let record = tx.job(id).await?;
        tx.commit().await?;

        Ok(record)
    }

    /// Resolves once a producer signals new work. Spurious wakeups are
    /// possible; callers must re-check the queue.
    pub async fn wait_for_work(&self) {
        self.work_available.notified().await;
    }
}
