use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::crawler::Crawler;
use crate::notify::CorpusEvents;
use crate::queue::JobQueue;
use crate::storage::entities::CrawlJob;
use crate::storage::Storage;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_JITTER: Duration = Duration::from_secs(1);

/// A pool of crawl-job consumers. Each worker claims jobs one at a time;
/// jobs are independent and may execute in any order or in parallel.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    storage: Arc<Storage>,
    crawler: Arc<Crawler>,
    events: CorpusEvents,
    workers: usize,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        storage: Arc<Storage>,
        crawler: Arc<Crawler>,
        events: CorpusEvents,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            storage,
            crawler,
            events,
            workers,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut workers = JoinSet::new();

        {
            let mut thread_rng = thread_rng();

            for id in 0..self.workers {
                let rng = SmallRng::from_rng(&mut thread_rng).unwrap();
                let worker = Worker {
                    queue: self.queue.clone(),
                    storage: self.storage.clone(),
                    crawler: self.crawler.clone(),
                    events: self.events.clone(),
                    rng,
                    cancel: cancel.clone(),
                };

                workers.spawn(worker.run().instrument(info_span!("worker", id)));
            }
        }

        while workers.join_next().await.is_some() {}

        Ok(())
    }
}

struct Worker {
    queue: Arc<JobQueue>,
    storage: Arc<Storage>,
    crawler: Arc<Crawler>,
    events: CorpusEvents,
    rng: SmallRng,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                debug!("Received a cancellation signal; exiting");
                break;
            }

            let claimed = match self.queue.claim().await {
                Ok(claimed) => claimed,

                Err(e) => {
                    error!("Could not claim a crawl job: {e:#}");
                    None
                }
            };

            let Some((job_id, job)) = claimed else {
                let jitter = self.rng.gen_range(Duration::ZERO..MAX_POLL_JITTER);

                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Received a cancellation signal; exiting");
                        break;
                    }

                    _ = self.queue.wait_for_work() => {}
                    _ = time::sleep(POLL_INTERVAL + jitter) => {}
                }

                continue;
            };

            // The job boundary: a failure here becomes a status row, never
            // a dead worker.
            if let Err(e) = self.execute(job_id, &job).await {
                error!(job_id, "Crawl job failed: {e:#}");

                if let Err(e) = self.queue.mark_failed(job_id, &format!("{e:#}")).await {
                    error!(job_id, "Could not record the job failure: {e:#}");
                }
            }
        }
    }

    async fn execute(&self, job_id: i64, job: &CrawlJob) -> Result<()> {
        info!(
            job_id,
            category = %job.category,
            owner_id = job.owner_id,
            "Executing a crawl job",
        );

        let result = self.crawler.fetch(&job.category, job.limit).await;

        // A partial batch is still worth keeping; better some articles than
        // none at all.
        let mut written = 0;
        if !result.articles.is_empty() {
            let mut tx = self.storage.begin().await?;
            written = tx
                .insert_articles(job.owner_id, &job.category, &result.articles)
                .await?;
            tx.commit().await?;
        }

        match result.error {
            Some(e) => {
                warn!(
                    job_id, written,
                    "Crawl for `{}` stopped early: {e}", job.category,
                );
                self.queue.mark_failed(job_id, &e.to_string()).await?;
            }

            None => {
                info!(
                    job_id,
                    fetched = result.articles.len(),
                    written,
                    "Stored a crawl batch",
                );
                self.queue.mark_done(job_id).await?;
                self.events.corpus_changed(job.owner_id);
            }
        }

        Ok(())
    }
}
