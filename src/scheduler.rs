use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::Config;
use crate::queue::JobQueue;
use crate::storage::entities::CrawlJob;
use crate::storage::Storage;
use crate::trend::TrendAggregator;

/// Owns the two periodic triggers of the pipeline: the ingestion timer
/// (one crawl job per category subscription) and the trend timer (one
/// aggregation pass per owner). The timers are independent; their only
/// shared state is the storage underneath.
pub struct Scheduler {
    storage: Arc<Storage>,
    queue: Arc<JobQueue>,
    aggregator: Arc<TrendAggregator>,
    crawl_interval: Duration,
    trend_interval: Duration,
    trend_window: Duration,
    article_limit: u32,
    state: State,
}

enum State {
    Stopped,
    Running {
        cancel: CancellationToken,
        timers: JoinSet<()>,
    },
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        queue: Arc<JobQueue>,
        aggregator: Arc<TrendAggregator>,
        cfg: &Config,
    ) -> Self {
        Self {
            storage,
            queue,
            aggregator,
            crawl_interval: cfg.crawl_interval.into(),
            trend_interval: cfg.trend_interval.into(),
            trend_window: cfg.trend_window.into(),
            article_limit: cfg.article_limit,
            state: State::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Registers both timers and starts them. Calling this while already
    /// running is a no-op.
    pub fn start(&mut self, shutdown: &CancellationToken) {
        if self.is_running() {
            return;
        }

        let cancel = shutdown.child_token();
        let mut timers = JoinSet::new();

        timers.spawn(
            ingest_timer(
                self.storage.clone(),
                self.queue.clone(),
                self.article_limit,
                self.crawl_interval,
                cancel.clone(),
            )
            .instrument(info_span!("ingest_timer")),
        );
        timers.spawn(
            trend_timer(
                self.storage.clone(),
                self.aggregator.clone(),
                self.trend_window,
                self.trend_interval,
                cancel.clone(),
            )
            .instrument(info_span!("trend_timer")),
        );

        self.state = State::Running { cancel, timers };
        info!("Scheduler started");
    }

    /// Cancels the timers and waits for them to exit. Jobs already claimed
    /// by workers keep running; no new jobs are enqueued past this point.
    pub async fn stop(&mut self) {
        match mem::replace(&mut self.state, State::Stopped) {
            State::Stopped => {}

            State::Running { cancel, mut timers } => {
                cancel.cancel();
                while timers.join_next().await.is_some() {}
                info!("Scheduler stopped");
            }
        }
    }
}

async fn ingest_timer(
    storage: Arc<Storage>,
    queue: Arc<JobQueue>,
    article_limit: u32,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut timer = time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Received a cancellation signal; exiting");
                break;
            }

            _ = timer.tick() => {}
        }

        if let Err(e) = enqueue_subscribed_crawls(&storage, &queue, article_limit).await {
            error!("Could not enqueue the scheduled crawl jobs: {e:#}");
        }
    }
}

async fn enqueue_subscribed_crawls(
    storage: &Storage,
    queue: &JobQueue,
    article_limit: u32,
) -> Result<()> {
    let mut tx = storage.begin().await?;
    let subscriptions = tx.subscriptions().await?;
    tx.commit().await?;

    if subscriptions.is_empty() {
        debug!("No category subscriptions; nothing to crawl");
        return Ok(());
    }

    let count = subscriptions.len();

    for subscription in subscriptions {
        queue
            .enqueue(CrawlJob {
                category: subscription.name,
                owner_id: subscription.owner_id,
                limit: article_limit,
            })
            .await?;
    }

    info!(jobs = count, "Enqueued the scheduled crawl jobs");

    Ok(())
}

async fn trend_timer(
    storage: Arc<Storage>,
    aggregator: Arc<TrendAggregator>,
    window: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut timer = time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Received a cancellation signal; exiting");
                break;
            }

            _ = timer.tick() => {}
        }

        if let Err(e) = recompute_subscribed_trends(&storage, &aggregator, window).await {
            error!("Could not recompute trends: {e:#}");
        }
    }
}

async fn recompute_subscribed_trends(
    storage: &Storage,
    aggregator: &TrendAggregator,
    window: Duration,
) -> Result<()> {
    let mut tx = storage.begin().await?;
    let subscriptions = tx.subscriptions().await?;
    tx.commit().await?;

    let mut keywords_by_owner: BTreeMap<i64, Vec<String>> = BTreeMap::new();

    for subscription in subscriptions {
        keywords_by_owner
            .entry(subscription.owner_id)
            .or_default()
            .push(subscription.name);
    }

    // One owner's failure must not starve the others out of their cycle.
    for (owner_id, keywords) in keywords_by_owner {
        match aggregator.recompute(owner_id, &keywords, window).await {
            Ok(0) => {}
            Ok(appended) => info!(owner_id, appended, "Appended trend snapshots"),
            Err(e) => error!(owner_id, "Could not recompute trends: {e:#}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::storage::entities::NewArticle;
    use crate::trend::WordTokenizer;

    use super::*;

    async fn open() -> (tempfile::TempDir, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("newspulse.sqlite3"))
            .await
            .unwrap();

        (dir, Arc::new(storage))
    }

    fn make_scheduler(storage: Arc<Storage>, queue: Arc<JobQueue>, cfg: &Config) -> Scheduler {
        let aggregator = Arc::new(TrendAggregator::new(
            storage.clone(),
            Box::new(WordTokenizer),
        ));

        Scheduler::new(storage, queue, aggregator, cfg)
    }

    fn fast_config(crawl_interval: Duration, trend_interval: Duration) -> Config {
        Config {
            crawl_interval: crawl_interval.into(),
            trend_interval: trend_interval.into(),
            ..Config::default()
        }
    }

    const LONG: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn start_and_stop_drive_the_state_machine() {
        let (_dir, storage) = open().await;
        let queue = Arc::new(JobQueue::new(storage.clone()));
        let mut scheduler = make_scheduler(storage, queue, &fast_config(LONG, LONG));

        assert!(!scheduler.is_running());

        let shutdown = CancellationToken::new();
        scheduler.start(&shutdown);
        assert!(scheduler.is_running());
        scheduler.start(&shutdown);
        assert!(scheduler.is_running());

        scheduler.stop().await;
        assert!(!scheduler.is_running());
        scheduler.stop().await;

        scheduler.start(&shutdown);
        assert!(scheduler.is_running());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn the_ingest_timer_enqueues_one_job_per_subscription() {
        let (_dir, storage) = open().await;
        let queue = Arc::new(JobQueue::new(storage.clone()));

        let mut tx = storage.begin().await.unwrap();
        tx.add_subscription("economy", 7).await.unwrap();
        tx.add_subscription("politics", 8).await.unwrap();
        tx.commit().await.unwrap();

        let mut scheduler = make_scheduler(
            storage,
            queue.clone(),
            &fast_config(Duration::from_millis(50), LONG),
        );

        let shutdown = CancellationToken::new();
        scheduler.start(&shutdown);
        time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        let mut categories = Vec::new();
        while let Some((_, job)) = queue.claim().await.unwrap() {
            assert_eq!(job.limit, 10);
            categories.push((job.category, job.owner_id));
        }
        assert!(categories.contains(&("economy".into(), 7)));
        assert!(categories.contains(&("politics".into(), 8)));

        // Stopped means stopped: nothing new shows up afterwards.
        time::sleep(Duration::from_millis(200)).await;
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn the_trend_timer_aggregates_per_owner() {
        let (_dir, storage) = open().await;
        let queue = Arc::new(JobQueue::new(storage.clone()));

        let mut tx = storage.begin().await.unwrap();
        tx.add_subscription("economy", 7).await.unwrap();
        tx.insert_articles(
            7,
            "economy",
            &[NewArticle {
                title: "Economy rebounds".into(),
                description: "The economy grew".into(),
                url: "https://example.com/1".into(),
                published_at: Some(::time::OffsetDateTime::now_utc()),
                source: None,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let mut scheduler = make_scheduler(
            storage.clone(),
            queue,
            &fast_config(LONG, Duration::from_millis(50)),
        );

        let shutdown = CancellationToken::new();
        scheduler.start(&shutdown);
        time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        let mut tx = storage.begin().await.unwrap();
        let series = tx.trend_series(7, "economy").await.unwrap();
        tx.commit().await.unwrap();

        assert!(!series.is_empty());
        assert_eq!(series[0].count, 2);
    }
}
