pub mod entities;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use self::entities::{
    Article, ClaimedRow, CrawlJob, JobRecord, JobStatus, NewArticle, Subscription, TrendPoint,
};

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .foreign_keys(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .create_if_missing(true),
            )
            .await
            .with_context(|| anyhow!("could not open a SQLite database `{}`", db_path.display()))?;
        info!("Using an SQLite database `{}`", db_path.display());
        sqlx::migrate!()
            .run(&pool)
            .await
            .with_context(|| anyhow!("could not prepare a database schema"))?;

        Ok(Self { pool })
    }

    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .context("could not begin a new DB transaction")
            .map(Tx)
    }
}

pub struct Tx(Transaction<'static, Sqlite>);

impl Tx {
    pub async fn commit(self) -> Result<()> {
        self.0
            .commit()
            .await
            .context("could not commit a DB transaction")
    }

    /// Stores a crawled batch for `(owner_id, category)`, skipping every
    /// article whose URL is already present (regardless of which owner or
    /// category stored it first). Returns the number of net-new rows, not
    /// the batch size.
    #[instrument(level = "TRACE", skip(self, articles), fields(article_count = articles.len()))]
    pub async fn insert_articles(
        &mut self,
        owner_id: i64,
        category: &str,
        articles: &[NewArticle],
    ) -> Result<u64> {
        let mut written = 0;

        for article in articles {
            debug!(%article.url, "Storing article");
            let result = sqlx::query(
                "INSERT
                INTO news (title, description, url, published_at, source, category, owner_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT (url) DO NOTHING",
            )
            .bind(&article.title)
            .bind(&article.description)
            .bind(&article.url)
            .bind(article.published_at)
            .bind(&article.source)
            .bind(category)
            .bind(owner_id)
            .execute(self.0.as_mut())
            .await
            .context("could not insert an article")?;

            written += result.rows_affected();
        }

        Ok(written)
    }

    /// Registers an owner's interest in a category. A duplicate
    /// subscription is a no-op; returns whether a row was created.
    #[allow(dead_code)]
    #[instrument(level = "TRACE", skip(self))]
    pub async fn add_subscription(&mut self, name: &str, owner_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT
            INTO category_subscription (name, owner_id)
            VALUES (?1, ?2)
            ON CONFLICT (name, owner_id) DO NOTHING",
        )
        .bind(name)
        .bind(owner_id)
        .execute(self.0.as_mut())
        .await
        .context("could not insert a category subscription")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn subscriptions(&mut self) -> Result<Vec<Subscription>> {
        sqlx::query_as(
            "SELECT name, owner_id
            FROM category_subscription
            ORDER BY owner_id ASC, name ASC",
        )
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve category subscriptions")
    }

    /// Selects the owner's articles for trend aggregation. Articles whose
    /// publish time is unknown are always included: the source's date
    /// markup is unreliable, and dropping rows the crawler accepted would
    /// understate every measurement.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn articles_for_trends(
        &mut self,
        owner_id: i64,
        cutoff: OffsetDateTime,
    ) -> Result<Vec<Article>> {
        sqlx::query_as(
            "SELECT id, title, description, url, published_at, source, category, owner_id
            FROM news
            WHERE owner_id = ?1 AND (published_at >= ?2 OR published_at IS NULL)",
        )
        .bind(owner_id)
        .bind(cutoff)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve articles for trend aggregation")
    }

    #[instrument(level = "TRACE", skip(self, counts), fields(keyword_count = counts.len()))]
    pub async fn append_trends(
        &mut self,
        owner_id: i64,
        counts: &[(String, u64)],
        at: OffsetDateTime,
    ) -> Result<()> {
        for (category, count) in counts {
            debug!(%category, count, "Appending a trend snapshot");
            sqlx::query(
                "INSERT
                INTO trend (category, count, time, owner_id)
                VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(category)
            .bind(*count as i64)
            .bind(at)
            .bind(owner_id)
            .execute(self.0.as_mut())
            .await
            .context("could not insert a trend snapshot")?;
        }

        Ok(())
    }

    /// Newest-first article listing for the API layer.
    #[allow(dead_code)]
    #[instrument(level = "TRACE", skip(self))]
    pub async fn recent_articles(
        &mut self,
        owner_id: i64,
        category: Option<&str>,
        count: usize,
    ) -> Result<Vec<Article>> {
        let query = match category {
            Some(category) => sqlx::query_as(
                "SELECT id, title, description, url, published_at, source, category, owner_id
                FROM news
                WHERE owner_id = ?1 AND category = ?3
                ORDER BY published_at DESC
                LIMIT ?2",
            )
            .bind(owner_id)
            .bind(count as i64)
            .bind(category),

            None => sqlx::query_as(
                "SELECT id, title, description, url, published_at, source, category, owner_id
                FROM news
                WHERE owner_id = ?1
                ORDER BY published_at DESC
                LIMIT ?2",
            )
            .bind(owner_id)
            .bind(count as i64),
        };

        query
            .fetch_all(self.0.as_mut())
            .await
            .context("could not retrieve recent articles")
    }

    /// Time-ordered snapshot series for the API layer's trend charts.
    #[allow(dead_code)]
    #[instrument(level = "TRACE", skip(self))]
    pub async fn trend_series(
        &mut self,
        owner_id: i64,
        category: &str,
    ) -> Result<Vec<TrendPoint>> {
        sqlx::query_as(
            "SELECT category, count, time, owner_id
            FROM trend
            WHERE owner_id = ?1 AND category = ?2
            ORDER BY time ASC",
        )
        .bind(owner_id)
        .bind(category)
        .fetch_all(self.0.as_mut())
        .await
        .context("could not retrieve a trend series")
    }

    // Queue rows. The claim/finish protocol lives in `queue`; these methods
    // only own the SQL.

    #[instrument(level = "TRACE", skip(self, job), fields(category = %job.category, owner_id = job.owner_id))]
    pub async fn enqueue_job(&mut self, job: &CrawlJob) -> Result<i64> {
        let now = OffsetDateTime::now_utc();

        sqlx::query_scalar(
            "INSERT
            INTO crawl_jobs (category, owner_id, article_limit, status, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id",
        )
        .bind(&job.category)
        .bind(job.owner_id)
        .bind(job.limit as i64)
        .bind(JobStatus::Queued)
        .bind(now)
        .fetch_one(self.0.as_mut())
        .await
        .context("could not enqueue a crawl job")
    }

    /// Atomically takes ownership of the oldest queued job, if any.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn claim_job(&mut self) -> Result<Option<(i64, CrawlJob)>> {
        let now = OffsetDateTime::now_utc();

        let claimed: Option<ClaimedRow> = sqlx::query_as(
            "UPDATE crawl_jobs
            SET status = ?1, started_at = ?2
            WHERE id = (
              SELECT id
              FROM crawl_jobs
              WHERE status = ?3
              ORDER BY id ASC
              LIMIT 1
            )
            RETURNING id, category, owner_id, article_limit",
        )
        .bind(JobStatus::Running)
        .bind(now)
        .bind(JobStatus::Queued)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not claim a crawl job")?;

        Ok(claimed.map(|row| {
            let job = CrawlJob {
                category: row.category,
                owner_id: row.owner_id,
                limit: row.article_limit as u32,
            };

            (row.id, job)
        }))
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn finish_job(&mut self, id: i64) -> Result<()> {
        let now = OffsetDateTime::now_utc();

        sqlx::query("UPDATE crawl_jobs SET status = ?1, finished_at = ?2 WHERE id = ?3")
            .bind(JobStatus::Done)
            .bind(now)
            .bind(id)
            .execute(self.0.as_mut())
            .await
            .context("could not mark a crawl job as done")?;

        Ok(())
    }

    #[instrument(level = "TRACE", skip(self, error))]
    pub async fn fail_job(&mut self, id: i64, error: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc();

        sqlx::query(
            "UPDATE crawl_jobs SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
        )
        .bind(JobStatus::Failed)
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(self.0.as_mut())
        .await
        .context("could not mark a crawl job as failed")?;

        Ok(())
    }

    /// Puts jobs a dead process left in `running` back into the queue.
    #[instrument(level = "TRACE", skip(self))]
    pub async fn requeue_interrupted_jobs(&mut self) -> Result<u64> {
        let result =
            sqlx::query("UPDATE crawl_jobs SET status = ?1, started_at = NULL WHERE status = ?2")
                .bind(JobStatus::Queued)
                .bind(JobStatus::Running)
                .execute(self.0.as_mut())
                .await
                .context("could not requeue interrupted crawl jobs")?;

        Ok(result.rows_affected())
    }

    #[instrument(level = "TRACE", skip(self))]
    pub async fn job(&mut self, id: i64) -> Result<Option<JobRecord>> {
        sqlx::query_as(
            "SELECT id, category, owner_id, article_limit, status, error,
              enqueued_at, started_at, finished_at
            FROM crawl_jobs
            WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.0.as_mut())
        .await
        .context("could not retrieve a crawl job")
    }
}
