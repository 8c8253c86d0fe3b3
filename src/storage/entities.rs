use sqlx::FromRow;
use time::OffsetDateTime;

/// An article produced by the crawler, not yet stored.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub description: String,
    pub url: String,
    pub published_at: Option<OffsetDateTime>,
    pub source: Option<String>,
}

/// A stored article. Rows are immutable once inserted; the `url` column is
/// unique across all owners and categories.
#[allow(dead_code)]
#[derive(FromRow, Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub url: String,
    pub published_at: Option<OffsetDateTime>,
    pub source: Option<String>,
    pub category: String,
    pub owner_id: i64,
}

/// One owner's interest in a topic. Drives both crawl-job enumeration and
/// trend-keyword enumeration.
#[derive(FromRow, Debug, Clone)]
pub struct Subscription {
    pub name: String,
    pub owner_id: i64,
}

/// A single keyword-frequency measurement. Append-only: one row per
/// aggregation cycle per (owner, category), never updated in place.
#[allow(dead_code)]
#[derive(FromRow, Debug, Clone)]
pub struct TrendPoint {
    pub category: String,
    pub count: i64,
    pub time: OffsetDateTime,
    pub owner_id: i64,
}

/// The unit of work carried by the job queue: fetch up to `limit` articles
/// for one (category, owner) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlJob {
    pub category: String,
    pub owner_id: i64,
    pub limit: u32,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// A queue row as persisted, including its outcome.
#[allow(dead_code)]
#[derive(FromRow, Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub category: String,
    pub owner_id: i64,
    pub article_limit: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub enqueued_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

#[derive(FromRow, Debug, Clone)]
pub(crate) struct ClaimedRow {
    pub id: i64,
    pub category: String,
    pub owner_id: i64,
    pub article_limit: i64,
}
