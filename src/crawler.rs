use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex_lite::Regex;
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, error, instrument, warn};

use crate::storage::entities::NewArticle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Result items per search page for this data source.
const PAGE_SIZE: u32 = 10;

/// Why a crawl stopped early. Operators need to tell a scraping defense
/// (`Blocked`) apart from an ordinary upstream failure.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("the source denied access (HTTP {0})")]
    Blocked(StatusCode),

    #[error("the source returned HTTP {0}")]
    Status(StatusCode),

    #[error("could not reach the source: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A fully materialized crawl batch. `error` carries the failure that cut
/// pagination short, if any; the articles collected before it are kept.
#[derive(Debug)]
pub struct CrawlResult {
    pub articles: Vec<NewArticle>,
    pub error: Option<CrawlError>,
}

pub struct Crawler {
    http: reqwest::Client,
    search_url: String,
    page_delay: Duration,
}

impl Crawler {
    pub fn new(search_url: &str, request_timeout: Duration, page_delay: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .user_agent(concat!("newspulse/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("could not create an HTTP client")?;

        Ok(Self {
            http,
            search_url: search_url.into(),
            page_delay,
        })
    }

    /// Fetches up to `limit` articles for `query`, walking search pages in
    /// order. The batch is collected eagerly: the caller gets the complete
    /// set to deduplicate in one write. Stops on the limit, an empty page,
    /// or the first failed page fetch; a failure never discards what was
    /// already collected.
    #[instrument(level = "DEBUG", skip(self))]
    pub async fn fetch(&self, query: &str, limit: u32) -> CrawlResult {
        let mut articles: Vec<NewArticle> = Vec::new();
        let mut offset = 1;

        loop {
            let body = match self.fetch_page(query, offset).await {
                Ok(body) => body,

                Err(e) => {
                    match &e {
                        CrawlError::Blocked(status) => warn!(
                            %query, %status,
                            "The news source denied access; stopping pagination",
                        ),
                        _ => error!(%query, "Could not fetch a search page: {e}"),
                    }

                    return CrawlResult {
                        articles,
                        error: Some(e),
                    };
                }
            };

            let page = parse_page(&body, OffsetDateTime::now_utc());
            if page.is_empty() {
                debug!(%query, offset, "Reached an empty search page");
                break;
            }

            for article in page {
                articles.push(article);

                if articles.len() >= limit as usize {
                    break;
                }
            }

            if articles.len() >= limit as usize {
                debug!(%query, limit, "Reached the article limit");
                break;
            }

            offset += PAGE_SIZE;
            tokio::time::sleep(self.page_delay).await;
        }

        CrawlResult {
            articles,
            error: None,
        }
    }

    async fn fetch_page(&self, query: &str, offset: u32) -> Result<String, CrawlError> {
        let url = format!(
            "{}?where=news&query={}&start={}",
            self.search_url,
            urlencoding::encode(query),
            offset,
        );
        debug!(%url, "Requesting a search page");

        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CrawlError::Blocked(status));
        }

        if !status.is_success() {
            return Err(CrawlError::Status(status));
        }

        Ok(response.text().await?)
    }
}

/// Parses one search page into article records. Items missing a link or a
/// title are skipped; a date that cannot be understood becomes `None`
/// rather than dropping the item.
fn parse_page(html: &str, now: OffsetDateTime) -> Vec<NewArticle> {
    let item_selector = Selector::parse(".news_wrap").unwrap();
    let title_selector = Selector::parse(".news_tit").unwrap();
    let description_selector = Selector::parse(".dsc_wrap").unwrap();
    let info_selector = Selector::parse(".info_group .info").unwrap();

    let document = Html::parse_document(html);
    let mut articles = Vec::new();

    for (idx, item) in document.select(&item_selector).enumerate() {
        let idx = idx + 1;

        let Some(link) = item.select(&title_selector).next() else {
            debug!("Result item #{idx} has no title link; skipping");
            continue;
        };

        let Some(url) = link.value().attr("href").filter(|href| !href.is_empty()) else {
            debug!("Result item #{idx} has no article URL; skipping");
            continue;
        };

        let title = link
            .value()
            .attr("title")
            .map(str::to_owned)
            .unwrap_or_else(|| collect_text(&link));
        if title.is_empty() {
            debug!("Result item #{idx} has no title; skipping");
            continue;
        }

        let description = item
            .select(&description_selector)
            .next()
            .map(|element| collect_text(&element))
            .unwrap_or_default();

        let infos: Vec<String> = item
            .select(&info_selector)
            .map(|element| collect_text(&element))
            .filter(|text| !text.is_empty())
            .collect();
        let source = infos.first().cloned();
        let published_at = infos.iter().find_map(|text| normalize_date(text, now));

        articles.push(NewArticle {
            title,
            description,
            url: url.into(),
            published_at,
            source,
        });
    }

    articles
}

fn collect_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Turns the source's date label into an absolute timestamp. The source
/// renders either an absolute `YYYY.MM.DD.` date or a relative age in its
/// locale (`N분 전` / `N시간 전` / `N일 전`), measured against `now`.
fn normalize_date(text: &str, now: OffsetDateTime) -> Option<OffsetDateTime> {
    static MAGNITUDE: OnceLock<Regex> = OnceLock::new();
    static ABSOLUTE: OnceLock<Regex> = OnceLock::new();

    let text = text.trim();

    if text.contains('전') {
        let magnitude = MAGNITUDE.get_or_init(|| Regex::new(r"\d+").unwrap());
        let value: i64 = magnitude.find(text)?.as_str().parse().ok()?;

        return if text.contains('분') {
            Some(now - time::Duration::minutes(value))
        } else if text.contains("시간") {
            Some(now - time::Duration::hours(value))
        } else if text.contains('일') {
            Some(now - time::Duration::days(value))
        } else {
            None
        };
    }

    let absolute = ABSOLUTE.get_or_init(|| Regex::new(r"^\d{4}\.\d{2}\.\d{2}\.$").unwrap());
    if absolute.is_match(text) {
        static DATE_FORMAT: &[BorrowedFormatItem<'_>] =
            format_description!("[year].[month].[day].");

        let date = Date::parse(text, DATE_FORMAT).ok()?;
        return Some(date.midnight().assume_utc());
    }

    None
}

#[cfg(test)]
pub(crate) mod testserver {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves HTTP responses computed from the request's `start=` query
    /// parameter. Returns the base URL to point a [`Crawler`] at.
    ///
    /// [`Crawler`]: super::Crawler
    pub(crate) async fn serve(page: fn(u32) -> (u16, String)) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };

                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).into_owned();

                    let start = request
                        .split_whitespace()
                        .nth(1)
                        .and_then(|path| path.split("start=").nth(1))
                        .and_then(|value| value.split('&').next())
                        .and_then(|value| value.parse().ok())
                        .unwrap_or(1);

                    let (status, body) = page(start);
                    let response = format!(
                        "HTTP/1.1 {status} X\r\n\
                            content-type: text/html; charset=utf-8\r\n\
                            content-length: {}\r\n\
                            connection: close\r\n\r\n{body}",
                        body.len(),
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        format!("http://{addr}/search")
    }

    pub(crate) fn result_page(items: impl IntoIterator<Item = u32>) -> String {
        let mut body = String::from("<html><body>");

        for n in items {
            body.push_str(&format!(
                r#"<div class="news_wrap">
                  <a class="news_tit" href="https://news.example.com/{n}" title="Article {n}">Article {n}</a>
                  <div class="dsc_wrap">Description {n}</div>
                  <div class="info_group">
                    <span class="info">Press {n}</span>
                    <span class="info">3시간 전</span>
                  </div>
                </div>"#
            ));
        }

        body.push_str("</body></html>");
        body
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-12-03 12:00 UTC);

    fn crawler(search_url: &str) -> Crawler {
        Crawler::new(search_url, Duration::from_secs(5), Duration::ZERO).unwrap()
    }

    #[test]
    fn absolute_dates_parse_to_midnight() {
        assert_eq!(
            normalize_date("2024.12.03.", NOW),
            Some(datetime!(2024-12-03 0:00 UTC)),
        );
    }

    #[test]
    fn relative_dates_subtract_from_now() {
        assert_eq!(
            normalize_date("30분 전", NOW),
            Some(NOW - time::Duration::minutes(30)),
        );
        assert_eq!(
            normalize_date("2시간 전", NOW),
            Some(NOW - time::Duration::hours(2)),
        );
        assert_eq!(
            normalize_date("3일 전", NOW),
            Some(NOW - time::Duration::days(3)),
        );
    }

    #[test]
    fn unintelligible_dates_become_none() {
        assert_eq!(normalize_date("방금 전", NOW), None);
        assert_eq!(normalize_date("전자신문", NOW), None);
        assert_eq!(normalize_date("2024.12.03", NOW), None);
        assert_eq!(normalize_date("A12면 1단", NOW), None);
        assert_eq!(normalize_date("", NOW), None);
    }

    #[test]
    fn parses_result_items() {
        let html = r#"
            <div class="news_wrap">
              <a class="news_tit" href="https://news.example.com/1" title="Rates cut again">Rates cut…</a>
              <div class="dsc_wrap">  The central
                bank   cut rates.  </div>
              <div class="info_group">
                <span class="info">Daily Economy</span>
                <span class="info">2024.12.01.</span>
              </div>
            </div>
            <div class="news_wrap">
              <a class="news_tit" href="https://news.example.com/2">Untitled attribute</a>
              <div class="info_group"><span class="info">Herald</span></div>
            </div>
        "#;

        let articles = parse_page(html, NOW);
        assert_eq!(articles.len(), 2);

        assert_eq!(articles[0].title, "Rates cut again");
        assert_eq!(articles[0].url, "https://news.example.com/1");
        assert_eq!(articles[0].description, "The central bank cut rates.");
        assert_eq!(articles[0].source.as_deref(), Some("Daily Economy"));
        assert_eq!(
            articles[0].published_at,
            Some(datetime!(2024-12-01 0:00 UTC)),
        );

        // Falls back to the link text and tolerates a missing date.
        assert_eq!(articles[1].title, "Untitled attribute");
        assert_eq!(articles[1].published_at, None);
    }

    #[test]
    fn malformed_items_are_skipped() {
        let html = r#"
            <div class="news_wrap"><div class="dsc_wrap">No link at all</div></div>
            <div class="news_wrap"><a class="news_tit" href="">Empty href</a></div>
            <div class="news_wrap">
              <a class="news_tit" href="https://news.example.com/ok" title="Fine">Fine</a>
            </div>
        "#;

        let articles = parse_page(html, NOW);
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].url, "https://news.example.com/ok");
    }

    #[tokio::test]
    async fn stops_at_the_article_limit() {
        let url = testserver::serve(|start| match start {
            1 => (200, testserver::result_page(1..=10)),
            11 => (200, testserver::result_page(11..=20)),
            _ => (200, testserver::result_page(std::iter::empty())),
        })
        .await;

        let result = crawler(&url).fetch("economy", 12).await;
        assert!(result.error.is_none());
        assert_eq!(result.articles.len(), 12);
        assert_eq!(result.articles[11].url, "https://news.example.com/12");
    }

    #[tokio::test]
    async fn stops_when_the_source_is_exhausted() {
        let url = testserver::serve(|start| match start {
            1 => (200, testserver::result_page(1..=10)),
            11 => (200, testserver::result_page(11..=13)),
            _ => (200, testserver::result_page(std::iter::empty())),
        })
        .await;

        let result = crawler(&url).fetch("economy", 30).await;
        assert!(result.error.is_none());
        assert_eq!(result.articles.len(), 13);
    }

    #[tokio::test]
    async fn a_block_keeps_the_partial_batch() {
        let url = testserver::serve(|start| match start {
            1 => (200, testserver::result_page(1..=10)),
            _ => (403, String::new()),
        })
        .await;

        let result = crawler(&url).fetch("economy", 30).await;
        assert_eq!(result.articles.len(), 10);
        assert!(matches!(
            result.error,
            Some(CrawlError::Blocked(status)) if status == StatusCode::FORBIDDEN,
        ));
    }

    #[tokio::test]
    async fn an_unreachable_source_reports_a_transport_error() {
        let result = crawler("http://127.0.0.1:1/search").fetch("economy", 10).await;
        assert!(result.articles.is_empty());
        assert!(matches!(result.error, Some(CrawlError::Transport(_))));
    }
}
