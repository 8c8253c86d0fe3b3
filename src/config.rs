mod types;

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

pub use self::types::*;

fn default_crawl_interval() -> Duration {
    Config::default().crawl_interval
}

fn default_trend_interval() -> Duration {
    Config::default().trend_interval
}

fn default_trend_window() -> Duration {
    Config::default().trend_window
}

fn default_article_limit() -> u32 {
    Config::default().article_limit
}

fn default_request_timeout() -> Duration {
    Config::default().request_timeout
}

fn default_page_delay() -> Duration {
    Config::default().page_delay
}

fn default_workers() -> usize {
    Config::default().workers
}

fn default_db_path() -> PathBuf {
    Config::default().db_path
}

fn default_search_url() -> String {
    Config::default().search_url
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Search endpoint the crawler paginates over.
    #[serde(default = "default_search_url")]
    pub search_url: String,

    /// How often every subscribed category gets a crawl job.
    #[serde(default = "default_crawl_interval")]
    pub crawl_interval: Duration,

    /// How often every owner gets a trend-aggregation pass.
    #[serde(default = "default_trend_interval")]
    pub trend_interval: Duration,

    /// How far back a trend pass looks for articles.
    #[serde(default = "default_trend_window")]
    pub trend_window: Duration,

    /// Articles fetched per crawl job.
    #[serde(default = "default_article_limit")]
    pub article_limit: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Pause between search pages, so the source does not block us.
    #[serde(default = "default_page_delay")]
    pub page_delay: Duration,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Config {
    pub fn update(&mut self, args: crate::cli::Args) {
        fn set_if_some<T>(dst: &mut T, v: Option<T>) {
            if let Some(v) = v {
                *dst = v;
            }
        }

        set_if_some(&mut self.db_path, args.db_path);
    }

    pub fn resolve_relative_paths(&mut self, config_dir: impl AsRef<Path>) {
        self.db_path = config_dir.as_ref().join(&self.db_path);
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: "./newspulse.sqlite3".into(),
            search_url: "https://search.naver.com/search.naver".into(),
            crawl_interval: Duration::from_secs(100 * 60),
            trend_interval: Duration::from_secs(30 * 60),
            trend_window: Duration::from_secs(24 * 60 * 60),
            article_limit: 10,
            request_timeout: Duration::from_secs(30),
            page_delay: Duration::from_secs(1),
            workers: 4,
        }
    }
}

pub fn load(search_paths: &[PathBuf]) -> Result<Config> {
    for path in search_paths {
        debug!("Trying to load {}", path.display());
        let mut contents = String::new();

        {
            let mut f = match File::open(path) {
                Ok(f) => f,

                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %path.display(), "File not found, skipping");
                    continue;
                }

                Err(e) => {
                    return Err(e)
                        .context(anyhow!("could not load a config file `{}`", path.display()));
                }
            };

            f.read_to_string(&mut contents).with_context(|| {
                anyhow!(
                    "could not read the contents of a config file `{}`",
                    path.display()
                )
            })?;
        }

        let mut cfg: Config = toml::from_str(&contents)
            .with_context(|| anyhow!("could not load the config file `{}`", path.display()))?;

        if let Some(parent) = path.parent() {
            cfg.resolve_relative_paths(parent);
        }

        info!("Loaded a config file `{}`", path.display());

        return Ok(cfg);
    }

    info!("Using the default config");

    Ok(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_seconds_and_human_friendly_strings() {
        let cfg: Config = toml::from_str(
            r#"
            crawl-interval = "1h 40m"
            trend-window = "1d"
            page-delay = 2
            "#,
        )
        .unwrap();

        assert_eq!(
            std::time::Duration::from(cfg.crawl_interval),
            std::time::Duration::from_secs(6000),
        );
        assert_eq!(
            std::time::Duration::from(cfg.trend_window),
            std::time::Duration::from_secs(24 * 60 * 60),
        );
        assert_eq!(
            std::time::Duration::from(cfg.page_delay),
            std::time::Duration::from_secs(2),
        );
    }

    #[test]
    fn every_field_has_a_default() {
        let cfg: Config = toml::from_str("").unwrap();

        assert_eq!(cfg.article_limit, 10);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.db_path, PathBuf::from("./newspulse.sqlite3"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>(r#"bind-addr = "127.0.0.1:8080""#).is_err());
    }
}
