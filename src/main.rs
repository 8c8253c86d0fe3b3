mod cli;
mod config;
mod crawler;
mod notify;
mod queue;
mod scheduler;
mod storage;
mod trend;
mod worker;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use cli::Args;
use crawler::Crawler;
use notify::CorpusEvents;
use queue::JobQueue;
use scheduler::Scheduler;
use storage::Storage;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use trend::{TrendAggregator, WordTokenizer};
use worker::WorkerPool;

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_regex(false)
                .with_default_directive(Level::INFO.into())
                .with_env_var("NEWSPULSE_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    set_up_logging();

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();

        async move {
            tokio::signal::ctrl_c().await.unwrap();
            cancel.cancel();
        }
    });

    let mut tasks = match start(cancel.clone()).await {
        Ok(tasks) => tasks,

        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let mut exit_code = ExitCode::SUCCESS;

    while let Some(task_result) = tasks.join_next().await {
        cancel.cancel();

        match task_result {
            Ok(Ok(())) => {}

            Ok(Err(e)) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }

            Err(e) => {
                error!("{e:#}");
                exit_code = ExitCode::FAILURE;
            }
        }
    }

    exit_code
}

async fn start(cancel: CancellationToken) -> Result<JoinSet<Result<()>>> {
    let mut args = Args::parse();
    let config_paths = args
        .config_path
        .take()
        .into_iter()
        .chain(["./newspulse.toml".into(), "/etc/newspulse.toml".into()])
        .collect::<Vec<_>>();
    let mut config = config::load(&config_paths)?;
    config.update(args);

    let storage = Arc::new(Storage::new(&config.db_path).await?);
    let queue = Arc::new(JobQueue::new(storage.clone()));
    queue.recover().await?;

    let crawler = Arc::new(Crawler::new(
        &config.search_url,
        config.request_timeout.into(),
        config.page_delay.into(),
    )?);
    let aggregator = Arc::new(TrendAggregator::new(
        storage.clone(),
        Box::new(WordTokenizer),
    ));
    let (events, events_rx) = CorpusEvents::channel();

    let pool = WorkerPool::new(
        queue.clone(),
        storage.clone(),
        crawler,
        events,
        config.workers,
    );

    let mut scheduler = Scheduler::new(storage, queue, aggregator, &config);
    scheduler.start(&cancel);

    let mut tasks = JoinSet::new();
    tasks.spawn(notify::drain(events_rx, cancel.clone()));
    tasks.spawn(pool.run(cancel.clone()));
    tasks.spawn({
        let cancel = cancel.clone();

        async move {
            cancel.cancelled().await;
            scheduler.stop().await;

            Ok(())
        }
    });

    Ok(tasks)
}
