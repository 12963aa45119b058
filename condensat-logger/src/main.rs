#![forbid(unsafe_code)]

use anyhow::Context;
use clap::{Parser, ValueEnum};
use condensat_lib::storage::{RedbStorage, Storage, Tables};
use condensat_lib::{config, logging};
use condensat_logger::{
    ConsoleFormat, ConsoleSink, DatabaseSink, Grabber, GrabberSettings, LogSink, RedisLogQueue,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    Console,
    Database,
}

#[derive(Parser)]
#[command(name = "condensat-grabber")]
#[command(about = "Drain the Condensat log queue into console and database sinks")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Sinks receiving drained entries
    #[arg(long, value_enum, value_delimiter = ',', default_values = ["console", "database"])]
    sinks: Vec<SinkKind>,

    /// Console sink line format
    #[arg(long, default_value = "human")]
    console_format: ConsoleFormat,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = config::ConfigLoader::new("condensat-grabber");
    if let Some(path) = cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("loading configuration")?;

    if let Some(path) = cli.database {
        config.database.path = path;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    logging::init(&config.logging).context("initializing logging")?;

    let queue = RedisLogQueue::connect(&config.queue)
        .await
        .with_context(|| format!("connecting to redis at {}:{}", config.queue.host, config.queue.port))?;

    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
    if cli.sinks.contains(&SinkKind::Console) {
        sinks.push(Arc::new(ConsoleSink::new(cli.console_format)));
    }
    if cli.sinks.contains(&SinkKind::Database) {
        let storage = RedbStorage::open(&config.database.path)
            .with_context(|| format!("opening database {}", config.database.path.display()))?;
        storage.migrate(&Tables::all())?;
        sinks.push(Arc::new(DatabaseSink::new(Arc::new(storage))));
    }

    let grabber = Grabber::new(
        Arc::new(queue),
        sinks,
        GrabberSettings::from(&config.queue),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            cancel.cancel();
        }
    });

    grabber.run(cancel).await.context("draining log queue")?;
    info!("condensat-grabber stopped");
    Ok(())
}
