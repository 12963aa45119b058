#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use condensat_bus::{CancellationToken, EmbeddedBroker, HandlerRegistry, MessageBus};
use condensat_lib::storage::{RedbStorage, Storage, Tables};
use condensat_lib::{config, logging};
use condensat_logger::{QueueLayer, QueueLogger, RedisLogQueue};
use condensat_monitor::{
    Aggregator, AggregatorSettings, MonitorClient, ProcessInfoReporter, handlers, local_hostname,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "condensat-monitor")]
#[command(about = "Condensat service telemetry monitor")]
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

    /// Also push this monitor's logs into the redis log queue
    #[arg(long)]
    forward_logs: bool,
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

    let mut loader = config::ConfigLoader::new("condensat-monitor");
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
    if cli.forward_logs {
        config.logging.forward_to_queue = true;
    }

    let log_cancel = CancellationToken::new();
    let log_pusher = init_logging(&config, &log_cancel).await?;

    let storage = RedbStorage::open(&config.database.path)
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    storage.migrate(&Tables::all())?;
    let storage: Arc<dyn Storage> = Arc::new(storage);

    let aggregator = Arc::new(Aggregator::with_storage(
        AggregatorSettings::from(&config.monitor),
        storage,
    ));
    let restored = aggregator.restore().await?;
    info!(restored, path = %config.database.path.display(), "Process history restored");

    let broker = Arc::new(EmbeddedBroker::with_buffer_size(config.bus.buffer_size));
    let bus = Arc::new(MessageBus::new(broker, config.bus.rpc_timeout()).await?);

    let cancel = CancellationToken::new();

    let mut registry = HandlerRegistry::new();
    handlers::register(&mut registry, aggregator.clone(), config.bus.worker_concurrency)?;
    let handlers = registry.start(&bus, &cancel).await?;
    info!(
        concurrency = config.bus.worker_concurrency,
        "Monitor handlers started"
    );

    let reporter = ProcessInfoReporter::new(
        MonitorClient::new(bus.clone()),
        "condensat-monitor",
        config.monitor.report_interval(),
    );
    let reporter_task = tokio::spawn(reporter.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    if let Err(e) = handlers.wait_stopped().await {
        warn!(error = %e, "Handlers did not stop cleanly");
    }
    if let Err(e) = reporter_task.await {
        error!(error = %e, "Reporter task failed");
    }
    bus.shutdown().await?;

    info!("condensat-monitor stopped");
    log_cancel.cancel();
    if let Some(pusher) = log_pusher
        && let Err(e) = pusher.await
    {
        error!(error = %e, "Log pusher failed");
    }
    Ok(())
}

/// Install the global subscriber, forwarding events to the log queue when enabled
async fn init_logging(
    config: &config::Config,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    if !config.logging.forward_to_queue {
        logging::init(&config.logging).context("initializing logging")?;
        return Ok(None);
    }

    let queue = RedisLogQueue::connect(&config.queue)
        .await
        .with_context(|| format!("connecting to redis at {}:{}", config.queue.host, config.queue.port))?;
    let logger = QueueLogger::new(Arc::new(queue), "condensat-monitor", &local_hostname());
    let (layer, pusher) =
        QueueLayer::spawn(Arc::new(logger), config.logging.forward_capacity, cancel.clone());
    logging::init_with_layer(&config.logging, Some(layer)).context("initializing logging")?;
    info!(key = %config.queue.key, "Forwarding logs to the log queue");
    Ok(Some(pusher))
}
