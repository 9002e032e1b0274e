//! workqueue CLI: run the dispatcher or receiver, or poke at a queue.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;
use workqueue::config::{Config, Mode, StoreConfig, telemetry_from_env};
use workqueue::dispatcher::Dispatcher;
use workqueue::gcp::MetadataClient;
use workqueue::rpc::{ServiceCallback, serve_receiver};
use workqueue::server::{serve_trigger, spawn_metrics_refresher};
use workqueue::telemetry::init_telemetry;
use workqueue::telemetry::metrics::{MetricsRecorder, NoopRecorder, OtelRecorder};

#[derive(Parser)]
#[command(name = "workqueue", about = "Lease-based work queue over object storage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP trigger; each request runs one dispatch iteration
    Dispatcher,
    /// Serve the gRPC producer endpoint that queues keys
    Receiver,
    /// Queue keys directly against storage
    Queue {
        /// Keys to queue
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Show in-progress and queued keys
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Dispatcher => cmd_dispatcher().await,
        Command::Receiver => cmd_receiver().await,
        Command::Queue { keys } => cmd_queue(keys).await,
        Command::Status => cmd_status().await,
    }
}

async fn cmd_dispatcher() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(config.telemetry("workqueue-dispatcher"))?;

    let metrics: Arc<dyn MetricsRecorder> = Arc::new(OtelRecorder::from_env());
    let store = config.store.open(metrics)?;

    let metadata = Arc::new(MetadataClient::new(reqwest::Client::new()));
    let callback = ServiceCallback::connect(config.target()?, metadata)?;
    let dispatcher = Dispatcher::new(store.clone(), config.concurrency, Arc::new(callback));

    let stop = Arc::new(Notify::new());
    let refresher =
        spawn_metrics_refresher(store, config.store.refresh_interval, Arc::clone(&stop));

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    let served = serve_trigger(listener, dispatcher, shutdown_signal(Arc::clone(&stop))).await;

    stop.notify_one();
    refresher.await.ok();
    served?;
    Ok(())
}

async fn cmd_receiver() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(config.telemetry("workqueue-receiver"))?;

    let metrics: Arc<dyn MetricsRecorder> = Arc::new(OtelRecorder::from_env());
    let store = config.store.open(metrics)?;

    let stop = Arc::new(Notify::new());
    let refresher = spawn_metrics_refresher(
        store.clone(),
        config.store.refresh_interval,
        Arc::clone(&stop),
    );

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], config.port))).await?;
    let served = serve_receiver(listener, store, shutdown_signal(Arc::clone(&stop))).await;

    stop.notify_one();
    refresher.await.ok();
    served?;
    Ok(())
}

async fn cmd_queue(keys: Vec<String>) -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env()?;
    let _guard = init_telemetry(telemetry_from_env("workqueue")?)?;
    warn_if_ephemeral(&store_config);

    let store = store_config.open(Arc::new(NoopRecorder))?;
    for key in &keys {
        store.queue(key).await?;
        println!("Queued: {key}");
    }
    Ok(())
}

async fn cmd_status() -> anyhow::Result<()> {
    let store_config = StoreConfig::from_env()?;
    let _guard = init_telemetry(telemetry_from_env("workqueue")?)?;
    warn_if_ephemeral(&store_config);

    let store = store_config.open(Arc::new(NoopRecorder))?;
    let snapshot = store.enumerate().await?;

    println!("{:<40}  {:<8}  LAST HEARTBEAT", "IN PROGRESS", "ORPHAN");
    println!("{}", "-".repeat(80));
    for lease in &snapshot.in_progress {
        println!(
            "{:<40}  {:<8}  {}",
            lease.name(),
            if lease.is_orphaned() { "yes" } else { "no" },
            lease.last_heartbeat().format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nQUEUED");
    println!("{}", "-".repeat(80));
    for key in &snapshot.queued {
        println!("{}", key.name());
    }

    println!(
        "\n{} in progress, {} queued",
        snapshot.in_progress.len(),
        snapshot.queued.len()
    );
    Ok(())
}

fn warn_if_ephemeral(config: &StoreConfig) {
    if config.mode == Mode::InMem {
        eprintln!("warning: WORKQUEUE_MODE=inmem keeps no state between invocations");
    }
}

/// Resolves on ctrl-c, after waking anything parked on `stop`.
fn shutdown_signal(stop: Arc<Notify>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        stop.notify_one();
    }
}
