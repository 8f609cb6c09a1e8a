//! taskq CLI: run the API server or a language worker, submit tasks, inspect queues.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use taskq::api::{self, AppState};
use taskq::config::Config;
use taskq::dispatch::{DispatchConfig, Dispatcher, SubmitRequest};
use taskq::model::Language;
use taskq::store::{RedisStore, Store};
use taskq::stream::StreamConfig;
use taskq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use taskq::worker::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "taskq", about = "Dispatch tasks to language workers and stream results back")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (task submission, result streams, health)
    Serve {
        /// Seconds between heartbeats on idle result streams
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
    /// Run a worker for one language queue
    Worker {
        /// rust, typescript or python
        #[arg(long)]
        language: Language,
        /// Seconds a leased task stays exclusive to this worker
        #[arg(long, default_value_t = 30)]
        lease_timeout_secs: u64,
        /// Seconds one lease call waits for work
        #[arg(long, default_value_t = 5)]
        block_secs: u64,
    },
    /// Submit a task directly to a queue
    Submit {
        #[arg(long)]
        language: String,
        #[arg(long)]
        client_id: String,
        /// Defaults to a random UUID
        #[arg(long)]
        task_id: Option<String>,
        /// Arithmetic expression to evaluate
        #[arg(long, conflicts_with = "limit", required_unless_present = "limit")]
        expression: Option<String>,
        /// Count the primes up to this limit
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Show pending and in-flight counts per language queue
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { heartbeat_secs } => {
            let _guard = telemetry(&config, "taskq-api")?;
            cmd_serve(&config, Duration::from_secs(heartbeat_secs)).await
        }
        Command::Worker {
            language,
            lease_timeout_secs,
            block_secs,
        } => {
            let _guard = telemetry(&config, &format!("taskq-worker-{language}"))?;
            let worker_config = WorkerConfig {
                lease_timeout: Duration::from_secs(lease_timeout_secs),
                block: Duration::from_secs(block_secs),
                ..WorkerConfig::default()
            };
            cmd_worker(&config, language, worker_config).await
        }
        Command::Submit {
            language,
            client_id,
            task_id,
            expression,
            limit,
        } => {
            let payload = limit.map(|limit| serde_json::json!({ "limit": limit }));
            let request = SubmitRequest {
                task_id: Some(task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())),
                client_id: Some(client_id),
                language: Some(language),
                payload,
                expression,
            };
            cmd_submit(&config, request).await
        }
        Command::Stats => cmd_stats(&config).await,
    }
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        default_filter: config.log_level.clone(),
    })?)
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let store = RedisStore::connect(&config.store.url()).await?;
    tracing::info!(
        host = config.store.host,
        port = config.store.port,
        "connected to store"
    );
    Ok(Arc::new(store))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested");
        cancel.cancel();
    });
    token
}

async fn cmd_serve(config: &Config, heartbeat_interval: Duration) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let state = AppState {
        dispatcher: Arc::new(Dispatcher::new(Arc::clone(&store), DispatchConfig::default())),
        store,
        stream: StreamConfig { heartbeat_interval },
        shutdown: cancel_on_ctrl_c(),
    };

    let addr = SocketAddr::new(config.http.host.parse()?, config.http.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    api::serve(listener, state).await?;
    Ok(())
}

async fn cmd_worker(
    config: &Config,
    language: Language,
    worker_config: WorkerConfig,
) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let worker = Worker::builtin(store, language, worker_config);

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, finishing current task");
        shutdown.cancel();
    });

    worker.run().await;
    Ok(())
}

async fn cmd_submit(config: &Config, request: SubmitRequest) -> anyhow::Result<()> {
    let store = connect(config).await?;
    let dispatcher = Dispatcher::new(store, DispatchConfig::default());
    let task = dispatcher.submit(request).await?;
    println!(
        "Submitted {} to {} (client {})",
        task.task_id,
        task.language.queue_name(),
        task.client_id
    );
    Ok(())
}

async fn cmd_stats(config: &Config) -> anyhow::Result<()> {
    let store = connect(config).await?;

    println!("{:<16}  {:>8}  {:>9}", "QUEUE", "PENDING", "IN_FLIGHT");
    println!("{}", "-".repeat(37));
    for language in Language::ALL {
        let queue = language.queue_name();
        let depth = store.depth(&queue).await?;
        println!(
            "{:<16}  {:>8}  {:>9}",
            queue, depth.pending, depth.in_flight
        );
    }
    Ok(())
}
