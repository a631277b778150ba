use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pulsewatch::db;
use pulsewatch::scheduler;
use pulsewatch::server::config::ServerConfig;
use pulsewatch::web;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging() {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily("logs", "pulsewatch.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    init_logging();
    dotenv().ok();

    // --- Server Config Setup ---
    let config = match ServerConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Failed to load server configuration: {}", e);
            return Err(e.into());
        }
    };
    info!(
        database_path = %config.database_path,
        results_retention = config.results_retention,
        worker_concurrency = config.worker_concurrency,
        "Starting pulsewatch."
    );

    // --- Storage Setup ---
    let pool = match db::open_pool(&config.database_path) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.to_string().into());
        }
    };

    // The registry is populated on first touch and read-only afterwards;
    // touching it here keeps startup failures out of the request path.
    let stage_count = pulsewatch::stages::registry().len();
    info!(stage_count, "Stage registry initialized.");

    // --- Scheduler Setup ---
    let (scheduler_handle, scheduler_task) = scheduler::start(
        pool.clone(),
        config.results_retention,
        config.worker_concurrency,
    );

    // --- Axum HTTP Server Setup ---
    let router = web::create_axum_router(pool, scheduler_handle.clone(), config.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "HTTP server listening.");

    let shutdown_handle = scheduler_handle.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received.");
            shutdown_handle.shutdown();
        })
        .await?;

    // The scheduler waits up to 30 s for in-flight checks; give it a little
    // extra before giving up on the control task.
    if tokio::time::timeout(Duration::from_secs(35), scheduler_task)
        .await
        .is_err()
    {
        error!("Scheduler did not stop in time; exiting anyway.");
    }

    Ok(())
}
