use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trawl::api;
use trawl::config::Config;
use trawl::fetch::{self, scheduler::JOB_QUEUE_CAPACITY, SpeedDetector};
use trawl::media::MediaCache;
use trawl::state::AppState;
use trawl::storage::Database;
use trawl::vault::Vault;

#[derive(Parser, Debug)]
#[command(name = "trawl", about = "Personal RSS/Atom aggregation service")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the bind address (host:port)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trawl")
            .join("config.toml")
    });
    let mut config = Config::load(&config_path).context("failed to load configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
    std::fs::create_dir_all(config.scripts_dir()).context("failed to create scripts directory")?;

    // Keep the data directory to the owning user: article history and the
    // (encrypted) credentials both live under it
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&data_dir) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o700);
            if let Err(e) = std::fs::set_permissions(&data_dir, perms) {
                tracing::warn!(path = %data_dir.display(), error = %e, "failed to restrict data directory permissions");
            }
        }
    }

    let db_path = config.db_path();
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("failed to delete database")?;
        println!("Database reset.");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str, Vault::new())
        .await
        .context("failed to open database")?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("trawl/", env!("CARGO_PKG_VERSION")))
        .gzip(true)
        .build()
        .context("failed to build HTTP client")?;

    let media_cache =
        MediaCache::new(config.media_cache_dir()).context("failed to create media cache")?;

    let bind_addr = config.bind_addr.clone();
    let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
    let state = Arc::new(AppState::new(db, client, config, media_cache, job_tx));

    // Startup speed detection sizes the worker gate; it must not delay
    // serving, so it runs alongside
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let tier = SpeedDetector::new(state.client.clone()).detect().await;
            state.gate.set_limit(tier.max_concurrency());
        });
    }

    let shutdown = CancellationToken::new();
    let scheduler = fetch::spawn(Arc::clone(&state), job_rx, shutdown.clone());

    let app = api::router(Arc::clone(&state));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "trawl listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = ctrl_c => {},
                _ = serve_shutdown.cancelled() => {},
            }
        })
        .await
        .context("server crashed")?;

    // Shutdown: cancel, close the work channel, join the pool
    tracing::info!("shutting down");
    shutdown.cancel();
    state.task_manager.reset();
    drop(state);
    scheduler.join().await;

    Ok(())
}
