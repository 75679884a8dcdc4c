use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use filedrop::api::{AppState, FileDropServer};
use filedrop::config::Config;
use filedrop::eviction::EvictionController;
use filedrop::index::{MetaIndex, RedisIndex};
use filedrop::limit::RateLimit;
use filedrop::storage::Storage;

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Parser, Debug)]
#[command(name = "filedrop-daemon")]
#[command(about = "Content-addressed file-drop daemon", long_about = None)]
struct Args {
    /// Path to the JSON config file
    #[arg(long = "cfg", default_value = "config.json")]
    cfg: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .init();

    let cfg = Config::load(&args.cfg)
        .with_context(|| format!("loading config from {}", args.cfg.display()))?;

    let Some(storage_cfg) = cfg.storage else {
        bail!("config is missing the storage section");
    };
    let eviction_limit = storage_cfg.limit;

    let storage = Arc::new(Storage::new(storage_cfg));
    let limits = RateLimit::new(&cfg.rate_limit.unwrap_or_default());
    let index: Arc<dyn MetaIndex> = Arc::new(
        RedisIndex::connect(&cfg.redis.unwrap_or_default())
            .await
            .context("setting up the metadata index")?,
    );

    let evictor = EvictionController::new(storage.clone(), index.clone(), eviction_limit);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // the first tick fires immediately; skip it

        loop {
            ticker.tick().await;
            if let Err(e) = evictor.sweep().await {
                warn!("eviction sweep failed: {}", e);
            }
        }
    });

    let host = if cfg.host.is_empty() {
        "0.0.0.0"
    } else {
        cfg.host.as_str()
    };
    let addr: SocketAddr = format!("{}:{}", host, cfg.port)
        .parse()
        .context("invalid listen address")?;

    let state = Arc::new(AppState {
        storage,
        index,
        limits,
    });

    FileDropServer::new(state, addr).run().await
}
