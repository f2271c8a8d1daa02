use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::grpc::GrpcServer;
use sluice::ratelimit::Limiter;
use sluice::store::MemoryStore;

/// Persistent leaky-bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Network address to listen on
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Snapshot file in which to store rate limits
    #[arg(long)]
    data: Option<PathBuf>,

    /// Keep bucket state in memory only
    #[arg(long, conflicts_with = "data")]
    in_memory: bool,

    /// Maximum number of cached buckets (0 for unbounded)
    #[arg(long)]
    cache_capacity: Option<usize>,

    /// Delete a bucket's backlog when it is evicted or shut down
    #[arg(long)]
    purge_on_stop: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut SluiceConfig) {
        if let Some(addr) = self.addr {
            config.server.grpc_addr = addr;
        }
        if let Some(data) = self.data {
            config.store.path = Some(data);
        }
        if self.in_memory {
            config.store.path = None;
        }
        if let Some(capacity) = self.cache_capacity {
            config.limiter.cache_capacity = capacity;
        }
        if self.purge_on_stop {
            config.limiter.purge_on_stop = true;
        }
        if let Some(level) = self.log_level {
            config.server.log_level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = SluiceConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Sluice Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(grpc_addr = %config.server.grpc_addr, "Configuration loaded");

    let (store, flusher) = match &config.store.path {
        Some(path) => {
            info!(path = %path.display(), "Opening store");
            let store = MemoryStore::open(path)?;
            let flusher = store.spawn_flusher(config.store.flush_interval());
            (store, Some(flusher))
        }
        None => {
            info!("Using in-memory store");
            (MemoryStore::new(), None)
        }
    };
    let store = Arc::new(store);

    let limiter = Arc::new(Limiter::with_options(
        Arc::clone(&store),
        config.limiter.options(),
    ));
    info!("Limiter initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&limiter));

    info!("Server ready at {}", config.server.grpc_addr);
    grpc_server
        .serve_with_shutdown(shutdown_signal())
        .await?;

    limiter.shutdown().await;
    if let Some(flusher) = flusher {
        flusher.abort();
    }
    store.flush()?;
    info!("Sluice Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
