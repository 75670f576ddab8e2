use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use opora_agent::{Deps, Dispatcher, GroupLocks};
use opora_core::config::OporaConfig;
use opora_index::CaseIndex;
use opora_llm::LlmClient;
use opora_queue::{JobQueue, WorkerPool};
use opora_store::Store;

mod app;
mod http;
mod transport;

#[derive(Parser, Debug)]
#[command(name = "opora", about = "Group-chat technical-support agent")]
struct Args {
    /// Path to opora.toml (default: ~/.opora/opora.toml)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = OporaConfig::load(args.config.as_deref())?;

    for dir in [&config.database.path, &config.database.index_path] {
        if let Some(parent) = Path::new(dir).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::create_dir_all(&config.images.root)?;

    let store = Arc::new(Store::open(
        &config.database.path,
        config.database.tx_timeout_ms,
    )?);
    let index = Arc::new(CaseIndex::open(
        &config.database.index_path,
        config.llm.embed_dim,
    )?);
    let queue = Arc::new(JobQueue::open(
        &config.database.path,
        config.queue.max_attempts,
        config.queue.lease_ms,
    )?);
    let llm = Arc::new(LlmClient::new(&config.llm)?);
    let transport = Arc::new(transport::HttpTransport::new(&config.transport)?);
    let history = Arc::new(transport::HttpHistoryNotifier::new(&config.history)?);

    let deps = Arc::new(Deps {
        config: config.clone(),
        store,
        index,
        llm,
        transport,
        history,
        queue: Arc::clone(&queue),
        locks: GroupLocks::new(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = WorkerPool::new(
        queue,
        Arc::new(Dispatcher::new(Arc::clone(&deps))),
        config.queue.workers,
        config.queue.poll_interval_ms,
        config.queue.high_watermark,
    );
    let worker_handles = pool.spawn(shutdown_rx.clone());

    let reconciler = opora_agent::reconciler::Reconciler::new(Arc::clone(&deps));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let state = Arc::new(app::AppState::new(Arc::clone(&deps)));
    let router = app::router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, workers = config.queue.workers, "opora gateway listening");

    let server_shutdown = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = server_shutdown.send(true);
        })
        .await?;

    // The serve future resolves after the signal; make sure the background
    // tasks also see the flag, then drain them.
    let _ = shutdown_tx.send(true);
    for h in worker_handles {
        let _ = h.await;
    }
    let _ = reconciler_handle.await;
    info!("opora gateway stopped");
    Ok(())
}
