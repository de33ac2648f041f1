use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taskforce::autonomous::AutonomousLoop;
use taskforce::commander::Commander;
use taskforce::config::AppConfig;
use taskforce::llm::create_provider;
use taskforce::orchestrator::Orchestrator;
use taskforce::store::seed::{base_workers, load_workers_file, seed_workers};
use taskforce::store::{MemoryStore, TaskPriority, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "taskforce.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("taskforce v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {} ({})", config.llm.backend, config.llm.model);
    eprintln!("   Workspace: {}", config.orchestrator.workspace_root.display());

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = match &config.store_path {
        Some(path) => {
            eprintln!("   Store: {}", path.display());
            Arc::new(
                MemoryStore::open(path)
                    .await
                    .with_context(|| format!("failed to open store at {}", path.display()))?,
            )
        }
        None => Arc::new(MemoryStore::new()),
    };

    let mut roster = base_workers();
    if let Some(path) = &config.workers_file {
        roster.extend(load_workers_file(path).await?);
    }
    let added = seed_workers(store.as_ref(), roster).await?;
    tracing::info!(added, "Worker roster loaded");

    // ── Core ────────────────────────────────────────────────────────────
    let provider = create_provider(&config.llm)?;
    let orchestrator = Orchestrator::start(store.clone(), provider, config.orchestrator.clone());
    let commander = Commander::new(
        store.clone(),
        config.router.clone(),
        config.orchestrator.workspace_root.clone(),
    );
    let autonomous = AutonomousLoop::new(store.clone(), orchestrator.clone(), config.scheduler.clone());

    // `taskforce <title> [description...]` delegates one task at startup.
    let mut args = std::env::args().skip(1);
    if let Some(title) = args.next() {
        let description = args.collect::<Vec<_>>().join(" ");
        let delegation = commander
            .delegate(&title, &description, TaskPriority::Normal)
            .await?;
        eprintln!(
            "   Delegated {} to {} (score {})",
            delegation.task.id, delegation.decision.worker_name, delegation.decision.score
        );
    }

    autonomous.start();
    eprintln!("   Autonomous loop running. Ctrl+C to exit.\n");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down...");

    autonomous.stop();
    orchestrator.shutdown().await?;

    let status = autonomous.status().await?;
    eprintln!(
        "Stopped after {} ticks, {} events recorded",
        status.tick_count, status.total_events
    );
    Ok(())
}
