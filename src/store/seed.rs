//! Base worker roster and roster files.

use std::path::Path;

use crate::error::{ConfigError, DatabaseError};
use crate::store::model::WorkerDefinition;
use crate::store::traits::TaskStore;

/// The protected workers every deployment starts with.
pub fn base_workers() -> Vec<WorkerDefinition> {
    vec![
        WorkerDefinition::new("commander", "Commander")
            .with_cosmetics("🎖", "#f59e0b")
            .with_description("Coordinates the team, triages incoming work and reviews results.")
            .with_triggers(["coordinate", "delegate", "prioritize", "roadmap", "status report"])
            .with_instructions(
                "You are {name}, the coordinator of a team of autonomous workers. Read new \
                 requests in inbox/, break them into concrete steps, and record decisions and \
                 follow-ups in output/.",
            )
            .protected(),
        WorkerDefinition::new("researcher", "Researcher")
            .with_cosmetics("🔬", "#6366f1")
            .with_description("Investigates topics and writes structured findings.")
            .with_triggers(["research", "investigate", "compare", "competitor", "analysis", "survey"])
            .with_instructions(
                "You are {name}. Gather the facts available in your workspace, compare options \
                 and write a concise findings report to output/.",
            )
            .protected(),
        WorkerDefinition::new("engineer", "Engineer")
            .with_cosmetics("🛠", "#10b981")
            .with_description("Writes, fixes and tests code.")
            .with_triggers(["code", "bug", "refactor", "implement", "script", "api", "compile"])
            .with_instructions(
                "You are {name}, a software engineer. Make small, verifiable changes, run the \
                 relevant commands to check them, and summarize what changed.",
            )
            .protected(),
        WorkerDefinition::new("quant", "Quant Analyst")
            .with_cosmetics("📈", "#ef4444")
            .with_description("Market data, trading signals and backtests.")
            .with_triggers(["trading", "signal", "btc", "crypto", "market", "backtest", "portfolio"])
            .with_instructions(
                "You are {name}. Work with the market data in your workspace, state every \
                 assumption, and write signals and backtest results to output/.",
            )
            .protected(),
        WorkerDefinition::new("writer", "Writer")
            .with_cosmetics("✍", "#ec4899")
            .with_description("Drafts documentation, posts and announcements.")
            .with_triggers(["write", "blog", "article", "documentation", "newsletter", "announcement"])
            .with_instructions(
                "You are {name}. Produce clear, well-structured prose and save drafts as \
                 markdown files in output/.",
            )
            .protected(),
        WorkerDefinition::new("ops", "Operations")
            .with_cosmetics("🛰", "#0ea5e9")
            .with_description("Infrastructure, deployment and monitoring.")
            .with_triggers(["deploy", "docker", "kubernetes", "monitoring", "infrastructure", "uptime"])
            .with_instructions(
                "You are {name}, responsible for infrastructure. Inspect configuration, \
                 prefer read-only checks, and document every change you make.",
            )
            .protected(),
    ]
}

/// Load a JSON array of worker definitions.
pub async fn load_workers_file(path: &Path) -> Result<Vec<WorkerDefinition>, ConfigError> {
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
}

/// Register every worker that is not already known. Returns how many were added.
pub async fn seed_workers(
    store: &dyn TaskStore,
    workers: Vec<WorkerDefinition>,
) -> Result<usize, DatabaseError> {
    let mut added = 0;
    for worker in workers {
        if store.get_worker(&worker.id).await?.is_some() {
            continue;
        }
        tracing::debug!(worker_id = %worker.id, "Seeding worker");
        store.register_worker(worker).await?;
        added += 1;
    }
    Ok(added)
}
