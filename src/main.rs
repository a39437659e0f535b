use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::info;

use riskgate::config::ConfigStore;
use riskgate::engine::RuleEngine;
use riskgate::matcher::{BackendKind, PatternMatcher};
use riskgate::observability::{init_tracing, MetricsRegistry};
use riskgate::orchestrator::DecisionOrchestrator;

/// Bootstrap options. The decision engine itself is configured through
/// the system config file; these flags locate the artifacts.
#[derive(Debug, Parser)]
#[command(name = "riskgate")]
#[command(about = "Real-time transaction risk decision engine")]
struct Cli {
    /// Path to the system configuration file
    #[arg(long, default_value = "server.toml", env = "RISKGATE_CONFIG_PATH")]
    config_path: PathBuf,

    /// Path to the rule configuration file
    #[arg(long, default_value = "rules.json", env = "RISKGATE_RULES_PATH")]
    rules_path: PathBuf,

    /// Path to the blocklist pattern file
    #[arg(long, default_value = "blacklist.txt", env = "RISKGATE_BLACKLIST_PATH")]
    blacklist_path: PathBuf,

    /// Path to the allowlist pattern file
    #[arg(long, default_value = "whitelist.txt", env = "RISKGATE_WHITELIST_PATH")]
    whitelist_path: PathBuf,

    /// Reload check interval in seconds for all watched artifacts
    #[arg(long, default_value = "5", env = "RISKGATE_RELOAD_SECS")]
    reload_secs: u64,

    /// Optional per-decision rule evaluation budget in milliseconds
    #[arg(long, env = "RISKGATE_EVALUATION_BUDGET_MS")]
    evaluation_budget_ms: Option<u64>,

    /// Log level override (otherwise taken from the config file)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let reload_interval = Duration::from_secs(cli.reload_secs);

    // Load configuration, then bring up tracing from its logging section
    let config = ConfigStore::load(&cli.config_path)?;
    let mut logging = config.logging();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    let _log_guard = init_tracing(&logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config_path.display(),
        "starting riskgate decision engine"
    );

    let performance = config.performance();
    info!(
        target_p99_ms = performance.target_p99_ms,
        target_qps = performance.target_qps,
        "performance targets"
    );

    let metrics = Arc::new(MetricsRegistry::new());

    let engine = Arc::new(RuleEngine::new(metrics.clone()));
    engine.load_rules(&cli.rules_path)?;
    engine.enable_hot_reload(reload_interval, None)?;

    let matcher = Arc::new(PatternMatcher::new(BackendKind::Auto, metrics.clone()));
    matcher.load_patterns(&cli.blacklist_path, &cli.whitelist_path)?;
    matcher.compile()?;
    matcher.enable_hot_reload(reload_interval, None)?;

    config.enable_hot_reload(reload_interval, None);

    let mut orchestrator =
        DecisionOrchestrator::new(engine.clone(), matcher.clone(), config.clone(), metrics);
    if let Some(budget_ms) = cli.evaluation_budget_ms {
        orchestrator = orchestrator.with_evaluation_budget(Duration::from_millis(budget_ms));
    }

    let health = orchestrator.health();
    info!(status = health.status, "decision core initialized");

    // The HTTP transport is an external collaborator; this binary only
    // hosts the decision core and its reload watchers.
    shutdown_signal().await;

    info!("shutting down");
    engine.disable_hot_reload();
    matcher.disable_hot_reload();
    config.disable_hot_reload();

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal");
}
