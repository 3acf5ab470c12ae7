use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use chargeback_collector::{
    collector::Collector,
    config::Config,
    metrics::gather_metrics,
    source::KubeWorkloadSource,
    store::create_store,
};

/// Computes workload cost snapshots for the last full window and checks budgets.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence over --log-level
    let log_filter = format!("chargeback_collector={},info", cli.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter)))
        .init();

    let config = Config::load().context("invalid configuration")?;
    info!(
        "Loaded configuration: window {}h, {:?} database, rates {:?}",
        config.window_hours, config.database.db_type, config.rates
    );

    let store = create_store(&config.database)
        .await
        .context("failed to open database")?;
    store.init().await.context("failed to migrate database")?;

    let source = KubeWorkloadSource::try_default(&config.namespace_allowlist)
        .await
        .context("failed to create Kubernetes client")?;

    let collector = Collector::new(&config, Arc::new(source), store)?;
    let mut summary = collector.run(Utc::now()).await.context("collection run failed")?;

    // The runtime aborts spawned tasks on exit
    summary.wait_for_deliveries().await;

    match gather_metrics() {
        Ok(text) => debug!("Metrics:\n{}", text),
        Err(e) => debug!("Could not gather metrics: {}", e),
    }

    Ok(())
}
