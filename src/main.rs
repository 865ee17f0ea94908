//! Log Insight ingestion service
//! Receives router syslog, enriches it and stores it in PostgreSQL

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use siem_log_insight::config::InsightConfig;
use siem_log_insight::database_manager::DatabaseManager;
use siem_log_insight::runtime;

#[derive(Debug, Parser)]
#[command(name = "log_insight", version, about = "Router syslog ingestion and enrichment service")]
struct Cli {
    /// Configuration file; without it settings come from defaults and INSIGHT_* variables
    #[arg(short, long, env = "INSIGHT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP address to listen on, overrides the configuration
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Create tables and indexes and exit
    #[arg(long)]
    init_schema: bool,
}

fn load_config(cli: &Cli) -> Result<InsightConfig> {
    let mut config = match &cli.config {
        Some(path) => InsightConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => InsightConfig::from_env().context("Failed to load configuration from environment")?,
    };

    if let Some(bind) = &cli.bind {
        config.listener.bind = bind.clone();
    }
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn print_config_summary(config: &InsightConfig) {
    info!("=== Configuration Summary ===");
    info!("Listener: udp://{} ({} workers)", config.listener.bind, config.listener.workers);
    info!(
        "Database pool: {}-{} connections",
        config.database.min_connections, config.database.max_connections
    );
    info!("WAN interfaces: {}", config.network.wan_interfaces.join(", "));
    info!("Threat policy: {:?}", config.enrichment.threat_policy);
    info!("Threat lookups: {}", config.threat_intel.api_key.is_some());
    info!("Budget file: {}", config.threat_intel.budget_file.display());
    info!("Batch: {} records / {} ms", config.batch.size, config.batch.max_age_ms);
    info!("================================");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _log_guard = runtime::init_tracing(&config.logging);

    if cli.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    if cli.init_schema {
        let db = DatabaseManager::connect(&config.database)
            .await
            .context("Failed to connect to PostgreSQL")?;
        db.init_schema().await.context("Failed to initialize schema")?;
        db.close().await;
        info!("Schema initialized successfully");
        return Ok(());
    }

    print_config_summary(&config);
    runtime::run(config).await.context("Log insight service failed")?;
    Ok(())
}
