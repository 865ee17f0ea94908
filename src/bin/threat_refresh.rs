//! Force a fresh threat lookup for the given addresses and rewrite the
//! stored logs that involve them.
//!
//! Shares the on-disk rate budget with the running service.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use siem_log_insight::config::InsightConfig;
use siem_log_insight::database_manager::DatabaseManager;
use siem_log_insight::runtime;
use siem_log_insight::storage::{LogStore, PostgresStore};
use siem_log_insight::threat::{LookupResult, ThreatCache};

#[derive(Debug, Parser)]
#[command(name = "threat_refresh", version, about = "Refresh threat intelligence for specific addresses")]
struct Cli {
    #[arg(short, long, env = "INSIGHT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Addresses to look up
    #[arg(required = true, value_name = "IP")]
    ips: Vec<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => InsightConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => InsightConfig::from_env().context("Failed to load configuration from environment")?,
    };
    let _log_guard = runtime::init_tracing(&config.logging);

    let client = match runtime::lookup_client(&config.threat_intel)? {
        Some(client) => client,
        None => bail!("An AbuseIPDB API key is required (INSIGHT_ABUSEIPDB_KEY)"),
    };

    let db = DatabaseManager::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresStore::new(db.pool().clone()));
    let cache = ThreatCache::new(
        store.clone(),
        Some(client),
        Duration::from_secs(config.threat_intel.memory_ttl_secs),
    );
    let policy = config.enrichment.threat_policy;

    let mut refreshed = 0usize;
    for ip in &cli.ips {
        match cache.force_refresh(*ip).await {
            LookupResult::Found(entry) => {
                let patched = store.patch_ip(&entry, policy).await.context("Failed to update logs")?;
                info!(%ip, score = entry.score, categories = ?entry.categories, patched, "Threat data refreshed");
                refreshed += 1;
            }
            LookupResult::BudgetExhausted | LookupResult::RateLimited => {
                warn!(%ip, "Lookup quota exhausted, stopping");
                break;
            }
            LookupResult::Failed => warn!(%ip, "Lookup failed"),
        }
    }

    db.close().await;
    if refreshed < cli.ips.len() {
        bail!("Refreshed {} of {} addresses", refreshed, cli.ips.len());
    }
    Ok(())
}
