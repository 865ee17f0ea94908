//! Daily seeding of the threat cache from the provider blacklist

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BlacklistConfig;
use crate::models::ThreatCacheEntry;
use crate::threat::{LookupResult, ThreatCache, ThreatLookupClient};

pub struct BlacklistSeeder {
    client: ThreatLookupClient,
    cache: Arc<ThreatCache>,
    config: BlacklistConfig,
}

impl BlacklistSeeder {
    pub fn new(client: ThreatLookupClient, cache: Arc<ThreatCache>, config: BlacklistConfig) -> Self {
        Self { client, cache, config }
    }

    /// Pull the blacklist once and merge it. Returns the number of addresses
    /// merged; zero when the pull was skipped or refused.
    pub async fn seed_once(&self) -> usize {
        let rows = match self
            .client
            .fetch_blacklist(self.config.confidence_minimum, self.config.limit)
            .await
        {
            LookupResult::Found(rows) => rows,
            LookupResult::BudgetExhausted => {
                info!("Blacklist quota exhausted, skipping pull");
                return 0;
            }
            LookupResult::RateLimited | LookupResult::Failed => return 0,
        };

        let now = Utc::now();
        let entries: Vec<ThreatCacheEntry> = rows
            .into_iter()
            .map(|row| ThreatCacheEntry::seeded(row.ip, row.score, row.last_reported_at, now))
            .collect();

        match self.cache.merge_external(&entries).await {
            Ok(merged) => {
                info!(fetched = entries.len(), merged, "Blacklist merged into threat cache");
                merged
            }
            Err(e) => {
                error!(error = %e, code = e.error_code(), "Failed to merge blacklist");
                0
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(self.config.startup_delay_secs)) => {}
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.seed_once().await == 0 {
                        warn!("Blacklist seeding produced no entries this round");
                    }
                }
            }
        }
        info!("Blacklist seeder stopped");
    }
}
