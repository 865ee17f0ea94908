//! Three-tier threat lookup: process memory, durable cache, provider API

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error_handling::InsightResult;
use crate::models::ThreatCacheEntry;
use crate::storage::ThreatCacheStore;
use crate::threat::client::{LookupResult, ThreatLookupClient};
use crate::threat::memory::TtlCache;

pub struct ThreatCache {
    memory: TtlCache<IpAddr, ThreatCacheEntry>,
    store: Arc<dyn ThreatCacheStore>,
    client: Option<ThreatLookupClient>,
}

impl ThreatCache {
    /// `client` is `None` when no API key is configured; the cache then
    /// serves stored entries only.
    pub fn new(store: Arc<dyn ThreatCacheStore>, client: Option<ThreatLookupClient>, memory_ttl: Duration) -> Self {
        Self {
            memory: TtlCache::new(memory_ttl),
            store,
            client,
        }
    }

    /// Best available entry for `ip`. Never fails: provider and storage
    /// errors degrade to whatever is already known.
    pub async fn lookup(&self, ip: IpAddr) -> Option<ThreatCacheEntry> {
        if let Some(entry) = self.memory.get(&ip) {
            return Some(entry);
        }

        let stored = match self.store.get(ip).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%ip, error = %e, code = e.error_code(), "Threat cache read failed");
                None
            }
        };

        if let Some(entry) = stored.as_ref().filter(|e| e.is_fresh(Utc::now())) {
            self.memory.insert(ip, entry.clone());
            return Some(entry.clone());
        }

        match self.fetch(ip, stored.as_ref()).await {
            LookupResult::Found(entry) => Some(entry),
            _ => stored,
        }
    }

    /// Query the provider now, ignoring both freshness tiers
    pub async fn force_refresh(&self, ip: IpAddr) -> LookupResult<ThreatCacheEntry> {
        let stored = match self.store.get(ip).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(%ip, error = %e, code = e.error_code(), "Threat cache read failed");
                None
            }
        };
        self.fetch(ip, stored.as_ref()).await
    }

    pub fn has_budget(&self) -> bool {
        self.client.as_ref().map_or(false, |c| c.has_budget())
    }

    pub fn lookups_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Merge externally obtained entries (blacklist rows) into the durable
    /// tier and drop any memory copies so the merged rows are read next.
    pub async fn merge_external(&self, entries: &[ThreatCacheEntry]) -> InsightResult<usize> {
        let merged = self.store.merge_entries(entries).await?;
        for entry in entries {
            self.memory.remove(&entry.ip);
        }
        Ok(merged.len())
    }

    pub fn sweep_memory(&self) -> usize {
        self.memory.sweep(Instant::now())
    }

    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    async fn fetch(&self, ip: IpAddr, stored: Option<&ThreatCacheEntry>) -> LookupResult<ThreatCacheEntry> {
        let client = match &self.client {
            Some(client) => client,
            None => return LookupResult::BudgetExhausted,
        };

        let fetched = match client.lookup(ip).await {
            LookupResult::Found(entry) => entry,
            LookupResult::BudgetExhausted => return LookupResult::BudgetExhausted,
            LookupResult::RateLimited => return LookupResult::RateLimited,
            LookupResult::Failed => return LookupResult::Failed,
        };

        let merged = match self.store.merge_entries(std::slice::from_ref(&fetched)).await {
            Ok(mut rows) if !rows.is_empty() => rows.swap_remove(0),
            Ok(_) => fetched,
            Err(e) => {
                warn!(%ip, error = %e, code = e.error_code(), "Threat cache write failed");
                match stored {
                    Some(existing) => ThreatCacheEntry::merge(existing, &fetched),
                    None => fetched,
                }
            }
        };

        debug!(%ip, score = merged.score, "Threat entry refreshed");
        self.memory.insert(ip, merged.clone());
        LookupResult::Found(merged)
    }
}
