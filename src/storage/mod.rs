//! Durable storage seams
//!
//! Two repository traits cover the `logs` and `ip_threats` tables. The
//! PostgreSQL implementation backs production; `MemoryStore` mirrors the same
//! semantics for tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

use crate::config::ThreatPolicy;
use crate::error_handling::InsightResult;
use crate::models::{LogRecord, ThreatCacheEntry};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Source and destination of a stored log that still lacks a threat score
pub type UnscoredPair = (Option<IpAddr>, Option<IpAddr>);

/// Repository for the `logs` table
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert all records in one statement; all or nothing
    async fn insert_batch(&self, records: &[LogRecord]) -> InsightResult<u64>;

    async fn insert_one(&self, record: &LogRecord) -> InsightResult<()>;

    /// Fill null threat scores of eligible logs from cache entries looked up
    /// at or after `fresh_after`, matching the source address first and the
    /// destination second. Returns the number of rows changed.
    async fn patch_scores_from_cache(
        &self,
        fresh_after: DateTime<Utc>,
        limit: i64,
        policy: ThreatPolicy,
    ) -> InsightResult<u64>;

    /// Fill detail columns of logs that carry a score but no details, from
    /// cache entries that have details
    async fn patch_missing_details(&self, limit: i64) -> InsightResult<u64>;

    /// Address pairs of eligible unscored logs whose addresses are both
    /// absent from the threat cache
    async fn unscored_without_cache(&self, limit: i64, policy: ThreatPolicy) -> InsightResult<Vec<UnscoredPair>>;

    /// Overwrite threat columns of every eligible log involving `entry.ip`
    async fn patch_ip(&self, entry: &ThreatCacheEntry, policy: ThreatPolicy) -> InsightResult<u64>;
}

/// Repository for the `ip_threats` table
#[async_trait]
pub trait ThreatCacheStore: Send + Sync {
    async fn get(&self, ip: IpAddr) -> InsightResult<Option<ThreatCacheEntry>>;

    /// Merge entries into the cache under the never-downgrade rule and
    /// return the stored result for each distinct address
    async fn merge_entries(&self, entries: &[ThreatCacheEntry]) -> InsightResult<Vec<ThreatCacheEntry>>;

    /// Entries looked up before `stale_before` that lack details, most
    /// recently observed in logs first, then by score
    async fn refresh_candidates(&self, stale_before: DateTime<Utc>, limit: i64) -> InsightResult<Vec<IpAddr>>;
}

/// Collapse duplicate addresses so each appears once, merged
pub(crate) fn dedupe_entries(entries: &[ThreatCacheEntry]) -> Vec<ThreatCacheEntry> {
    let mut unique: Vec<ThreatCacheEntry> = Vec::with_capacity(entries.len());
    let mut index = std::collections::HashMap::with_capacity(entries.len());
    for entry in entries {
        match index.get(&entry.ip) {
            Some(&i) => {
                let merged = ThreatCacheEntry::merge(&unique[i], entry);
                unique[i] = merged;
            }
            None => {
                index.insert(entry.ip, unique.len());
                unique.push(entry.clone());
            }
        }
    }
    unique
}
