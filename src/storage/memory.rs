//! In-memory repositories with the same semantics as PostgreSQL, including
//! the value constraints of the schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::ThreatPolicy;
use crate::error_handling::{InsightError, InsightResult};
use crate::models::{Action, Direction, LogRecord, LogType, ThreatCacheEntry};
use crate::storage::{dedupe_entries, LogStore, ThreatCacheStore, UnscoredPair};

#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<Vec<LogRecord>>,
    threats: Mutex<HashMap<IpAddr, ThreatCacheEntry>>,
    bulk_inserts: AtomicU64,
    single_inserts: AtomicU64,
}

fn check_constraints(record: &LogRecord) -> InsightResult<()> {
    if let Some(score) = record.threat_score {
        if !(0..=100).contains(&score) {
            return Err(InsightError::database(format!(
                "new row for relation \"logs\" violates check constraint \"logs_threat_score_check\" (score {})",
                score
            )));
        }
    }
    Ok(())
}

fn eligible(record: &LogRecord, policy: ThreatPolicy) -> bool {
    let blocked = record.log_type == LogType::Firewall && record.rule_action == Some(Action::Block);
    match policy {
        ThreatPolicy::BlockedAny => blocked,
        ThreatPolicy::BlockedInbound => blocked && record.direction == Some(Direction::Inbound),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().clone()
    }

    pub fn threat(&self, ip: IpAddr) -> Option<ThreatCacheEntry> {
        self.threats.lock().get(&ip).cloned()
    }

    /// Place an entry verbatim, bypassing the merge rule
    pub fn put_threat(&self, entry: ThreatCacheEntry) {
        self.threats.lock().insert(entry.ip, entry);
    }

    pub fn bulk_insert_calls(&self) -> u64 {
        self.bulk_inserts.load(Ordering::SeqCst)
    }

    pub fn single_insert_calls(&self) -> u64 {
        self.single_inserts.load(Ordering::SeqCst)
    }

    /// Copy cache entries onto logs matching by one address column
    fn patch_pass<F>(&self, by_dst: bool, limit: i64, mut wants: F) -> u64
    where
        F: FnMut(&LogRecord, &ThreatCacheEntry) -> bool,
    {
        let threats = self.threats.lock();
        let mut logs = self.logs.lock();
        let mut patched = 0u64;

        for record in logs.iter_mut() {
            if patched as i64 >= limit {
                break;
            }
            let key = if by_dst { record.dst_ip } else { record.src_ip };
            let entry = match key.and_then(|ip| threats.get(&ip)) {
                Some(entry) => entry,
                None => continue,
            };
            if by_dst && record.src_ip.map_or(false, |src| threats.contains_key(&src)) {
                continue;
            }
            if wants(record, entry) {
                record.apply_threat(entry);
                patched += 1;
            }
        }
        patched
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn insert_batch(&self, records: &[LogRecord]) -> InsightResult<u64> {
        self.bulk_inserts.fetch_add(1, Ordering::SeqCst);
        for record in records {
            check_constraints(record)?;
        }
        self.logs.lock().extend(records.iter().cloned());
        Ok(records.len() as u64)
    }

    async fn insert_one(&self, record: &LogRecord) -> InsightResult<()> {
        self.single_inserts.fetch_add(1, Ordering::SeqCst);
        check_constraints(record)?;
        self.logs.lock().push(record.clone());
        Ok(())
    }

    async fn patch_scores_from_cache(
        &self,
        fresh_after: DateTime<Utc>,
        limit: i64,
        policy: ThreatPolicy,
    ) -> InsightResult<u64> {
        let wants = |r: &LogRecord, t: &ThreatCacheEntry| {
            r.threat_score.is_none() && eligible(r, policy) && t.looked_up_at >= fresh_after
        };
        let by_src = self.patch_pass(false, limit, wants);
        let by_dst = self.patch_pass(true, limit, wants);
        Ok(by_src + by_dst)
    }

    async fn patch_missing_details(&self, limit: i64) -> InsightResult<u64> {
        let wants = |r: &LogRecord, t: &ThreatCacheEntry| r.missing_threat_details() && t.has_details();
        let by_src = self.patch_pass(false, limit, wants);
        let by_dst = self.patch_pass(true, limit, wants);
        Ok(by_src + by_dst)
    }

    async fn unscored_without_cache(&self, limit: i64, policy: ThreatPolicy) -> InsightResult<Vec<UnscoredPair>> {
        let threats = self.threats.lock();
        let logs = self.logs.lock();
        let cached = |ip: Option<IpAddr>| ip.map_or(false, |ip| threats.contains_key(&ip));

        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        for record in logs.iter() {
            if pairs.len() as i64 >= limit {
                break;
            }
            if record.threat_score.is_some() || !eligible(record, policy) {
                continue;
            }
            if cached(record.src_ip) || cached(record.dst_ip) {
                continue;
            }
            let pair = (record.src_ip, record.dst_ip);
            if seen.insert(pair) {
                pairs.push(pair);
            }
        }
        Ok(pairs)
    }

    async fn patch_ip(&self, entry: &ThreatCacheEntry, policy: ThreatPolicy) -> InsightResult<u64> {
        let mut logs = self.logs.lock();
        let mut patched = 0;
        for record in logs.iter_mut() {
            let involved = record.src_ip == Some(entry.ip) || record.dst_ip == Some(entry.ip);
            if involved && eligible(record, policy) {
                record.apply_threat(entry);
                patched += 1;
            }
        }
        Ok(patched)
    }
}

#[async_trait]
impl ThreatCacheStore for MemoryStore {
    async fn get(&self, ip: IpAddr) -> InsightResult<Option<ThreatCacheEntry>> {
        Ok(self.threats.lock().get(&ip).cloned())
    }

    async fn merge_entries(&self, entries: &[ThreatCacheEntry]) -> InsightResult<Vec<ThreatCacheEntry>> {
        let mut threats = self.threats.lock();
        let mut stored = Vec::new();
        for entry in dedupe_entries(entries) {
            let merged = match threats.get(&entry.ip) {
                Some(existing) => ThreatCacheEntry::merge(existing, &entry),
                None => entry,
            };
            threats.insert(merged.ip, merged.clone());
            stored.push(merged);
        }
        Ok(stored)
    }

    async fn refresh_candidates(&self, stale_before: DateTime<Utc>, limit: i64) -> InsightResult<Vec<IpAddr>> {
        let threats = self.threats.lock();
        let logs = self.logs.lock();

        let mut last_seen: HashMap<IpAddr, DateTime<Utc>> = HashMap::new();
        for record in logs.iter() {
            for ip in [record.src_ip, record.dst_ip].into_iter().flatten() {
                let seen = last_seen.entry(ip).or_insert(record.timestamp);
                if record.timestamp > *seen {
                    *seen = record.timestamp;
                }
            }
        }

        let mut candidates: Vec<&ThreatCacheEntry> = threats
            .values()
            .filter(|e| e.looked_up_at < stale_before && !e.has_details())
            .collect();
        // Unseen addresses sort last, like NULLS LAST
        candidates.sort_by(|a, b| {
            last_seen
                .get(&b.ip)
                .cmp(&last_seen.get(&a.ip))
                .then(b.score.cmp(&a.score))
        });

        Ok(candidates
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.ip)
            .collect())
    }
}
