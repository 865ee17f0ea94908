//! Periodic reconciliation between stored logs and the threat cache
//!
//! A cycle runs six bounded steps. A failing step is logged and counted and
//! the cycle moves on; nothing here aborts the daemon.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackfillConfig;
use crate::enrichment::EnrichmentPipeline;
use crate::error_handling::InsightResult;
use crate::models::THREAT_FRESHNESS_DAYS;
use crate::storage::{LogStore, ThreatCacheStore};
use crate::threat::LookupResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scores_patched: u64,
    pub details_patched: u64,
    pub refreshed: u64,
    pub orphans_found: u64,
    pub orphans_enriched: u64,
    pub repatched: u64,
    pub failed_steps: u32,
}

impl BackfillReport {
    pub fn fetched(&self) -> u64 {
        self.refreshed + self.orphans_enriched
    }
}

pub struct BackfillDaemon {
    logs: Arc<dyn LogStore>,
    cache_store: Arc<dyn ThreatCacheStore>,
    enrichment: Arc<EnrichmentPipeline>,
    config: BackfillConfig,
}

impl BackfillDaemon {
    pub fn new(
        logs: Arc<dyn LogStore>,
        cache_store: Arc<dyn ThreatCacheStore>,
        enrichment: Arc<EnrichmentPipeline>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            logs,
            cache_store,
            enrichment,
            config,
        }
    }

    fn contain<T: Default>(step: &'static str, result: InsightResult<T>, report: &mut BackfillReport) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(step, error = %e, code = e.error_code(), "Backfill step failed");
                report.failed_steps += 1;
                T::default()
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        if self.config.lookup_pause_ms == 0 {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(self.config.lookup_pause_ms)) => {}
        }
    }

    async fn patch_scores(&self, report: &mut BackfillReport) -> u64 {
        let fresh_after = Utc::now() - ChronoDuration::days(THREAT_FRESHNESS_DAYS);
        let patched = self
            .logs
            .patch_scores_from_cache(fresh_after, self.config.patch_limit, self.enrichment.policy())
            .await;
        Self::contain("patch_scores", patched, report)
    }

    async fn patch_details(&self, report: &mut BackfillReport) -> u64 {
        let patched = self.logs.patch_missing_details(self.config.patch_limit).await;
        Self::contain("patch_details", patched, report)
    }

    /// Re-query stale entries that never received details
    async fn refresh_stale(&self, report: &mut BackfillReport, cancel: &CancellationToken) {
        let stale_before = Utc::now() - ChronoDuration::days(THREAT_FRESHNESS_DAYS);
        let candidates = self
            .cache_store
            .refresh_candidates(stale_before, self.config.refresh_limit)
            .await;
        let candidates = Self::contain("refresh_candidates", candidates, report);
        let threats = self.enrichment.threats();

        for ip in candidates {
            if cancel.is_cancelled() || !threats.has_budget() {
                break;
            }
            match threats.force_refresh(ip).await {
                LookupResult::Found(_) => report.refreshed += 1,
                LookupResult::BudgetExhausted | LookupResult::RateLimited => break,
                LookupResult::Failed => {}
            }
            self.pause(cancel).await;
        }
    }

    /// Public addresses of unscored eligible logs that the cache has never seen
    async fn discover_orphans(&self, report: &mut BackfillReport) -> Vec<IpAddr> {
        let pairs = self
            .logs
            .unscored_without_cache(self.config.orphan_limit, self.enrichment.policy())
            .await;
        let pairs = Self::contain("discover_orphans", pairs, report);

        let mut seen = HashSet::new();
        pairs
            .into_iter()
            .filter_map(|(src, dst)| self.enrichment.target_address(src, dst))
            .filter(|ip| seen.insert(*ip))
            .collect()
    }

    async fn enrich_orphans(&self, orphans: &[IpAddr], report: &mut BackfillReport, cancel: &CancellationToken) {
        let threats = self.enrichment.threats();
        for ip in orphans {
            if cancel.is_cancelled() {
                break;
            }
            if !threats.has_budget() {
                debug!("Budget exhausted, leaving orphans for the next cycle");
                break;
            }
            if threats.lookup(*ip).await.is_some() {
                report.orphans_enriched += 1;
            }
            self.pause(cancel).await;
        }
    }

    pub async fn run_cycle(&self, cancel: &CancellationToken) -> BackfillReport {
        let mut report = BackfillReport::default();
        let lookups = self.enrichment.threats().lookups_enabled();

        report.scores_patched = self.patch_scores(&mut report).await;
        report.details_patched = self.patch_details(&mut report).await;

        if lookups {
            self.refresh_stale(&mut report, cancel).await;
        }

        let orphans = self.discover_orphans(&mut report).await;
        report.orphans_found = orphans.len() as u64;

        if lookups && !orphans.is_empty() {
            self.enrich_orphans(&orphans, &mut report, cancel).await;
        }

        if report.fetched() > 0 {
            report.repatched = self.patch_scores(&mut report).await + self.patch_details(&mut report).await;
        }

        info!(
            scores_patched = report.scores_patched,
            details_patched = report.details_patched,
            refreshed = report.refreshed,
            orphans_found = report.orphans_found,
            orphans_enriched = report.orphans_enriched,
            repatched = report.repatched,
            failed_steps = report.failed_steps,
            "Backfill cycle complete"
        );
        report
    }

    /// Settle, then run a cycle every interval until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(self.config.initial_delay_secs)) => {}
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle(&cancel).await;
                }
            }
        }
        info!("Backfill daemon stopped");
    }
}
