#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use siem_log_insight::classifier::{Classifier, NetworkConfig};
use siem_log_insight::config::ThreatPolicy;
use siem_log_insight::enrichment::{EnrichmentPipeline, GeoResolver, ReverseDnsResolver};
use siem_log_insight::error_handling::{InsightError, InsightResult};
use siem_log_insight::models::ThreatCacheEntry;
use siem_log_insight::storage::MemoryStore;
use siem_log_insight::threat::{
    ApiOutcome, ApiResponse, BlacklistedIp, RateBudget, RateLimitInfo, ThreatCache, ThreatIntelApi,
    ThreatLookupClient,
};

/// Scripted provider reply
#[derive(Debug, Clone)]
pub enum Reply {
    Score(u8),
    RateLimited { retry_after: u64 },
    ServerError,
}

/// Provider stand-in that counts calls and answers from a script, falling
/// back to per-address scores
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<VecDeque<Reply>>,
    scores: Mutex<HashMap<IpAddr, u8>>,
    blacklist_rows: Mutex<Vec<BlacklistedIp>>,
    check_calls: AtomicUsize,
    blacklist_calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn set_score(&self, ip: &str, score: u8) {
        self.scores.lock().insert(ip.parse().unwrap(), score);
    }

    pub fn set_blacklist(&self, rows: Vec<BlacklistedIp>) {
        *self.blacklist_rows.lock() = rows;
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn blacklist_calls(&self) -> usize {
        self.blacklist_calls.load(Ordering::SeqCst)
    }
}

fn open_limits() -> RateLimitInfo {
    RateLimitInfo {
        remaining: Some(900),
        reset_at: None,
        retry_after_secs: None,
    }
}

#[async_trait]
impl ThreatIntelApi for ScriptedApi {
    async fn check(&self, ip: IpAddr) -> InsightResult<ApiResponse<ThreatCacheEntry>> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.script.lock().pop_front().unwrap_or_else(|| {
            Reply::Score(self.scores.lock().get(&ip).copied().unwrap_or(0))
        });

        match reply {
            Reply::Score(score) => Ok(ApiResponse {
                limits: open_limits(),
                outcome: ApiOutcome::Ok(ThreatCacheEntry {
                    ip,
                    score,
                    categories: vec!["Port Scan".to_string(), "SSH".to_string()],
                    usage_type: Some("Data Center/Web Hosting/Transit".to_string()),
                    hostnames: None,
                    is_tor: Some(false),
                    is_whitelisted: Some(false),
                    total_reports: Some(12),
                    last_reported_at: Some(Utc::now()),
                    looked_up_at: Utc::now(),
                }),
            }),
            Reply::RateLimited { retry_after } => Ok(ApiResponse {
                limits: RateLimitInfo {
                    remaining: Some(0),
                    reset_at: None,
                    retry_after_secs: Some(retry_after),
                },
                outcome: ApiOutcome::RateLimited,
            }),
            Reply::ServerError => Err(InsightError::upstream("check returned HTTP 503", Some(503))),
        }
    }

    async fn blacklist(&self, _confidence_minimum: u8, _limit: u32) -> InsightResult<ApiResponse<Vec<BlacklistedIp>>> {
        self.blacklist_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ApiResponse {
            limits: open_limits(),
            outcome: ApiOutcome::Ok(self.blacklist_rows.lock().clone()),
        })
    }
}

pub fn client(api: &Arc<ScriptedApi>, budget: RateBudget) -> ThreatLookupClient {
    ThreatLookupClient::new(api.clone(), budget)
}

pub fn threat_cache(store: &Arc<MemoryStore>, api: &Arc<ScriptedApi>) -> Arc<ThreatCache> {
    Arc::new(ThreatCache::new(
        store.clone(),
        Some(client(api, RateBudget::in_memory())),
        Duration::from_secs(86_400),
    ))
}

pub fn enrichment(cache: Arc<ThreatCache>) -> Arc<EnrichmentPipeline> {
    Arc::new(EnrichmentPipeline::new(
        Arc::new(GeoResolver::disabled()),
        ReverseDnsResolver::disabled(),
        cache,
        ThreatPolicy::BlockedAny,
        vec![],
    ))
}

pub fn classifier() -> Classifier {
    Classifier::new(NetworkConfig::new(
        vec!["eth8".to_string(), "ppp0".to_string()],
        HashMap::from([
            ("br0".to_string(), "Main LAN".to_string()),
            ("br20".to_string(), "IoT".to_string()),
        ]),
        Vec::<String>::new(),
        vec!["wg".to_string(), "tun".to_string()],
    ))
}
