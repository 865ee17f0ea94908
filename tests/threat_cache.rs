mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{Reply, ScriptedApi};
use siem_log_insight::blacklist::BlacklistSeeder;
use siem_log_insight::config::BlacklistConfig;
use siem_log_insight::models::{ThreatCacheEntry, BLACKLIST_CATEGORY};
use siem_log_insight::storage::MemoryStore;
use siem_log_insight::threat::{
    BlacklistedIp, FileRateBudgetStore, LookupResult, RateBudget, ThreatCache,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn repeated_lookups_hit_the_provider_once() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    api.set_score("203.0.113.5", 77);
    let cache = common::threat_cache(&store, &api);

    let first = cache.lookup(ip("203.0.113.5")).await.unwrap();
    let second = cache.lookup(ip("203.0.113.5")).await.unwrap();

    assert_eq!(api.check_calls(), 1);
    assert_eq!(first.score, 77);
    assert_eq!(second, first);
    assert_eq!(store.threat(ip("203.0.113.5")).unwrap().score, 77);
}

#[tokio::test]
async fn fresh_stored_entry_is_served_without_a_call() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    store.put_threat(ThreatCacheEntry::seeded(ip("198.51.100.3"), 60, None, Utc::now()));
    let cache = common::threat_cache(&store, &api);

    let entry = cache.lookup(ip("198.51.100.3")).await.unwrap();

    assert_eq!(entry.score, 60);
    assert_eq!(api.check_calls(), 0);
}

#[tokio::test]
async fn provider_failure_falls_back_to_stale_entry() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    api.push(Reply::ServerError);
    let stale = ThreatCacheEntry::seeded(ip("198.51.100.4"), 42, None, Utc::now() - ChronoDuration::days(9));
    store.put_threat(stale);
    let cache = common::threat_cache(&store, &api);

    let entry = cache.lookup(ip("198.51.100.4")).await.unwrap();

    assert_eq!(api.check_calls(), 1);
    assert_eq!(entry.score, 42);
}

#[tokio::test]
async fn rate_limit_suppresses_lookups_in_every_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abuseipdb_stats.json");
    let api = ScriptedApi::new();
    api.push(Reply::RateLimited { retry_after: 60 });

    // two independent clients over one budget file, as two processes would have
    let service = common::client(&api, RateBudget::new(Arc::new(FileRateBudgetStore::new(&path))));
    let refresher = common::client(&api, RateBudget::new(Arc::new(FileRateBudgetStore::new(&path))));

    assert_eq!(service.lookup(ip("203.0.113.5")).await, LookupResult::RateLimited);
    assert_eq!(refresher.lookup(ip("203.0.113.6")).await, LookupResult::BudgetExhausted);
    assert_eq!(service.lookup(ip("203.0.113.7")).await, LookupResult::BudgetExhausted);
    assert_eq!(api.check_calls(), 1);

    let state = refresher.budget().state();
    let paused_until = state.paused_until.unwrap();
    assert!(paused_until > Utc::now() + ChronoDuration::seconds(50));
    assert!(paused_until <= Utc::now() + ChronoDuration::seconds(61));
    assert!(!refresher.budget().can_lookup(Utc::now() + ChronoDuration::seconds(59)));
}

#[tokio::test]
async fn lookups_without_a_client_use_storage_only() {
    let store = Arc::new(MemoryStore::new());
    let cache = ThreatCache::new(store.clone(), None, Duration::from_secs(60));

    assert!(!cache.lookups_enabled());
    assert!(!cache.has_budget());
    assert_eq!(cache.lookup(ip("203.0.113.5")).await, None);
    assert_eq!(cache.force_refresh(ip("203.0.113.5")).await, LookupResult::BudgetExhausted);
}

#[tokio::test]
async fn blacklist_seed_never_downgrades_richer_entries() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    let categories = vec!["Port Scan".to_string(), "Brute-Force".to_string(), "SSH".to_string()];
    store.put_threat(ThreatCacheEntry {
        ip: ip("203.0.113.5"),
        score: 95,
        categories: categories.clone(),
        usage_type: Some("Data Center/Web Hosting/Transit".to_string()),
        hostnames: None,
        is_tor: Some(false),
        is_whitelisted: Some(false),
        total_reports: Some(40),
        last_reported_at: None,
        looked_up_at: Utc::now() - ChronoDuration::days(1),
    });
    api.set_blacklist(vec![
        BlacklistedIp {
            ip: ip("203.0.113.5"),
            score: 80,
            last_reported_at: None,
        },
        BlacklistedIp {
            ip: ip("198.51.100.8"),
            score: 100,
            last_reported_at: None,
        },
    ]);

    let cache = common::threat_cache(&store, &api);
    // warm the memory tier so the seeder has to invalidate it
    assert_eq!(cache.lookup(ip("203.0.113.5")).await.unwrap().score, 95);

    let seeder = BlacklistSeeder::new(
        common::client(&api, RateBudget::in_memory()),
        cache.clone(),
        BlacklistConfig::default(),
    );
    assert_eq!(seeder.seed_once().await, 2);
    assert_eq!(api.blacklist_calls(), 1);

    let kept = store.threat(ip("203.0.113.5")).unwrap();
    assert_eq!(kept.score, 95);
    assert_eq!(kept.categories, categories);
    assert_eq!(kept.total_reports, Some(40));

    let seeded = store.threat(ip("198.51.100.8")).unwrap();
    assert_eq!(seeded.score, 100);
    assert_eq!(seeded.categories, vec![BLACKLIST_CATEGORY.to_string()]);
    assert!(!seeded.has_details());

    assert_eq!(api.check_calls(), 0);
}
