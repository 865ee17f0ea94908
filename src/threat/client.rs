//! AbuseIPDB API access
//!
//! `ThreatIntelApi` is the raw HTTP seam; `ThreatLookupClient` layers the
//! shared `RateBudget` over it and turns every failure into a result variant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error_handling::{InsightError, InsightResult};
use crate::models::ThreatCacheEntry;
use crate::threat::budget::{RateBudget, RateLimitInfo};

const BLACKLIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provider category id to display name
pub fn category_name(id: u8) -> Option<&'static str> {
    let name = match id {
        1 => "DNS Compromise",
        2 => "DNS Poisoning",
        3 => "Fraud Orders",
        4 => "DDoS Attack",
        5 => "FTP Brute-Force",
        6 => "Ping of Death",
        7 => "Phishing",
        8 => "Fraud VoIP",
        9 => "Open Proxy",
        10 => "Web Spam",
        11 => "Email Spam",
        12 => "Blog Spam",
        13 => "VPN IP",
        14 => "Port Scan",
        15 => "Hacking",
        16 => "SQL Injection",
        17 => "Spoofing",
        18 => "Brute-Force",
        19 => "Bad Web Bot",
        20 => "Exploited Host",
        21 => "Web App Attack",
        22 => "SSH",
        23 => "IoT Targeted",
        _ => return None,
    };
    Some(name)
}

/// One row of the provider blacklist
#[derive(Debug, Clone, PartialEq)]
pub struct BlacklistedIp {
    pub ip: IpAddr,
    pub score: u8,
    pub last_reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome<T> {
    Ok(T),
    /// HTTP 429
    RateLimited,
    /// Any other non-success status; the quota headers are still valid
    Rejected { status: u16 },
}

/// Payload plus the quota headers that came with it
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub limits: RateLimitInfo,
    pub outcome: ApiOutcome<T>,
}

#[async_trait]
pub trait ThreatIntelApi: Send + Sync {
    async fn check(&self, ip: IpAddr) -> InsightResult<ApiResponse<ThreatCacheEntry>>;

    async fn blacklist(
        &self,
        confidence_minimum: u8,
        limit: u32,
    ) -> InsightResult<ApiResponse<Vec<BlacklistedIp>>>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckData {
    abuse_confidence_score: Option<u8>,
    usage_type: Option<String>,
    is_tor: Option<bool>,
    is_whitelisted: Option<bool>,
    total_reports: Option<i32>,
    last_reported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    hostnames: Vec<String>,
    #[serde(default)]
    reports: Vec<ReportData>,
}

#[derive(Debug, Deserialize)]
struct ReportData {
    #[serde(default)]
    categories: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlacklistRow {
    ip_address: String,
    abuse_confidence_score: Option<u8>,
    last_reported_at: Option<DateTime<Utc>>,
}

/// Category names ordered by how often reporters used them
fn ranked_categories(reports: &[ReportData]) -> Vec<String> {
    let mut counts: HashMap<u8, usize> = HashMap::new();
    for id in reports.iter().flat_map(|r| r.categories.iter()) {
        *counts.entry(*id).or_default() += 1;
    }
    let mut ranked: Vec<(u8, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .filter_map(|(id, _)| category_name(id).map(str::to_string))
        .collect()
}

impl CheckData {
    fn into_entry(self, ip: IpAddr, now: DateTime<Utc>) -> ThreatCacheEntry {
        ThreatCacheEntry {
            ip,
            score: self.abuse_confidence_score.unwrap_or(0).min(100),
            categories: ranked_categories(&self.reports),
            usage_type: self.usage_type,
            hostnames: Some(self.hostnames).filter(|h| !h.is_empty()),
            is_tor: self.is_tor,
            is_whitelisted: self.is_whitelisted,
            total_reports: Some(self.total_reports.unwrap_or(0)),
            last_reported_at: self.last_reported_at,
            looked_up_at: now,
        }
    }
}

fn limits_from_headers(headers: &HeaderMap) -> RateLimitInfo {
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    RateLimitInfo::from_header_values(
        value("X-RateLimit-Remaining"),
        value("X-RateLimit-Reset"),
        value("Retry-After"),
    )
}

/// reqwest-backed AbuseIPDB v2 client
pub struct AbuseIpDbApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_age_in_days: u32,
}

impl AbuseIpDbApi {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration, max_age_in_days: u32) -> InsightResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("siem_log_insight/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InsightError::configuration_with_source("Failed to build HTTP client", e.into()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_age_in_days,
        })
    }

    async fn read_body<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> InsightResult<ApiResponse<T>> {
        let limits = limits_from_headers(response.headers());
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::RateLimited,
            });
        }
        if !status.is_success() {
            debug!(endpoint, status = status.as_u16(), "Provider rejected request");
            return Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::Rejected {
                    status: status.as_u16(),
                },
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(ApiResponse {
            limits,
            outcome: ApiOutcome::Ok(envelope.data),
        })
    }
}

#[async_trait]
impl ThreatIntelApi for AbuseIpDbApi {
    async fn check(&self, ip: IpAddr) -> InsightResult<ApiResponse<ThreatCacheEntry>> {
        let response = self
            .http
            .get(format!("{}/check", self.base_url))
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("ipAddress", ip.to_string()),
                ("maxAgeInDays", self.max_age_in_days.to_string()),
                ("verbose", String::new()),
            ])
            .send()
            .await?;

        let parsed: ApiResponse<CheckData> = Self::read_body(response, "check").await?;
        let now = Utc::now();
        Ok(ApiResponse {
            limits: parsed.limits,
            outcome: match parsed.outcome {
                ApiOutcome::Ok(data) => ApiOutcome::Ok(data.into_entry(ip, now)),
                ApiOutcome::RateLimited => ApiOutcome::RateLimited,
                ApiOutcome::Rejected { status } => ApiOutcome::Rejected { status },
            },
        })
    }

    async fn blacklist(
        &self,
        confidence_minimum: u8,
        limit: u32,
    ) -> InsightResult<ApiResponse<Vec<BlacklistedIp>>> {
        let response = self
            .http
            .get(format!("{}/blacklist", self.base_url))
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("confidenceMinimum", confidence_minimum.to_string()),
                ("limit", limit.to_string()),
            ])
            .timeout(BLACKLIST_TIMEOUT)
            .send()
            .await?;

        let parsed: ApiResponse<Vec<BlacklistRow>> = Self::read_body(response, "blacklist").await?;
        Ok(ApiResponse {
            limits: parsed.limits,
            outcome: match parsed.outcome {
                ApiOutcome::Ok(rows) => ApiOutcome::Ok(
                    rows.into_iter()
                        .filter_map(|row| {
                            let ip = row.ip_address.parse().ok()?;
                            Some(BlacklistedIp {
                                ip,
                                score: row.abuse_confidence_score.unwrap_or(100).min(100),
                                last_reported_at: row.last_reported_at,
                            })
                        })
                        .collect(),
                ),
                ApiOutcome::RateLimited => ApiOutcome::RateLimited,
                ApiOutcome::Rejected { status } => ApiOutcome::Rejected { status },
            },
        })
    }
}

/// Result of a budget-gated API call
#[derive(Debug, Clone, PartialEq)]
pub enum LookupResult<T> {
    Found(T),
    /// No call was made: quota exhausted or paused
    BudgetExhausted,
    /// The call was answered with a 429
    RateLimited,
    /// Timeout, transport or server error
    Failed,
}

/// API access that always consults and updates the shared budget
#[derive(Clone)]
pub struct ThreatLookupClient {
    api: Arc<dyn ThreatIntelApi>,
    budget: RateBudget,
}

impl ThreatLookupClient {
    pub fn new(api: Arc<dyn ThreatIntelApi>, budget: RateBudget) -> Self {
        Self { api, budget }
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    pub fn has_budget(&self) -> bool {
        self.budget.can_lookup(Utc::now())
    }

    pub async fn lookup(&self, ip: IpAddr) -> LookupResult<ThreatCacheEntry> {
        if !self.budget.can_lookup(Utc::now()) {
            debug!(%ip, "Skipping threat lookup, budget exhausted");
            return LookupResult::BudgetExhausted;
        }

        match self.api.check(ip).await {
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::Ok(entry),
            }) => {
                self.budget.record_lookup(&limits, Utc::now());
                LookupResult::Found(entry)
            }
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::RateLimited,
            }) => {
                warn!(%ip, retry_after = ?limits.retry_after_secs, "Threat lookup rate limited");
                self.budget.record_lookup_limited(&limits, Utc::now());
                LookupResult::RateLimited
            }
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::Rejected { status },
            }) => {
                warn!(%ip, status, "Threat lookup rejected by provider");
                self.budget.record_lookup(&limits, Utc::now());
                LookupResult::Failed
            }
            Err(e) => {
                warn!(%ip, error = %e, code = e.error_code(), "Threat lookup failed");
                LookupResult::Failed
            }
        }
    }

    pub async fn fetch_blacklist(&self, confidence_minimum: u8, limit: u32) -> LookupResult<Vec<BlacklistedIp>> {
        if !self.budget.can_pull_blacklist(Utc::now()) {
            return LookupResult::BudgetExhausted;
        }

        match self.api.blacklist(confidence_minimum, limit).await {
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::Ok(rows),
            }) => {
                self.budget.record_blacklist(&limits, Utc::now());
                LookupResult::Found(rows)
            }
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::RateLimited,
            }) => {
                warn!(retry_after = ?limits.retry_after_secs, "Blacklist pull rate limited");
                self.budget.record_blacklist_limited(&limits, Utc::now());
                LookupResult::RateLimited
            }
            Ok(ApiResponse {
                limits,
                outcome: ApiOutcome::Rejected { status },
            }) => {
                warn!(status, "Blacklist pull rejected by provider");
                self.budget.record_blacklist(&limits, Utc::now());
                LookupResult::Failed
            }
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Blacklist pull failed");
                LookupResult::Failed
            }
        }
    }
}
