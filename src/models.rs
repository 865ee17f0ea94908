//! Stored data model
//!
//! `LogRecord` maps one-to-one to a row of the `logs` table and
//! `ThreatCacheEntry` to a row of `ip_threats`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Entries older than this are still served but queued for background refresh
pub const THREAT_FRESHNESS_DAYS: i64 = 4;

/// Category written by blacklist seeding. A list holding only this value is a
/// placeholder and never replaces a real category list.
pub const BLACKLIST_CATEGORY: &str = "blacklist";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Firewall,
    Dhcp,
    Wifi,
    Dns,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    InterVlan,
    Local,
    Vpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Block,
    Reject,
    Redirect,
}

macro_rules! text_enum {
    ($ty:ty, $($variant:path => $text:literal),+ $(,)?) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    other => Err(format!("unknown {} value '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(LogType,
    LogType::Firewall => "firewall",
    LogType::Dhcp => "dhcp",
    LogType::Wifi => "wifi",
    LogType::Dns => "dns",
    LogType::System => "system",
);

text_enum!(Direction,
    Direction::Inbound => "inbound",
    Direction::Outbound => "outbound",
    Direction::InterVlan => "inter_vlan",
    Direction::Local => "local",
    Direction::Vpn => "vpn",
);

text_enum!(Action,
    Action::Allow => "allow",
    Action::Block => "block",
    Action::Reject => "reject",
    Action::Redirect => "redirect",
);

/// One observed router event, as persisted in `logs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub raw_log: String,
    pub hostname: Option<String>,

    // === NETWORK ===
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<String>,
    pub interface_in: Option<String>,
    pub interface_out: Option<String>,
    pub mac_address: Option<String>,

    // === CLASSIFICATION ===
    pub direction: Option<Direction>,
    pub rule_action: Option<Action>,
    pub rule_name: Option<String>,
    pub rule_desc: Option<String>,
    pub service_name: Option<String>,

    // === FORMAT SPECIFIC ===
    pub dhcp_event: Option<String>,
    pub dhcp_hostname: Option<String>,
    pub wifi_event: Option<String>,
    pub dns_query: Option<String>,
    pub dns_type: Option<String>,
    pub dns_answer: Option<String>,

    // === ENRICHMENT ===
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub asn_number: Option<i64>,
    pub asn_name: Option<String>,
    pub rdns: Option<String>,
    pub threat_score: Option<i16>,
    pub threat_categories: Option<Vec<String>>,
    pub abuse_usage_type: Option<String>,
    pub abuse_hostnames: Option<Vec<String>>,
    pub abuse_total_reports: Option<i32>,
    pub abuse_last_reported: Option<DateTime<Utc>>,
    pub abuse_is_whitelisted: Option<bool>,
    pub abuse_is_tor: Option<bool>,
}

impl LogRecord {
    pub fn is_blocked_firewall(&self) -> bool {
        self.log_type == LogType::Firewall && self.rule_action == Some(Action::Block)
    }

    /// Copy threat intelligence fields from a cache entry onto this record
    pub fn apply_threat(&mut self, entry: &ThreatCacheEntry) {
        self.threat_score = Some(entry.score as i16);
        self.threat_categories = Some(entry.categories.clone());
        self.abuse_usage_type = entry.usage_type.clone();
        self.abuse_hostnames = entry.hostnames.clone();
        self.abuse_total_reports = entry.total_reports;
        self.abuse_last_reported = entry.last_reported_at;
        self.abuse_is_whitelisted = entry.is_whitelisted;
        self.abuse_is_tor = entry.is_tor;
    }

    /// Whether the record has a score but lacks the detail columns
    pub fn missing_threat_details(&self) -> bool {
        self.threat_score.is_some() && self.abuse_total_reports.is_none()
    }
}

/// Threat intelligence for a single address, as persisted in `ip_threats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatCacheEntry {
    pub ip: IpAddr,
    pub score: u8,
    pub categories: Vec<String>,
    pub usage_type: Option<String>,
    pub hostnames: Option<Vec<String>>,
    pub is_tor: Option<bool>,
    pub is_whitelisted: Option<bool>,
    pub total_reports: Option<i32>,
    pub last_reported_at: Option<DateTime<Utc>>,
    pub looked_up_at: DateTime<Utc>,
}

impl ThreatCacheEntry {
    /// Entry produced by blacklist seeding: a score and the placeholder category
    pub fn seeded(ip: IpAddr, score: u8, last_reported_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            ip,
            score: score.min(100),
            categories: vec![BLACKLIST_CATEGORY.to_string()],
            usage_type: None,
            hostnames: None,
            is_tor: None,
            is_whitelisted: None,
            total_reports: None,
            last_reported_at,
            looked_up_at: now,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now - self.looked_up_at < Duration::days(THREAT_FRESHNESS_DAYS)
    }

    /// True once a full per-address lookup has been recorded
    pub fn has_details(&self) -> bool {
        self.total_reports.is_some()
    }

    pub fn has_placeholder_categories(&self) -> bool {
        self.categories.is_empty()
            || (self.categories.len() == 1 && self.categories[0] == BLACKLIST_CATEGORY)
    }

    /// Combine a stored entry with newly obtained data for the same address.
    ///
    /// The score never decreases, a placeholder category list never replaces
    /// a real one, and absent detail fields never erase stored ones.
    pub fn merge(existing: &ThreatCacheEntry, incoming: &ThreatCacheEntry) -> ThreatCacheEntry {
        let categories = if incoming.categories.is_empty()
            || (incoming.has_placeholder_categories() && !existing.has_placeholder_categories())
        {
            existing.categories.clone()
        } else {
            incoming.categories.clone()
        };

        ThreatCacheEntry {
            ip: existing.ip,
            score: existing.score.max(incoming.score),
            categories,
            usage_type: incoming.usage_type.clone().or_else(|| existing.usage_type.clone()),
            hostnames: incoming.hostnames.clone().or_else(|| existing.hostnames.clone()),
            is_tor: incoming.is_tor.or(existing.is_tor),
            is_whitelisted: incoming.is_whitelisted.or(existing.is_whitelisted),
            total_reports: incoming.total_reports.or(existing.total_reports),
            last_reported_at: incoming.last_reported_at.max(existing.last_reported_at),
            looked_up_at: incoming.looked_up_at.max(existing.looked_up_at),
        }
    }
}

/// Address worth enriching: globally routable and not one of our own ranges.
///
/// Documentation ranges are deliberately not excluded; routers see them in
/// lab setups and tests.
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_multicast()
                || o[0] == 0
                || (o[0] == 100 && (o[1] & 0xc0) == 64)
                || o[0] >= 240)
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (seg[0] & 0xfe00) == 0xfc00
                || (seg[0] & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(score: u8, categories: &[&str]) -> ThreatCacheEntry {
        ThreatCacheEntry {
            ip: "198.51.100.7".parse().unwrap(),
            score,
            categories: categories.iter().map(|c| c.to_string()).collect(),
            usage_type: Some("Data Center/Web Hosting/Transit".to_string()),
            hostnames: None,
            is_tor: Some(false),
            is_whitelisted: Some(false),
            total_reports: Some(412),
            last_reported_at: None,
            looked_up_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_blacklist_seed_never_downgrades() {
        let existing = entry(95, &["port_scan", "brute_force", "ssh"]);
        let seed = ThreatCacheEntry::seeded(
            existing.ip,
            80,
            None,
            Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
        );

        let merged = ThreatCacheEntry::merge(&existing, &seed);

        assert_eq!(merged.score, 95);
        assert_eq!(merged.categories, vec!["port_scan", "brute_force", "ssh"]);
        assert_eq!(merged.total_reports, Some(412));
        assert_eq!(merged.usage_type, existing.usage_type);
    }

    #[test]
    fn test_real_lookup_replaces_placeholder() {
        let seeded = ThreatCacheEntry::seeded("198.51.100.7".parse().unwrap(), 100, None, Utc::now());
        let lookup = entry(60, &["hacking"]);

        let merged = ThreatCacheEntry::merge(&seeded, &lookup);

        assert_eq!(merged.score, 100);
        assert_eq!(merged.categories, vec!["hacking"]);
        assert!(merged.has_details());
    }

    #[test]
    fn test_freshness_window() {
        let e = entry(10, &[]);
        assert!(e.is_fresh(e.looked_up_at + Duration::days(3)));
        assert!(!e.is_fresh(e.looked_up_at + Duration::days(4)));
    }

    #[test]
    fn test_public_ip_detection() {
        for ip in ["192.168.1.50", "10.0.0.1", "172.16.4.4", "127.0.0.1", "100.64.1.1", "169.254.3.3", "fd00::1", "fe80::1"] {
            assert!(!is_public_ip(&ip.parse().unwrap()), "{} should be private", ip);
        }
        for ip in ["203.0.113.5", "8.8.8.8", "2606:4700::1111"] {
            assert!(is_public_ip(&ip.parse().unwrap()), "{} should be public", ip);
        }
    }

    #[test]
    fn test_text_enum_roundtrip() {
        assert_eq!("inter_vlan".parse::<Direction>().unwrap(), Direction::InterVlan);
        assert_eq!(Action::Redirect.as_str(), "redirect");
        assert!("sideways".parse::<Direction>().is_err());
    }
}
