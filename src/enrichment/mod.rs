//! Record enrichment: geography, ASN, reverse DNS and threat intelligence
//!
//! Decides which address of a record is the remote party and whether the
//! record qualifies for a threat lookup. Router-owned WAN addresses are
//! never enriched; they are configured statically and learned from
//! `WAN_LOCAL` rule hits.

pub mod geo;
pub mod rdns;

use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ThreatPolicy;
use crate::models::{is_public_ip, Direction, LogRecord};
use crate::threat::ThreatCache;

pub use geo::{GeoInfo, GeoResolver};
pub use rdns::ReverseDnsResolver;

const SELF_RULE_MARKER: &str = "WAN_LOCAL";

pub struct EnrichmentPipeline {
    geo: Arc<GeoResolver>,
    rdns: ReverseDnsResolver,
    threats: Arc<ThreatCache>,
    policy: ThreatPolicy,
    self_ips: RwLock<HashSet<IpAddr>>,
}

impl EnrichmentPipeline {
    pub fn new(
        geo: Arc<GeoResolver>,
        rdns: ReverseDnsResolver,
        threats: Arc<ThreatCache>,
        policy: ThreatPolicy,
        wan_ips: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            geo,
            rdns,
            threats,
            policy,
            self_ips: RwLock::new(wan_ips.into_iter().collect()),
        }
    }

    pub fn policy(&self) -> ThreatPolicy {
        self.policy
    }

    pub fn threats(&self) -> &Arc<ThreatCache> {
        &self.threats
    }

    pub fn is_self(&self, ip: &IpAddr) -> bool {
        self.self_ips.read().contains(ip)
    }

    /// Remember the destination of traffic aimed at the router itself
    pub fn learn_self_ip(&self, record: &LogRecord) {
        let targets_router = record
            .rule_name
            .as_deref()
            .map_or(false, |rule| rule.to_ascii_uppercase().contains(SELF_RULE_MARKER));
        if !targets_router {
            return;
        }
        if let Some(ip) = record.dst_ip.filter(is_public_ip) {
            if !self.is_self(&ip) && self.self_ips.write().insert(ip) {
                info!(%ip, "Learned router WAN address");
            }
        }
    }

    /// Public address that is not the router's own
    fn remote(&self, ip: Option<IpAddr>) -> Option<IpAddr> {
        ip.filter(|ip| is_public_ip(ip) && !self.is_self(ip))
    }

    /// Address to enrich: the remote source, else the remote destination
    pub fn target_address(&self, src: Option<IpAddr>, dst: Option<IpAddr>) -> Option<IpAddr> {
        self.remote(src).or_else(|| self.remote(dst))
    }

    /// Whether this record should carry threat data under the active policy
    pub fn is_eligible(&self, record: &LogRecord) -> bool {
        if !record.is_blocked_firewall() {
            return false;
        }
        match self.policy {
            ThreatPolicy::BlockedAny => true,
            ThreatPolicy::BlockedInbound => record.direction == Some(Direction::Inbound),
        }
    }

    pub async fn enrich(&self, record: &mut LogRecord) {
        self.learn_self_ip(record);

        let target = match self.target_address(record.src_ip, record.dst_ip) {
            Some(ip) => ip,
            None => return,
        };

        if let Some(geo) = self.geo.lookup(target) {
            record.geo_country = geo.country;
            record.geo_city = geo.city;
            record.geo_lat = geo.latitude;
            record.geo_lon = geo.longitude;
            record.asn_number = geo.asn_number;
            record.asn_name = geo.asn_name;
        }

        let eligible = self.is_eligible(record);
        let threat_lookup = async {
            if eligible {
                self.threats.lookup(target).await
            } else {
                None
            }
        };
        let (rdns, threat) = tokio::join!(self.rdns.resolve(target), threat_lookup);

        record.rdns = rdns;
        if let Some(entry) = threat {
            debug!(ip = %target, score = entry.score, "Applied threat data");
            record.apply_threat(&entry);
        }
    }
}
