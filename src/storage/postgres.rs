//! PostgreSQL repositories
//!
//! Addresses are bound as text and cast to `inet` in SQL, and read back
//! through `host(..)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, QueryBuilder};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::config::ThreatPolicy;
use crate::error_handling::{ErrorContext, InsightResult};
use crate::models::{LogRecord, ThreatCacheEntry};
use crate::storage::{dedupe_entries, LogStore, ThreatCacheStore, UnscoredPair};

/// Rows per statement, keeps bind parameters well below the protocol limit
const CHUNK_ROWS: usize = 1000;

const LOG_COLUMNS: &str = "timestamp, log_type, raw_log, hostname, src_ip, dst_ip, src_port, dst_port, \
    protocol, interface_in, interface_out, mac_address, direction, rule_action, rule_name, rule_desc, \
    service_name, dhcp_event, dhcp_hostname, wifi_event, dns_query, dns_type, dns_answer, geo_country, \
    geo_city, geo_lat, geo_lon, asn_number, asn_name, rdns, threat_score, threat_categories, \
    abuse_usage_type, abuse_hostnames, abuse_total_reports, abuse_last_reported, abuse_is_whitelisted, \
    abuse_is_tor";

const THREAT_COLUMNS: &str = "host(ip) AS ip, threat_score, threat_categories, abuse_usage_type, \
    abuse_hostnames, abuse_is_tor, abuse_is_whitelisted, abuse_total_reports, abuse_last_reported, \
    looked_up_at";

/// Threat columns copied from `ip_threats t` onto `logs`
const PATCH_SET: &str = "threat_score = t.threat_score, threat_categories = t.threat_categories, \
    abuse_usage_type = t.abuse_usage_type, abuse_hostnames = t.abuse_hostnames, \
    abuse_total_reports = t.abuse_total_reports, abuse_last_reported = t.abuse_last_reported, \
    abuse_is_whitelisted = t.abuse_is_whitelisted, abuse_is_tor = t.abuse_is_tor";

#[derive(Debug, FromRow)]
struct ThreatRow {
    ip: String,
    threat_score: i16,
    threat_categories: Vec<String>,
    abuse_usage_type: Option<String>,
    abuse_hostnames: Option<Vec<String>>,
    abuse_is_tor: Option<bool>,
    abuse_is_whitelisted: Option<bool>,
    abuse_total_reports: Option<i32>,
    abuse_last_reported: Option<DateTime<Utc>>,
    looked_up_at: DateTime<Utc>,
}

impl ThreatRow {
    fn into_entry(self) -> Option<ThreatCacheEntry> {
        let ip = match self.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(ip = %self.ip, "Skipping threat row with unparseable address");
                return None;
            }
        };
        Some(ThreatCacheEntry {
            ip,
            score: self.threat_score.clamp(0, 100) as u8,
            categories: self.threat_categories,
            usage_type: self.abuse_usage_type,
            hostnames: self.abuse_hostnames,
            is_tor: self.abuse_is_tor,
            is_whitelisted: self.abuse_is_whitelisted,
            total_reports: self.abuse_total_reports,
            last_reported_at: self.abuse_last_reported,
            looked_up_at: self.looked_up_at,
        })
    }
}

/// `AND ...` clause restricting `logs l` to events eligible for threat data
fn eligibility(policy: ThreatPolicy) -> &'static str {
    match policy {
        ThreatPolicy::BlockedAny => "l.log_type = 'firewall' AND l.rule_action = 'block'",
        ThreatPolicy::BlockedInbound => {
            "l.log_type = 'firewall' AND l.rule_action = 'block' AND l.direction = 'inbound'"
        }
    }
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn push_record(builder: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, r: &LogRecord) {
        builder
            .push_bind(r.timestamp)
            .push_bind(r.log_type.as_str())
            .push_bind(r.raw_log.clone())
            .push_bind(r.hostname.clone())
            .push_bind(r.src_ip.map(|ip| ip.to_string()))
            .push_unseparated("::inet")
            .push_bind(r.dst_ip.map(|ip| ip.to_string()))
            .push_unseparated("::inet")
            .push_bind(r.src_port.map(i32::from))
            .push_bind(r.dst_port.map(i32::from))
            .push_bind(r.protocol.clone())
            .push_bind(r.interface_in.clone())
            .push_bind(r.interface_out.clone())
            .push_bind(r.mac_address.clone())
            .push_bind(r.direction.map(|d| d.as_str()))
            .push_bind(r.rule_action.map(|a| a.as_str()))
            .push_bind(r.rule_name.clone())
            .push_bind(r.rule_desc.clone())
            .push_bind(r.service_name.clone())
            .push_bind(r.dhcp_event.clone())
            .push_bind(r.dhcp_hostname.clone())
            .push_bind(r.wifi_event.clone())
            .push_bind(r.dns_query.clone())
            .push_bind(r.dns_type.clone())
            .push_bind(r.dns_answer.clone())
            .push_bind(r.geo_country.clone())
            .push_bind(r.geo_city.clone())
            .push_bind(r.geo_lat)
            .push_bind(r.geo_lon)
            .push_bind(r.asn_number)
            .push_bind(r.asn_name.clone())
            .push_bind(r.rdns.clone())
            .push_bind(r.threat_score)
            .push_bind(r.threat_categories.clone())
            .push_bind(r.abuse_usage_type.clone())
            .push_bind(r.abuse_hostnames.clone())
            .push_bind(r.abuse_total_reports)
            .push_bind(r.abuse_last_reported)
            .push_bind(r.abuse_is_whitelisted)
            .push_bind(r.abuse_is_tor);
    }

    async fn patch_pass(&self, column: &str, filter: &str, fresh_after: Option<DateTime<Utc>>, limit: i64) -> InsightResult<u64> {
        // The destination pass skips rows whose source already has a cache entry
        let src_guard = if column == "dst_ip" {
            "AND NOT EXISTS (SELECT 1 FROM ip_threats s WHERE s.ip = l.src_ip)"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE logs SET {set} FROM ip_threats t \
             WHERE logs.{col} = t.ip AND logs.id IN ( \
                 SELECT l.id FROM logs l JOIN ip_threats t2 ON l.{col} = t2.ip \
                 WHERE {filter} {guard} AND ($1::timestamptz IS NULL OR t2.looked_up_at >= $1) \
                 LIMIT $2)",
            set = PATCH_SET,
            col = column,
            filter = filter,
            guard = src_guard,
        );

        let result = sqlx::query(&sql)
            .bind(fresh_after)
            .bind(limit)
            .execute(&self.pool)
            .await
            .with_database_context(|| format!("Failed to patch logs by {}", column))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn insert_batch(&self, records: &[LogRecord]) -> InsightResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .with_database_context(|| "Failed to open insert transaction".to_string())?;
        let mut inserted = 0;

        for chunk in records.chunks(CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO logs ({}) ", LOG_COLUMNS));
            builder.push_values(chunk, |mut b, record| Self::push_record(&mut b, record));

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .with_database_context(|| format!("Bulk insert of {} logs failed", chunk.len()))?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .with_database_context(|| "Failed to commit log batch".to_string())?;
        Ok(inserted)
    }

    async fn insert_one(&self, record: &LogRecord) -> InsightResult<()> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!("INSERT INTO logs ({}) ", LOG_COLUMNS));
        builder.push_values(std::iter::once(record), |mut b, record| Self::push_record(&mut b, record));
        builder
            .build()
            .execute(&self.pool)
            .await
            .with_database_context(|| "Insert of single log failed".to_string())?;
        Ok(())
    }

    async fn patch_scores_from_cache(
        &self,
        fresh_after: DateTime<Utc>,
        limit: i64,
        policy: ThreatPolicy,
    ) -> InsightResult<u64> {
        let filter = format!("l.threat_score IS NULL AND {}", eligibility(policy));
        let by_src = self.patch_pass("src_ip", &filter, Some(fresh_after), limit).await?;
        let by_dst = self.patch_pass("dst_ip", &filter, Some(fresh_after), limit).await?;
        debug!(by_src, by_dst, "Patched unscored logs from cache");
        Ok(by_src + by_dst)
    }

    async fn patch_missing_details(&self, limit: i64) -> InsightResult<u64> {
        let filter = "l.threat_score IS NOT NULL AND l.abuse_total_reports IS NULL \
                      AND t2.abuse_total_reports IS NOT NULL";
        let by_src = self.patch_pass("src_ip", filter, None, limit).await?;
        let by_dst = self.patch_pass("dst_ip", filter, None, limit).await?;
        Ok(by_src + by_dst)
    }

    async fn unscored_without_cache(&self, limit: i64, policy: ThreatPolicy) -> InsightResult<Vec<UnscoredPair>> {
        let sql = format!(
            "SELECT DISTINCT host(l.src_ip) AS src, host(l.dst_ip) AS dst FROM logs l \
             WHERE l.threat_score IS NULL AND {} \
               AND NOT EXISTS (SELECT 1 FROM ip_threats t WHERE t.ip = l.src_ip) \
               AND NOT EXISTS (SELECT 1 FROM ip_threats t WHERE t.ip = l.dst_ip) \
             LIMIT $1",
            eligibility(policy)
        );

        let rows: Vec<(Option<String>, Option<String>)> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_database_context(|| "Failed to find orphan addresses".to_string())?;

        Ok(rows
            .into_iter()
            .map(|(src, dst)| {
                (
                    src.and_then(|s| s.parse().ok()),
                    dst.and_then(|d| d.parse().ok()),
                )
            })
            .collect())
    }

    async fn patch_ip(&self, entry: &ThreatCacheEntry, policy: ThreatPolicy) -> InsightResult<u64> {
        let sql = format!(
            "UPDATE logs l SET threat_score = $2, threat_categories = $3, abuse_usage_type = $4, \
                 abuse_hostnames = $5, abuse_total_reports = $6, abuse_last_reported = $7, \
                 abuse_is_whitelisted = $8, abuse_is_tor = $9 \
             WHERE (l.src_ip = $1::inet OR l.dst_ip = $1::inet) AND {}",
            eligibility(policy)
        );

        let result = sqlx::query(&sql)
            .bind(entry.ip.to_string())
            .bind(entry.score as i16)
            .bind(&entry.categories)
            .bind(&entry.usage_type)
            .bind(&entry.hostnames)
            .bind(entry.total_reports)
            .bind(entry.last_reported_at)
            .bind(entry.is_whitelisted)
            .bind(entry.is_tor)
            .execute(&self.pool)
            .await
            .with_database_context(|| format!("Failed to patch logs for {}", entry.ip))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ThreatCacheStore for PostgresStore {
    async fn get(&self, ip: IpAddr) -> InsightResult<Option<ThreatCacheEntry>> {
        let row: Option<ThreatRow> =
            sqlx::query_as(&format!("SELECT {} FROM ip_threats WHERE ip = $1::inet", THREAT_COLUMNS))
                .bind(ip.to_string())
                .fetch_optional(&self.pool)
                .await
                .with_database_context(|| format!("Failed to read threat entry for {}", ip))?;
        Ok(row.and_then(ThreatRow::into_entry))
    }

    async fn merge_entries(&self, entries: &[ThreatCacheEntry]) -> InsightResult<Vec<ThreatCacheEntry>> {
        let unique = dedupe_entries(entries);
        let mut stored = Vec::with_capacity(unique.len());

        for chunk in unique.chunks(CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO ip_threats (ip, threat_score, threat_categories, abuse_usage_type, \
                 abuse_hostnames, abuse_is_tor, abuse_is_whitelisted, abuse_total_reports, \
                 abuse_last_reported, looked_up_at) ",
            );
            builder.push_values(chunk, |mut b, e| {
                b.push_bind(e.ip.to_string())
                    .push_unseparated("::inet")
                    .push_bind(e.score as i16)
                    .push_bind(e.categories.clone())
                    .push_bind(e.usage_type.clone())
                    .push_bind(e.hostnames.clone())
                    .push_bind(e.is_tor)
                    .push_bind(e.is_whitelisted)
                    .push_bind(e.total_reports)
                    .push_bind(e.last_reported_at)
                    .push_bind(e.looked_up_at);
            });
            // Same rule as ThreatCacheEntry::merge, evaluated against the row
            // as it is at write time
            builder.push(
                " ON CONFLICT (ip) DO UPDATE SET \
                 threat_score = GREATEST(ip_threats.threat_score, EXCLUDED.threat_score), \
                 threat_categories = CASE \
                     WHEN cardinality(EXCLUDED.threat_categories) = 0 THEN ip_threats.threat_categories \
                     WHEN EXCLUDED.threat_categories = ARRAY['blacklist'] \
                          AND cardinality(ip_threats.threat_categories) > 0 \
                          AND ip_threats.threat_categories <> ARRAY['blacklist'] \
                         THEN ip_threats.threat_categories \
                     ELSE EXCLUDED.threat_categories END, \
                 abuse_usage_type = COALESCE(EXCLUDED.abuse_usage_type, ip_threats.abuse_usage_type), \
                 abuse_hostnames = COALESCE(EXCLUDED.abuse_hostnames, ip_threats.abuse_hostnames), \
                 abuse_is_tor = COALESCE(EXCLUDED.abuse_is_tor, ip_threats.abuse_is_tor), \
                 abuse_is_whitelisted = COALESCE(EXCLUDED.abuse_is_whitelisted, ip_threats.abuse_is_whitelisted), \
                 abuse_total_reports = COALESCE(EXCLUDED.abuse_total_reports, ip_threats.abuse_total_reports), \
                 abuse_last_reported = GREATEST(EXCLUDED.abuse_last_reported, ip_threats.abuse_last_reported), \
                 looked_up_at = GREATEST(EXCLUDED.looked_up_at, ip_threats.looked_up_at) \
                 RETURNING ",
            );
            builder.push(THREAT_COLUMNS);

            let rows: Vec<ThreatRow> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .with_database_context(|| format!("Failed to merge {} threat entries", chunk.len()))?;
            stored.extend(rows.into_iter().filter_map(ThreatRow::into_entry));
        }

        Ok(stored)
    }

    async fn refresh_candidates(&self, stale_before: DateTime<Utc>, limit: i64) -> InsightResult<Vec<IpAddr>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT host(t.ip) FROM ip_threats t \
             WHERE t.looked_up_at < $1 AND t.abuse_total_reports IS NULL \
             ORDER BY GREATEST( \
                 (SELECT max(l.timestamp) FROM logs l WHERE l.src_ip = t.ip), \
                 (SELECT max(l.timestamp) FROM logs l WHERE l.dst_ip = t.ip) \
             ) DESC NULLS LAST, t.threat_score DESC \
             LIMIT $2",
        )
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .with_database_context(|| "Failed to select refresh candidates".to_string())?;

        Ok(rows.into_iter().filter_map(|(ip,)| ip.parse().ok()).collect())
    }
}
