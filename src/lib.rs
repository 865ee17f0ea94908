//! SIEM Log Insight
//!
//! Ingests router syslog over UDP, classifies firewall, DHCP, Wi-Fi and DNS
//! events, enriches them with GeoIP, reverse DNS and AbuseIPDB threat data,
//! and stores them in PostgreSQL.
//!
//! # Modules
//!
//! - `parser` / `parsed_event`: syslog framing and per-format extraction
//! - `classifier`: traffic direction and rule action
//! - `threat`: quota-aware provider client and the tiered threat cache
//! - `enrichment`: GeoIP, reverse DNS and threat data applied to records
//! - `storage`: repositories for logs and cached threat data
//! - `listener`, `batch_writer`: the live ingest path
//! - `backfill`, `blacklist`: background reconciliation
//! - `runtime`: process wiring and shutdown

pub mod backfill;
pub mod batch_writer;
pub mod blacklist;
pub mod classifier;
pub mod config;
pub mod database_manager;
pub mod enrichment;
pub mod error_handling;
pub mod listener;
pub mod models;
pub mod parsed_event;
pub mod parser;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod threat;

pub use backfill::{BackfillDaemon, BackfillReport};
pub use batch_writer::{BatchWriter, FlushReport};
pub use blacklist::BlacklistSeeder;
pub use classifier::{Classifier, NetworkConfig};
pub use config::{InsightConfig, ThreatPolicy};
pub use database_manager::DatabaseManager;
pub use enrichment::EnrichmentPipeline;
pub use error_handling::{InsightError, InsightResult};
pub use models::{Action, Direction, LogRecord, LogType, ThreatCacheEntry};
pub use parsed_event::{ParsedEvent, ParsedMessage};
pub use parser::MessageParser;
pub use storage::{LogStore, MemoryStore, PostgresStore, ThreatCacheStore};
pub use threat::{LookupResult, RateBudget, ThreatCache, ThreatLookupClient};
