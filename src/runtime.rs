//! Process wiring for the ingestion service
//!
//! Shutdown order: the listener stops reading, the processor drains the
//! queue, the batch writer flushes, background tasks stop, the pool closes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::backfill::BackfillDaemon;
use crate::batch_writer::BatchWriter;
use crate::blacklist::BlacklistSeeder;
use crate::classifier::{Classifier, NetworkConfig};
use crate::config::{InsightConfig, LoggingConfig, ThreatIntelConfig};
use crate::database_manager::{DatabaseManager, HealthStatus};
use crate::enrichment::{EnrichmentPipeline, GeoResolver, ReverseDnsResolver};
use crate::error_handling::InsightResult;
use crate::listener::{report_stats, DatagramProcessor, IngestStats, SyslogListener};
use crate::parser::MessageParser;
use crate::storage::PostgresStore;
use crate::threat::{AbuseIpDbApi, FileRateBudgetStore, RateBudget, ThreatCache, ThreatLookupClient};

const LOG_FILE_PREFIX: &str = "log_insight.log";

/// Install the global subscriber. Keep the returned guard alive for the
/// whole process or buffered file output is lost.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let stdout = if config.json {
        fmt::layer().json().with_current_span(false).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let (file, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init()
        .is_err()
    {
        debug!("Tracing subscriber already installed");
    }
    guard
}

/// Provider client sharing the on-disk budget, `None` without an API key
pub fn lookup_client(config: &ThreatIntelConfig) -> InsightResult<Option<ThreatLookupClient>> {
    let api_key = match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key,
        _ => {
            warn!("No AbuseIPDB API key configured, threat lookups disabled");
            return Ok(None);
        }
    };

    let api = AbuseIpDbApi::new(
        &config.base_url,
        api_key,
        Duration::from_secs(config.request_timeout_secs),
        config.max_age_in_days,
    )?;
    let budget = RateBudget::new(Arc::new(FileRateBudgetStore::new(config.budget_file.clone())));
    Ok(Some(ThreatLookupClient::new(Arc::new(api), budget)))
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(unix)]
async fn reload_geo_on_sighup(geo: Arc<GeoResolver>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, GeoIP hot reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!("SIGHUP received, reloading GeoIP databases");
                geo.reload();
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_geo_on_sighup(_geo: Arc<GeoResolver>, cancel: CancellationToken) {
    cancel.cancelled().await;
}

async fn sweep_memory(cache: Arc<ThreatCache>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = cache.sweep_memory();
                debug!(evicted, remaining = cache.memory_len(), "Swept threat memory cache");
            }
        }
    }
}

async fn join(name: &'static str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!(task = name, error = %e, "Task ended abnormally");
    }
}

/// Run the service until a shutdown signal arrives
pub async fn run(config: InsightConfig) -> InsightResult<()> {
    let db = DatabaseManager::connect(&config.database).await?;
    db.init_schema().await?;
    let health = db.health_check().await;
    if health.health_status == HealthStatus::Healthy {
        info!(pool_size = health.size, latency_ms = health.probe_latency_ms, "Database ready");
    } else {
        warn!(status = ?health.health_status, latency_ms = health.probe_latency_ms, "Database probe not healthy at startup");
    }
    let store = Arc::new(PostgresStore::new(db.pool().clone()));

    let client = lookup_client(&config.threat_intel)?;
    let cache = Arc::new(ThreatCache::new(
        store.clone(),
        client.clone(),
        Duration::from_secs(config.threat_intel.memory_ttl_secs),
    ));

    let enrich_cfg = &config.enrichment;
    let geo = Arc::new(GeoResolver::open(enrich_cfg.geoip_city_db.clone(), enrich_cfg.geoip_asn_db.clone()));
    let rdns = ReverseDnsResolver::new(enrich_cfg.rdns_enabled, Duration::from_millis(enrich_cfg.rdns_timeout_ms));
    let enrichment = Arc::new(EnrichmentPipeline::new(
        geo.clone(),
        rdns,
        cache.clone(),
        enrich_cfg.threat_policy,
        config.network.wan_ips.iter().copied(),
    ));

    let stats = Arc::new(IngestStats::default());
    let (queue_tx, queue_rx) = mpsc::channel(config.listener.queue_capacity);
    let (record_tx, record_rx) = mpsc::channel(config.batch.channel_capacity);

    let listener = SyslogListener::bind(&config.listener.bind, queue_tx, stats.clone()).await?;
    info!(addr = %listener.local_addr()?, "Listening for syslog datagrams");

    let processor = DatagramProcessor::new(
        MessageParser::new(config.parser.source_utc_offset_minutes),
        Classifier::new(NetworkConfig::from_settings(&config.network)),
        enrichment.clone(),
        record_tx,
        stats.clone(),
        config.listener.workers,
    );
    let writer = BatchWriter::new(
        store.clone(),
        config.batch.size,
        Duration::from_millis(config.batch.max_age_ms),
    );

    let ingest_cancel = CancellationToken::new();
    let background_cancel = CancellationToken::new();

    let listener_task = {
        let cancel = ingest_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(cancel).await {
                error!(error = %e, "Syslog listener failed");
            }
        })
    };
    let processor_task = tokio::spawn(processor.run(queue_rx));
    let writer_task = tokio::spawn(async move {
        writer.run(record_rx).await;
    });

    let mut background = vec![
        (
            "stats",
            tokio::spawn(report_stats(
                stats.clone(),
                Duration::from_secs(config.listener.stats_interval_secs.max(1)),
                background_cancel.clone(),
            )),
        ),
        (
            "memory_sweep",
            tokio::spawn(sweep_memory(
                cache.clone(),
                Duration::from_secs(config.threat_intel.memory_sweep_interval_secs.max(1)),
                background_cancel.clone(),
            )),
        ),
        (
            "geo_reload",
            tokio::spawn(reload_geo_on_sighup(geo.clone(), background_cancel.clone())),
        ),
    ];

    if config.backfill.enabled {
        let daemon = BackfillDaemon::new(store.clone(), store.clone(), enrichment.clone(), config.backfill.clone());
        background.push(("backfill", tokio::spawn(daemon.run(background_cancel.clone()))));
    }

    match (&client, config.blacklist.enabled) {
        (Some(client), true) => {
            let seeder = BlacklistSeeder::new(client.clone(), cache.clone(), config.blacklist.clone());
            background.push(("blacklist", tokio::spawn(seeder.run(background_cancel.clone()))));
        }
        (None, true) => info!("Blacklist seeding needs an API key, not scheduled"),
        _ => {}
    }

    info!(
        workers = config.listener.workers,
        batch_size = config.batch.size,
        geoip = geo.is_available(),
        threat_lookups = cache.lookups_enabled(),
        "Log insight pipeline running"
    );

    shutdown_signal().await;
    info!("Shutting down");

    ingest_cancel.cancel();
    join("listener", listener_task).await;
    join("processor", processor_task).await;
    join("writer", writer_task).await;

    background_cancel.cancel();
    for (name, handle) in background {
        join(name, handle).await;
    }

    let final_stats = stats.snapshot();
    info!(
        received = final_stats.received,
        processed = final_stats.processed,
        "Ingest stopped"
    );

    db.close().await;
    info!("Shutdown complete");
    Ok(())
}
