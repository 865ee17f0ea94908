mod common;

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::ScriptedApi;
use siem_log_insight::backfill::BackfillDaemon;
use siem_log_insight::batch_writer::BatchWriter;
use siem_log_insight::config::BackfillConfig;
use siem_log_insight::listener::{DatagramProcessor, IngestStats};
use siem_log_insight::models::{Action, Direction, LogRecord, LogType};
use siem_log_insight::parser::MessageParser;
use siem_log_insight::storage::{LogStore, MemoryStore};

const BLOCKED_INBOUND: &str = "<4>Mar  3 10:23:45 UDM-Pro kernel: [WAN_IN-3001-B]IN=eth8 OUT=br0 \
    MAC=aa:bb:cc:dd:ee:ff:11:22:33:44:55:66:08:00 SRC=203.0.113.5 DST=192.168.1.50 LEN=60 \
    PROTO=TCP SPT=51234 DPT=22";

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn backfill(store: &Arc<MemoryStore>, api: &Arc<ScriptedApi>) -> BackfillDaemon {
    let cache = common::threat_cache(store, api);
    BackfillDaemon::new(
        store.clone(),
        store.clone(),
        common::enrichment(cache),
        BackfillConfig {
            lookup_pause_ms: 0,
            ..BackfillConfig::default()
        },
    )
}

#[tokio::test]
async fn blocked_inbound_datagram_is_stored_with_threat_score() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    api.set_score("203.0.113.5", 93);
    let cache = common::threat_cache(&store, &api);

    let (queue_tx, queue_rx) = mpsc::channel(16);
    let (record_tx, record_rx) = mpsc::channel(16);
    let processor = DatagramProcessor::new(
        MessageParser::default(),
        common::classifier(),
        common::enrichment(cache),
        record_tx,
        Arc::new(IngestStats::default()),
        4,
    );
    let writer = BatchWriter::new(store.clone(), 50, Duration::from_secs(2));

    queue_tx.send(BLOCKED_INBOUND.to_string()).await.unwrap();
    drop(queue_tx);

    let writer_task = tokio::spawn(writer.run(record_rx));
    processor.run(queue_rx).await;
    let totals = writer_task.await.unwrap();

    assert_eq!(totals.inserted, 1);
    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    let record = &logs[0];
    assert_eq!(record.log_type, LogType::Firewall);
    assert_eq!(record.direction, Some(Direction::Inbound));
    assert_eq!(record.rule_action, Some(Action::Block));
    assert_eq!(record.service_name.as_deref(), Some("SSH"));
    assert_eq!(record.threat_score, Some(93));
    assert_eq!(
        record.threat_categories,
        Some(vec!["Port Scan".to_string(), "SSH".to_string()])
    );
    assert_eq!(record.abuse_total_reports, Some(12));
    assert_eq!(api.check_calls(), 1);
}

fn orphan_log() -> LogRecord {
    LogRecord {
        timestamp: Utc::now(),
        log_type: LogType::Firewall,
        raw_log: BLOCKED_INBOUND.to_string(),
        src_ip: Some(ip("198.51.100.23")),
        dst_ip: Some(ip("192.168.1.50")),
        interface_in: Some("eth8".to_string()),
        interface_out: Some("br0".to_string()),
        rule_name: Some("WAN_IN-3001-B".to_string()),
        rule_action: Some(Action::Block),
        direction: Some(Direction::Inbound),
        ..LogRecord::default()
    }
}

#[tokio::test]
async fn orphan_is_enriched_in_one_cycle_and_left_alone_after() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    api.set_score("198.51.100.23", 64);
    store.insert_batch(&[orphan_log(), orphan_log()]).await.unwrap();

    let daemon = backfill(&store, &api);
    let cancel = CancellationToken::new();

    let first = daemon.run_cycle(&cancel).await;
    assert_eq!(first.orphans_found, 1);
    assert_eq!(first.orphans_enriched, 1);
    assert_eq!(first.repatched, 2);
    assert_eq!(api.check_calls(), 1);
    assert!(store.logs().iter().all(|r| r.threat_score == Some(64)));
    assert!(store.threat(ip("198.51.100.23")).unwrap().has_details());

    let second = daemon.run_cycle(&cancel).await;
    assert_eq!(second.orphans_found, 0);
    assert_eq!(second.fetched(), 0);
    assert_eq!(api.check_calls(), 1);
}

#[tokio::test]
async fn allowed_traffic_is_never_looked_up() {
    let store = Arc::new(MemoryStore::new());
    let api = ScriptedApi::new();
    let mut allowed = orphan_log();
    allowed.rule_action = Some(Action::Allow);
    store.insert_one(&allowed).await.unwrap();

    let report = backfill(&store, &api).run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.orphans_found, 0);
    assert_eq!(api.check_calls(), 0);
    assert_eq!(store.logs()[0].threat_score, None);
}
