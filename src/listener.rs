//! UDP syslog intake and the datagram processing stage
//!
//! The socket loop only decodes and queues; it never waits on parsing or
//! enrichment. A full queue drops the datagram with a warning.

use futures::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::enrichment::EnrichmentPipeline;
use crate::error_handling::{InsightError, InsightResult};
use crate::models::LogRecord;
use crate::parser::MessageParser;

const MAX_DATAGRAM: usize = 65_536;

/// Every rejected message is counted; one in this many is logged at warn
const REJECT_WARN_EVERY: u64 = 100;

fn warn_on_reject(failures: u64) -> bool {
    failures == 1 || failures % REJECT_WARN_EVERY == 0
}

/// Counters shared by the listener and the processor
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    decode_failures: AtomicU64,
    queue_drops: AtomicU64,
    parse_failures: AtomicU64,
    processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub queue_drops: u64,
    pub parse_failures: u64,
    pub processed: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

pub struct SyslogListener {
    socket: UdpSocket,
    queue: mpsc::Sender<String>,
    stats: Arc<IngestStats>,
}

impl SyslogListener {
    pub async fn bind(addr: &str, queue: mpsc::Sender<String>, stats: Arc<IngestStats>) -> InsightResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| InsightError::io_with_source(format!("Failed to bind UDP socket on {}", addr), e.into()))?;
        Ok(Self { socket, queue, stats })
    }

    pub fn local_addr(&self) -> InsightResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| InsightError::io_with_source("UDP socket has no local address", e.into()))
    }

    /// Decode and queue one datagram. Returns `false` once the processor
    /// side has gone away.
    pub fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, len = bytes.len(), error = %e, "Dropping datagram that is not valid UTF-8");
                return true;
            }
        };

        match self.queue.try_send(text.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.queue_drops.fetch_add(1, Ordering::Relaxed);
                warn!(%peer, "Processing queue full, dropping datagram");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Read until cancelled. Dropping `self` afterwards closes both the
    /// socket and the queue, which lets the processor drain.
    pub async fn run(self, cancel: CancellationToken) -> InsightResult<()> {
        info!(addr = ?self.socket.local_addr().ok(), "Syslog listener started");
        let mut buffer = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Syslog listener stopping");
                    break;
                }
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, peer)) => {
                        if !self.handle_datagram(&buffer[..len], peer) {
                            warn!("Processing queue closed, stopping listener");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "UDP receive failed");
                    }
                },
            }
        }
        Ok(())
    }
}

/// Parse, classify and enrich queued datagrams, then hand records to the
/// batch writer
pub struct DatagramProcessor {
    parser: MessageParser,
    classifier: Classifier,
    enrichment: Arc<EnrichmentPipeline>,
    writer: mpsc::Sender<LogRecord>,
    stats: Arc<IngestStats>,
    workers: usize,
}

impl DatagramProcessor {
    pub fn new(
        parser: MessageParser,
        classifier: Classifier,
        enrichment: Arc<EnrichmentPipeline>,
        writer: mpsc::Sender<LogRecord>,
        stats: Arc<IngestStats>,
        workers: usize,
    ) -> Self {
        Self {
            parser,
            classifier,
            enrichment,
            writer,
            stats,
            workers: workers.max(1),
        }
    }

    /// Turn one datagram into an enriched record, `None` when unparseable
    pub async fn process(&self, raw: &str) -> Option<LogRecord> {
        let message = match self.parser.parse(raw) {
            Ok(message) => message,
            Err(e) => {
                let failures = self.stats.parse_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if warn_on_reject(failures) {
                    warn!(error = %e, raw, failures, "Rejected syslog message");
                } else {
                    debug!(error = %e, raw, "Rejected syslog message");
                }
                return None;
            }
        };

        let mut record = self.classifier.to_record(message);
        self.enrichment.enrich(&mut record).await;
        Some(record)
    }

    /// Work the queue until it is closed and empty
    pub async fn run(self, queue: mpsc::Receiver<String>) {
        let this = &self;
        ReceiverStream::new(queue)
            .for_each_concurrent(this.workers, |raw| async move {
                if let Some(record) = this.process(&raw).await {
                    this.stats.processed.fetch_add(1, Ordering::Relaxed);
                    if this.writer.send(record).await.is_err() {
                        error!("Batch writer is gone, record lost");
                    }
                }
            })
            .await;
        info!("Datagram processor drained");
    }
}

/// Log ingest counters every `interval` until cancelled
pub async fn report_stats(stats: Arc<IngestStats>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                info!(
                    received = s.received,
                    processed = s.processed,
                    decode_failures = s.decode_failures,
                    queue_drops = s.queue_drops,
                    parse_failures = s.parse_failures,
                    "Ingest statistics"
                );
            }
        }
    }
}
