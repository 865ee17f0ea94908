//! Buffered log persistence
//!
//! Records are written in bulk once the buffer holds `batch_size` records or
//! its oldest record has waited `max_age`. A failed bulk insert falls back to
//! row-by-row inserts so one bad row costs only itself.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::LogRecord;
use crate::storage::LogStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: u64,
    pub failed: u64,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.inserted += other.inserted;
        self.failed += other.failed;
    }
}

pub struct BatchWriter {
    store: Arc<dyn LogStore>,
    batch_size: usize,
    max_age: Duration,
    buffer: Vec<LogRecord>,
    oldest: Option<Instant>,
    totals: FlushReport,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn LogStore>, batch_size: usize, max_age: Duration) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            max_age,
            buffer: Vec::with_capacity(batch_size),
            oldest: None,
            totals: FlushReport::default(),
        }
    }

    pub fn enqueue(&mut self, record: LogRecord) {
        if self.buffer.is_empty() {
            self.oldest = Some(Instant::now());
        }
        self.buffer.push(record);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// When the buffer must be flushed by age
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|t| t + self.max_age)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.buffer.len() >= self.batch_size || self.deadline().map_or(false, |d| now >= d)
    }

    pub fn totals(&self) -> FlushReport {
        self.totals
    }

    /// Persist everything buffered
    pub async fn flush(&mut self) -> FlushReport {
        if self.buffer.is_empty() {
            return FlushReport::default();
        }
        let records = std::mem::take(&mut self.buffer);
        self.oldest = None;

        let report = match self.store.insert_batch(&records).await {
            Ok(inserted) => FlushReport { inserted, failed: 0 },
            Err(e) => {
                warn!(
                    error = %e,
                    code = e.error_code(),
                    records = records.len(),
                    "Bulk insert failed, falling back to row-by-row"
                );
                self.insert_individually(&records).await
            }
        };

        debug!(inserted = report.inserted, failed = report.failed, "Flushed log batch");
        self.totals.absorb(report);
        report
    }

    async fn insert_individually(&self, records: &[LogRecord]) -> FlushReport {
        let mut report = FlushReport::default();
        for record in records {
            match self.store.insert_one(record).await {
                Ok(()) => report.inserted += 1,
                Err(e) => {
                    error!(
                        error = %e,
                        code = e.error_code(),
                        log_type = %record.log_type,
                        raw = %record.raw_log,
                        "Dropping log row that failed to insert"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Consume records until every sender is gone, then flush what is left
    pub async fn run(mut self, mut rx: mpsc::Receiver<LogRecord>) -> FlushReport {
        loop {
            let deadline = self.deadline();
            let age_flush = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        self.enqueue(record);
                        if self.is_due(Instant::now()) {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = age_flush => {
                    self.flush().await;
                }
            }
        }

        self.flush().await;
        let totals = self.totals;
        info!(inserted = totals.inserted, failed = totals.failed, "Batch writer stopped");
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogType;
    use crate::storage::MemoryStore;

    fn record(i: usize) -> LogRecord {
        LogRecord {
            log_type: LogType::System,
            raw_log: format!("line {}", i),
            ..LogRecord::default()
        }
    }

    #[tokio::test]
    async fn test_one_bad_row_costs_only_itself() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = BatchWriter::new(store.clone(), 50, Duration::from_secs(2));

        for i in 0..50 {
            let mut r = record(i);
            if i == 17 {
                r.threat_score = Some(101);
            }
            writer.enqueue(r);
        }
        assert!(writer.is_due(Instant::now()));

        let report = writer.flush().await;

        assert_eq!(report, FlushReport { inserted: 49, failed: 1 });
        assert_eq!(store.logs().len(), 49);
        assert_eq!(store.bulk_insert_calls(), 1);
        assert_eq!(store.single_insert_calls(), 50);
        assert!(writer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_age_triggers_flush() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        let writer = BatchWriter::new(store.clone(), 50, Duration::from_secs(2));
        let handle = tokio::spawn(writer.run(rx));

        tx.send(record(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(store.logs().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.logs().len(), 1);

        drop(tx);
        let totals = handle.await.unwrap();
        assert_eq!(totals, FlushReport { inserted: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_remaining_buffer_flushed_on_close() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = mpsc::channel(16);
        let writer = BatchWriter::new(store.clone(), 50, Duration::from_secs(60));

        for i in 0..3 {
            tx.send(record(i)).await.unwrap();
        }
        drop(tx);

        let totals = writer.run(rx).await;
        assert_eq!(totals.inserted, 3);
        assert_eq!(store.logs().len(), 3);
    }
}
