//! Best-effort audit side channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::models::audit::AuditRecord;

const SINK_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, record: &AuditRecord) -> anyhow::Result<()>;
}

/// Hands audit records to a background task that fans them out to sinks.
///
/// Enqueueing never blocks; a full queue drops the record and counts it.
/// Sink failures are logged and never reach the operation that produced the
/// record.
#[derive(Clone)]
pub struct AuditForwarder {
    tx: mpsc::Sender<AuditRecord>,
    dropped_total: Arc<AtomicU64>,
}

impl AuditForwarder {
    /// Spawns the forwarding task. Must be called inside a Tokio runtime.
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>, queue_size: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(queue_size.max(1));
        let dropped_total = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                for sink in &sinks {
                    let sink_name = sink.name();
                    match timeout(SINK_TIMEOUT, sink.send(&record)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(sink = sink_name, error = %err, "Audit sink send failed");
                        }
                        Err(_) => {
                            tracing::warn!(sink = sink_name, "Audit sink send timed out");
                        }
                    }
                }
            }
            tracing::debug!("Audit forwarder stopped");
        });

        Self { tx, dropped_total }
    }

    pub fn try_enqueue(&self, record: AuditRecord) {
        if let Err(err) = self.tx.try_send(record) {
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %err, "Audit queue full; dropping record");
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

/// Writes each record to the log as one JSON line under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn send(&self, record: &AuditRecord) -> anyhow::Result<()> {
        let line = sonic_rs::to_string(record)?;
        tracing::info!(target: "audit", "{}", line);
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    /// Waits until at least `count` records have arrived or `within` elapses,
    /// then returns what has arrived.
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<AuditRecord> {
        let _ = timeout(within, async {
            while self.records.lock().await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.records().await
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, record: &AuditRecord) -> anyhow::Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
