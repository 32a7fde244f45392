use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::{select, time};
use tracing::{debug, error, trace, warn};

const SAVE_PERIOD: Duration = Duration::from_secs(60);

/// Counter sink the protocol engine reports into. Implementations must be
///  cheap and non-blocking: these are called on the datagram hot path.
pub trait MetricsSink: Send + Sync {
    fn add_received_bytes(&self, count: u64);
    fn add_received_packets(&self, count: u64);
    fn add_sent_bytes(&self, count: u64);
    fn add_sent_packets(&self, count: u64);
    fn add_rejected_packets(&self, count: u64);
    fn add_malformed_packets(&self, count: u64);
    fn add_resent_packets(&self, count: u64);
}

/// Plain serialisable snapshot of all counters, also the on-disk format.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub sent_packets: u64,
    pub received_packets: u64,
    pub malformed_packets: u64,
    pub rejected_packets: u64,
    pub resent_packets: u64,
}

/// In-process metrics aggregation over atomics. Counters survive restarts:
///  they are loaded from a JSON snapshot file at startup and saved back
///  periodically and on shutdown.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_packets: AtomicU64,
    malformed_packets: AtomicU64,
    rejected_packets: AtomicU64,
    resent_packets: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> GatewayMetrics {
        Default::default()
    }

    /// Load previously saved counters. Best effort: a missing or unreadable
    ///  snapshot file logs and starts from zero.
    pub async fn load(path: &Path) -> GatewayMetrics {
        let metrics = GatewayMetrics::new();

        match tokio::fs::read(path).await {
            Ok(raw) => match serde_json::from_slice::<MetricsSnapshot>(&raw) {
                Ok(snapshot) => {
                    debug!("restored metrics from {:?}: {:?}", path, snapshot);
                    metrics.restore(&snapshot);
                }
                Err(e) => warn!("failed to parse metrics snapshot {:?}, starting from zero: {}", path, e),
            },
            Err(e) => debug!("no previous metrics snapshot at {:?}: {}", path, e),
        }

        metrics
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let raw = serde_json::to_vec_pretty(&self.snapshot())?;
        tokio::fs::write(path, raw).await?;
        trace!("saved metrics snapshot to {:?}", path);
        Ok(())
    }

    /// Periodic snapshot saver, with a final save when cancelled.
    pub async fn run_saver(&self, path: PathBuf, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = time::interval(SAVE_PERIOD);
        ticks.tick().await; // the first tick fires immediately

        loop {
            select! {
                _ = ticks.tick() => {
                    if let Err(e) = self.save(&path).await {
                        error!("failed to save metrics: {}", e);
                    }
                }
                _ = cancel.recv() => {
                    if let Err(e) = self.save(&path).await {
                        error!("failed to save metrics on shutdown: {}", e);
                    }
                    return;
                }
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            rejected_packets: self.rejected_packets.load(Ordering::Relaxed),
            resent_packets: self.resent_packets.load(Ordering::Relaxed),
        }
    }

    fn restore(&self, snapshot: &MetricsSnapshot) {
        self.sent_bytes.store(snapshot.sent_bytes, Ordering::Relaxed);
        self.received_bytes.store(snapshot.received_bytes, Ordering::Relaxed);
        self.sent_packets.store(snapshot.sent_packets, Ordering::Relaxed);
        self.received_packets.store(snapshot.received_packets, Ordering::Relaxed);
        self.malformed_packets.store(snapshot.malformed_packets, Ordering::Relaxed);
        self.rejected_packets.store(snapshot.rejected_packets, Ordering::Relaxed);
        self.resent_packets.store(snapshot.resent_packets, Ordering::Relaxed);
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }
    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }
    pub fn sent_packets(&self) -> u64 {
        self.sent_packets.load(Ordering::Relaxed)
    }
    pub fn rejected_packets(&self) -> u64 {
        self.rejected_packets.load(Ordering::Relaxed)
    }
    pub fn malformed_packets(&self) -> u64 {
        self.malformed_packets.load(Ordering::Relaxed)
    }
    pub fn resent_packets(&self) -> u64 {
        self.resent_packets.load(Ordering::Relaxed)
    }
}

impl MetricsSink for GatewayMetrics {
    fn add_received_bytes(&self, count: u64) {
        self.received_bytes.fetch_add(count, Ordering::Relaxed);
    }
    fn add_received_packets(&self, count: u64) {
        self.received_packets.fetch_add(count, Ordering::Relaxed);
    }
    fn add_sent_bytes(&self, count: u64) {
        self.sent_bytes.fetch_add(count, Ordering::Relaxed);
    }
    fn add_sent_packets(&self, count: u64) {
        self.sent_packets.fetch_add(count, Ordering::Relaxed);
    }
    fn add_rejected_packets(&self, count: u64) {
        self.rejected_packets.fetch_add(count, Ordering::Relaxed);
    }
    fn add_malformed_packets(&self, count: u64) {
        self.malformed_packets.fetch_add(count, Ordering::Relaxed);
    }
    fn add_resent_packets(&self, count: u64) {
        self.resent_packets.fetch_add(count, Ordering::Relaxed);
    }
}
