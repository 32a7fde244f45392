use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, trace, warn};

use crate::metrics::MetricsSink;
use crate::util::hex::to_hex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DedupVerdict {
    Fresh,
    Duplicate,
}

#[derive(Clone, Debug)]
struct DedupEntry {
    first_seen: Instant,
    last_seen: Instant,
}

/// Remembers the raw bytes of recently seen datagrams so retransmissions can
///  be counted. The verdict is advisory only: a duplicate is still acked and
///  still published, because the device retransmits until it sees its ack
///  and suppressing the ack would only amplify the storm.
///
/// Fingerprints are exact on the raw bytes. Two semantically equal but
///  byte-distinct datagrams are different entries.
pub struct DedupCache {
    retention: Duration,
    metrics: Arc<dyn MetricsSink>,
    entries: RwLock<FxHashMap<String, DedupEntry>>,
}

impl DedupCache {
    pub fn new(retention: Duration, metrics: Arc<dyn MetricsSink>) -> DedupCache {
        DedupCache {
            retention,
            metrics,
            entries: Default::default(),
        }
    }

    pub async fn check_and_record(&self, datagram: &[u8]) -> DedupVerdict {
        let fingerprint = to_hex(datagram);
        let now = Instant::now();

        match self.entries.write().await.entry(fingerprint) {
            Entry::Occupied(mut e) => {
                let first_seen = e.get().first_seen;
                warn!("doubled packet received, first seen {:?} ago: {}", now - first_seen, e.key());
                e.get_mut().last_seen = now;
                self.metrics.add_resent_packets(1);
                DedupVerdict::Duplicate
            }
            Entry::Vacant(e) => {
                e.insert(DedupEntry {
                    first_seen: now,
                    last_seen: now,
                });
                DedupVerdict::Fresh
            }
        }
    }

    /// Drop all fingerprints that have not been seen within the retention
    ///  window.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let before = entries.len();
        entries.retain(|_, entry| now - entry.last_seen <= self.retention);
        if entries.len() < before {
            debug!("dedup sweep removed {} expired fingerprints", before - entries.len());
        }
    }

    pub async fn run_sweeper(&self, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = time::interval(self.retention);
        ticks.tick().await; // the first tick fires immediately

        loop {
            select! {
                _ = ticks.tick() => {
                    trace!("sweeping dedup cache");
                    self.sweep().await;
                }
                _ = cancel.recv() => return,
            }
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
