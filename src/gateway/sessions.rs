use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, trace};

use crate::gateway::device_id::DeviceId;

/// A live device as seen from the transport layer. The endpoint is only
///  valid while the device's NAT binding holds, which is why sessions expire
///  quickly and are refreshed by every recognised PDU.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    pub device_id: DeviceId,
    pub endpoint: SocketAddr,
    pub last_seen: Instant,
}

/// Online devices keyed by their remote endpoint, with the device id as a
///  searchable secondary attribute. There is at most one session per
///  endpoint: marking a device online overwrites whatever was there.
pub struct SessionTable {
    idle_timeout: Duration,
    sessions: RwLock<FxHashMap<SocketAddr, Session>>,
}

impl SessionTable {
    pub fn new(idle_timeout: Duration) -> SessionTable {
        SessionTable {
            idle_timeout,
            sessions: Default::default(),
        }
    }

    pub async fn mark_online(&self, endpoint: SocketAddr, device_id: DeviceId) {
        let session = Session {
            device_id,
            endpoint,
            last_seen: Instant::now(),
        };
        self.sessions.write().await.insert(endpoint, session);
    }

    pub async fn lookup_by_endpoint(&self, endpoint: SocketAddr) -> Option<Session> {
        self.sessions.read().await.get(&endpoint).cloned()
    }

    pub async fn lookup_by_device(&self, device_id: &DeviceId) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|session| &session.device_id == device_id)
            .cloned()
    }

    /// Remove all sessions that have been idle longer than the timeout.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        sessions.retain(|endpoint, session| {
            let keep = now - session.last_seen <= self.idle_timeout;
            if !keep {
                debug!("device {} at {} has been idle too long, removing session", session.device_id, endpoint);
            }
            keep
        });
    }

    pub async fn run_sweeper(&self, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = time::interval(self.idle_timeout);
        ticks.tick().await; // the first tick fires immediately

        loop {
            select! {
                _ = ticks.tick() => {
                    trace!("sweeping session table");
                    self.sweep().await;
                }
                _ = cancel.recv() => return,
            }
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(imei: &str) -> DeviceId {
        imei.parse().unwrap()
    }

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[tokio::test]
    async fn test_mark_online_and_lookup() {
        let table = SessionTable::new(Duration::from_secs(300));

        table.mark_online(endpoint(4001), device("352094089397464")).await;

        let session = table.lookup_by_endpoint(endpoint(4001)).await.unwrap();
        assert_eq!(session.device_id, device("352094089397464"));
        assert_eq!(session.endpoint, endpoint(4001));

        assert_eq!(table.lookup_by_endpoint(endpoint(4002)).await, None);
    }

    #[tokio::test]
    async fn test_at_most_one_session_per_endpoint() {
        let table = SessionTable::new(Duration::from_secs(300));

        table.mark_online(endpoint(4001), device("352094089397464")).await;
        table.mark_online(endpoint(4001), device("350424063817363")).await;

        assert_eq!(table.len().await, 1);
        let session = table.lookup_by_endpoint(endpoint(4001)).await.unwrap();
        assert_eq!(session.device_id, device("350424063817363"));
    }

    #[tokio::test]
    async fn test_lookup_by_device() {
        let table = SessionTable::new(Duration::from_secs(300));

        table.mark_online(endpoint(4001), device("352094089397464")).await;
        table.mark_online(endpoint(4002), device("350424063817363")).await;

        let session = table.lookup_by_device(&device("350424063817363")).await.unwrap();
        assert_eq!(session.endpoint, endpoint(4002));
        assert_eq!(table.lookup_by_device(&device("356307042441013")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_sessions() {
        let table = SessionTable::new(Duration::from_secs(300));

        table.mark_online(endpoint(4001), device("352094089397464")).await;
        time::sleep(Duration::from_secs(200)).await;
        table.mark_online(endpoint(4002), device("350424063817363")).await;

        time::sleep(Duration::from_secs(150)).await;
        table.sweep().await;

        assert_eq!(table.lookup_by_endpoint(endpoint(4001)).await, None);
        assert!(table.lookup_by_endpoint(endpoint(4002)).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_session_alive() {
        let table = SessionTable::new(Duration::from_secs(300));

        table.mark_online(endpoint(4001), device("352094089397464")).await;
        for _ in 0..5 {
            time::sleep(Duration::from_secs(200)).await;
            table.mark_online(endpoint(4001), device("352094089397464")).await;
            table.sweep().await;
        }

        assert!(table.lookup_by_endpoint(endpoint(4001)).await.is_some());
    }
}
