use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, error, info, trace};

use crate::broker::device_broker::DeviceBroker;
use crate::gateway::commands::CommandRouter;
use crate::gateway::config::GatewayConfig;
use crate::gateway::device_id::DeviceId;

/// Starts, tracks and reaps the per-device [DeviceBroker]s. There is at most
///  one broker per device id. A broker lives as long as its device keeps
///  producing recognised traffic; once the keepalive goes stale the broker
///  is stopped and the device's command slot is dropped with it.
pub struct BrokerSupervisor {
    config: Arc<GatewayConfig>,
    router: Arc<CommandRouter>,
    brokers: RwLock<FxHashMap<DeviceId, Arc<DeviceBroker>>>,
    last_keepalive: RwLock<FxHashMap<DeviceId, Instant>>,
}

impl BrokerSupervisor {
    pub fn new(config: Arc<GatewayConfig>, router: Arc<CommandRouter>) -> BrokerSupervisor {
        BrokerSupervisor {
            config,
            router,
            brokers: Default::default(),
            last_keepalive: Default::default(),
        }
    }

    /// Make sure a broker exists for the device, starting one if necessary.
    ///  Fails for devices that are not allow listed, because the command
    ///  slot creation is gated.
    pub async fn ensure(&self, device_id: &DeviceId) -> anyhow::Result<()> {
        {
            if self.brokers.read().await.contains_key(device_id) {
                return Ok(());
            }
        }

        let (slot, _) = self.router.get_or_create(device_id).await?;

        let mut brokers = self.brokers.write().await;
        // raced creations resolve here, under the exclusive lock
        match brokers.entry(device_id.clone()) {
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                let started = DeviceBroker::start(
                    device_id.clone(),
                    &self.config.base_path,
                    slot.to_device(),
                    slot.subscribe_from_device(),
                )
                .await;
                let broker = match started {
                    Ok(broker) => broker,
                    Err(e) => {
                        // the command slot lives exactly as long as the
                        //  broker; without a broker the reaper would never
                        //  find this device, so drop the slot right here
                        self.router.remove(device_id).await;
                        return Err(e);
                    }
                };
                info!("started broker for device {} at {:?}", device_id, broker.socket_path());

                entry.insert(Arc::new(broker));
                self.last_keepalive.write().await.insert(device_id.clone(), Instant::now());
                Ok(())
            }
        }
    }

    /// Record that the device produced a recognised PDU just now. Restarts
    ///  the broker if it was reaped in the meantime.
    pub async fn keep_alive(&self, device_id: &DeviceId) {
        trace!("keep alive for device {}", device_id);
        self.last_keepalive.write().await.insert(device_id.clone(), Instant::now());

        if let Err(e) = self.ensure(device_id).await {
            error!("failed to revive broker for device {}: {}", device_id, e);
        }
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<Arc<DeviceBroker>> {
        self.brokers.read().await.get(device_id).cloned()
    }

    /// One reaper pass: stop every broker whose device has been quiet for
    ///  longer than the idle timeout and drop its command slot.
    pub async fn reap(&self) {
        let now = Instant::now();

        let expired: Vec<DeviceId> = self
            .last_keepalive
            .read()
            .await
            .iter()
            .filter(|(_, last_seen)| now - **last_seen > self.config.broker_idle_timeout)
            .map(|(device_id, _)| device_id.clone())
            .collect();

        for device_id in expired {
            info!("device {} has been quiet too long, reaping its broker", device_id);

            let broker = self.brokers.write().await.remove(&device_id);
            if let Some(broker) = broker {
                broker.stop().await;
            }
            self.router.remove(&device_id).await;
            self.last_keepalive.write().await.remove(&device_id);
            debug!("device expired: {}", device_id);
        }
    }

    pub async fn run_reaper(&self, mut cancel: broadcast::Receiver<()>) {
        let mut ticks = time::interval(self.config.keepalive_check_period);
        ticks.tick().await; // the first tick fires immediately

        loop {
            select! {
                _ = ticks.tick() => {
                    trace!("checking broker keepalive timestamps");
                    self.reap().await;
                }
                _ = cancel.recv() => return,
            }
        }
    }

    /// Shutdown path: stop all brokers regardless of keepalive age.
    pub async fn stop_all(&self) {
        let brokers: Vec<Arc<DeviceBroker>> = self.brokers.write().await.drain().map(|(_, b)| b).collect();
        for broker in brokers {
            broker.stop().await;
        }
        self.last_keepalive.write().await.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.brokers.read().await.len()
    }
}
