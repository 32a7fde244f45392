use std::collections::hash_map::Entry;
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, trace};

use crate::gateway::config::GatewayConfig;
use crate::gateway::device_id::DeviceId;

/// Per-device pair of command queues connecting the operator side (local
///  socket brokers) with the device side (the protocol engine).
///
/// `to_device` has depth 1 with blocking send: an operator submitting a
///  second command while one is still waiting for its heartbeat window is
///  held back instead of growing a queue of commands that would outlive
///  their delivery window. The engine drains it with a non-blocking pop.
///
/// `from_device` is a small buffered broadcast: every attached consumer
///  receives every response, slow consumers lose the oldest responses, and
///  a push can never block or deadlock the engine.
pub struct CommandSlot {
    to_device_tx: mpsc::Sender<String>,
    to_device_rx: parking_lot::Mutex<mpsc::Receiver<String>>,
    from_device: broadcast::Sender<String>,
}

impl CommandSlot {
    fn new(response_buffer: usize) -> CommandSlot {
        let (to_device_tx, to_device_rx) = mpsc::channel(1);
        let (from_device, _) = broadcast::channel(response_buffer);

        CommandSlot {
            to_device_tx,
            to_device_rx: parking_lot::Mutex::new(to_device_rx),
            from_device,
        }
    }

    /// Sender half for operator commands. Awaiting the send is the
    ///  back-pressure point for operators.
    pub fn to_device(&self) -> mpsc::Sender<String> {
        self.to_device_tx.clone()
    }

    pub fn subscribe_from_device(&self) -> broadcast::Receiver<String> {
        self.from_device.subscribe()
    }
}

/// Owns all [CommandSlot]s, keyed by device id. Slots are created lazily on
///  first reference, gated by the allow list, and dropped when the device's
///  broker is torn down. Dropping a slot discards any still-queued command,
///  which is the intended fate of a command that never got its heartbeat.
pub struct CommandRouter {
    allow_list: FxHashSet<DeviceId>,
    response_buffer: usize,
    slots: RwLock<FxHashMap<DeviceId, Arc<CommandSlot>>>,
}

impl CommandRouter {
    pub fn new(config: &GatewayConfig) -> CommandRouter {
        CommandRouter {
            allow_list: config.allow_list.clone(),
            response_buffer: config.response_buffer,
            slots: Default::default(),
        }
    }

    /// Slot for a device, creating it on first reference. The flag is true
    ///  if this call created the slot.
    pub async fn get_or_create(&self, device_id: &DeviceId) -> anyhow::Result<(Arc<CommandSlot>, bool)> {
        if !self.allow_list.contains(device_id) {
            return Err(anyhow!("device {} is not on the allow list", device_id));
        }

        match self.slots.write().await.entry(device_id.clone()) {
            Entry::Occupied(e) => Ok((e.get().clone(), false)),
            Entry::Vacant(e) => {
                debug!("new command slot for device {}", device_id);
                let slot = Arc::new(CommandSlot::new(self.response_buffer));
                e.insert(slot.clone());
                Ok((slot, true))
            }
        }
    }

    /// Non-blocking pop of a pending operator command. This runs on the
    ///  engine's receive path and must never wait: an empty queue, a missing
    ///  slot and a contended receiver all come back as `None`.
    pub async fn try_pop_to_device(&self, device_id: &DeviceId) -> Option<String> {
        let slot = self.slots.read().await.get(device_id).cloned()?;

        let mut receiver = slot.to_device_rx.try_lock()?;
        receiver.try_recv().ok()
    }

    /// Enqueue a device response towards the operators. Responses with no
    ///  attached consumer are dropped.
    pub async fn push_from_device(&self, device_id: &DeviceId, response: &str) -> anyhow::Result<()> {
        let (slot, _) = self.get_or_create(device_id).await?;

        if slot.from_device.send(response.to_string()).is_err() {
            trace!("no consumer attached for device {}, dropping response", device_id);
        }
        Ok(())
    }

    /// Drop the device's slot. Called on broker teardown; a queued command
    ///  that never saw its heartbeat window is discarded here.
    pub async fn remove(&self, device_id: &DeviceId) {
        if self.slots.write().await.remove(device_id).is_some() {
            debug!("dropped command slot for device {}", device_id);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }
}
