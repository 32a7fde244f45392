use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::gateway::device_id::DeviceId;

#[derive(Debug)]
pub struct GatewayConfig {
    /// UDP bind address for inbound tracker traffic
    pub listen_addr: SocketAddr,
    /// only devices enumerated here may create server-side state
    pub allow_list: FxHashSet<DeviceId>,
    /// directory holding the per-device local command sockets
    pub base_path: PathBuf,

    /// a session with no recognised traffic for this long is evicted
    pub session_idle_timeout: Duration,
    /// how long a datagram fingerprint is remembered for duplicate detection
    pub dedup_retention: Duration,
    /// a device broker with no keepalive for this long is reaped
    pub broker_idle_timeout: Duration,
    /// period of the broker keepalive reaper
    pub keepalive_check_period: Duration,
    /// socket read deadline so cancellation is observed on an idle socket
    pub receive_deadline: Duration,

    /// receive buffer size; datagrams are expected to fit well within this
    pub max_datagram_size: usize,
    /// depth of the device-to-operator response buffer per device
    pub response_buffer: usize,
}

impl GatewayConfig {
    pub fn new(listen_addr: SocketAddr) -> GatewayConfig {
        GatewayConfig {
            listen_addr,
            allow_list: Default::default(),
            base_path: PathBuf::from("/tmp/rustonika"),
            session_idle_timeout: Duration::from_secs(5 * 60),
            dedup_retention: Duration::from_secs(60 * 60),
            broker_idle_timeout: Duration::from_secs(60 * 60),
            keepalive_check_period: Duration::from_secs(10),
            receive_deadline: Duration::from_secs(10),
            max_datagram_size: 10 * 1024,
            response_buffer: 32,
        }
    }

    pub fn is_allowed(&self, device_id: &DeviceId) -> bool {
        self.allow_list.contains(device_id)
    }
}
