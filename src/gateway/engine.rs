use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn};

use crate::broker::supervisor::BrokerSupervisor;
use crate::codec::{AvlPacket, PacketCodec, PduKind};
use crate::gateway::commands::CommandRouter;
use crate::gateway::config::GatewayConfig;
use crate::gateway::dedup::DedupCache;
use crate::gateway::device_id::DeviceId;
use crate::gateway::sessions::SessionTable;
use crate::metrics::MetricsSink;
use crate::sink::{RecordSink, TelemetryMessage};
use crate::util::hex::to_hex;

/// The stateful UDP endpoint of the gateway. Owns the socket, runs the
///  single serialised receive loop, and fans the slow work (dedup check and
///  record publication) out to short-lived tasks.
///
/// All devices share the one socket. Heartbeats are the only moment a
///  command can be pushed towards a device, because the devices sit behind
///  NAT and the gateway can only ever answer their outbound traffic.
pub struct ProtocolEngine {
    config: Arc<GatewayConfig>,
    codec: Arc<dyn PacketCodec>,
    record_sink: Arc<dyn RecordSink>,
    metrics: Arc<dyn MetricsSink>,
    sessions: Arc<SessionTable>,
    dedup: Arc<DedupCache>,
    router: Arc<CommandRouter>,
    supervisor: Arc<BrokerSupervisor>,
    socket: Arc<UdpSocket>,
    cancel_sender: broadcast::Sender<()>,
}

impl ProtocolEngine {
    /// Bind the UDP socket and wire up the per-device state holders. A bind
    ///  failure is the only error this subsystem reports synchronously,
    ///  everything later is logged and counted.
    pub async fn bind(
        config: Arc<GatewayConfig>,
        codec: Arc<dyn PacketCodec>,
        record_sink: Arc<dyn RecordSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<ProtocolEngine> {
        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        info!("teltonika gateway listening on {}", socket.local_addr()?);

        let router = Arc::new(CommandRouter::new(&config));
        let supervisor = Arc::new(BrokerSupervisor::new(config.clone(), router.clone()));
        let sessions = Arc::new(SessionTable::new(config.session_idle_timeout));
        let dedup = Arc::new(DedupCache::new(config.dedup_retention, metrics.clone()));

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(ProtocolEngine {
            config,
            codec,
            record_sink,
            metrics,
            sessions,
            dedup,
            router,
            supervisor,
            socket,
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn supervisor(&self) -> &Arc<BrokerSupervisor> {
        &self.supervisor
    }

    pub fn cancel(&self) {
        match self.cancel_sender.send(()) {
            Ok(_) => info!("cancelling the gateway"),
            Err(_) => debug!("cancel requested but nothing is running"),
        }
    }

    pub fn subscribe_cancel(&self) -> broadcast::Receiver<()> {
        self.cancel_sender.subscribe()
    }

    /// Run the gateway until cancelled or until the socket dies: the receive
    ///  loop in this task, the sweepers and the broker reaper in background
    ///  tasks. All brokers are stopped on the way out.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        {
            let sessions = self.sessions.clone();
            let cancel = self.subscribe_cancel();
            tokio::spawn(async move { sessions.run_sweeper(cancel).await });
        }
        {
            let dedup = self.dedup.clone();
            let cancel = self.subscribe_cancel();
            tokio::spawn(async move { dedup.run_sweeper(cancel).await });
        }
        {
            let supervisor = self.supervisor.clone();
            let cancel = self.subscribe_cancel();
            tokio::spawn(async move { supervisor.run_reaper(cancel).await });
        }

        let result = self.recv_loop().await;
        self.supervisor.stop_all().await;
        result
    }

    /// The single reader on the socket. Reads use a deadline so a cancel is
    ///  observed within `receive_deadline` even on a completely idle socket.
    async fn recv_loop(&self) -> anyhow::Result<()> {
        let mut cancel = self.subscribe_cancel();
        let mut buf = vec![0u8; self.config.max_datagram_size];

        loop {
            select! {
                _ = cancel.recv() => {
                    info!("shutting down receive loop");
                    return Ok(());
                }
                received = time::timeout(self.config.receive_deadline, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Err(_) => continue, // deadline wakeup, nothing received
                        Ok(Err(e)) => {
                            error!("error receiving from datagram socket: {}", e);
                            return Err(e.into());
                        }
                        Ok(Ok((len, from))) => {
                            self.metrics.add_received_bytes(len as u64);
                            trace!("{} bytes received from {}: {}", len, from, to_hex(&buf[..len]));

                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            self.handle_datagram(datagram, from).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: Bytes, from: SocketAddr) {
        match self.codec.classify(&datagram) {
            PduKind::HeartbeatPing => self.on_heartbeat(from).await,
            PduKind::AvlData(packet) => self.on_avl(packet, datagram, from).await,
            PduKind::CommandResponse { response } => self.on_command_response(response, from).await,
            PduKind::Malformed => {
                warn!("malformed packet from {}, neither AVL data nor command response, ignoring", from);
                self.metrics.add_malformed_packets(1);
            }
        }
    }

    /// A heartbeat is never acked. It refreshes the session and, if an
    ///  operator command is pending, carries it back to the device. The pop
    ///  is non-blocking: an empty queue must not stall the only reader on
    ///  the socket.
    async fn on_heartbeat(&self, from: SocketAddr) {
        let Some(session) = self.sessions.lookup_by_endpoint(from).await else {
            debug!("ignoring heartbeat: unknown endpoint {}", from);
            return;
        };

        debug!("device {} sent a heartbeat", session.device_id);
        self.sessions.mark_online(from, session.device_id.clone()).await;
        self.supervisor.keep_alive(&session.device_id).await;

        match self.router.try_pop_to_device(&session.device_id).await {
            Some(command) => {
                info!("command to be sent to device {}: {}", session.device_id, command);
                match self.codec.encode_command(&command) {
                    Ok(frame) => {
                        if let Err(e) = self.send_bytes(&frame, from).await {
                            error!("failed to send command to {}: {}", from, e);
                        }
                    }
                    Err(e) => error!("failed to encode command for device {}: {}", session.device_id, e),
                }
            }
            None => trace!("no command pending for device {}", session.device_id),
        }
    }

    /// The admission check runs before any state is allocated so spoofed
    ///  packets cannot exhaust the gateway. The ack goes out before the
    ///  records are published: the device's view of a timely ack must not
    ///  depend on storage latency.
    async fn on_avl(&self, packet: AvlPacket, datagram: Bytes, from: SocketAddr) {
        self.metrics.add_received_packets(1);

        let device_id = match DeviceId::from_str(&packet.device_id) {
            Ok(device_id) => device_id,
            Err(e) => {
                warn!("packet rejected, invalid device id: {}", e);
                self.metrics.add_rejected_packets(1);
                return;
            }
        };
        if !self.config.is_allowed(&device_id) {
            warn!("packet rejected, {} is not on the allow list", device_id);
            self.metrics.add_rejected_packets(1);
            return;
        }

        // a failed broker start leaves the device online without a reverse channel
        if let Err(e) = self.supervisor.ensure(&device_id).await {
            error!("failed to start broker for device {}: {}", device_id, e);
        }

        self.sessions.mark_online(from, device_id.clone()).await;
        self.supervisor.keep_alive(&device_id).await;

        if let Err(e) = self.send_bytes(&packet.ack, from).await {
            error!("failed to send ack to {}, continuing: {}", from, e);
        }

        // off the hot path: the duplicate check is advisory and publication
        //  may block on storage
        let dedup = self.dedup.clone();
        let record_sink = self.record_sink.clone();
        let message = TelemetryMessage {
            device_id,
            source: from,
            records: packet.records,
        };
        tokio::spawn(async move {
            let _ = dedup.check_and_record(&datagram).await;
            if let Err(e) = record_sink.publish(message).await {
                error!("failed to publish telemetry records: {}", e);
            }
        });
    }

    /// Command responses are only attributable through the session table:
    ///  the frame itself does not name the device.
    async fn on_command_response(&self, response: String, from: SocketAddr) {
        let Some(session) = self.sessions.lookup_by_endpoint(from).await else {
            warn!("command response from unknown endpoint {}, dropping", from);
            self.metrics.add_rejected_packets(1);
            return;
        };

        self.metrics.add_received_packets(1);
        debug!("command response from device {}: {}", session.device_id, response);

        self.sessions.mark_online(from, session.device_id.clone()).await;
        self.supervisor.keep_alive(&session.device_id).await;

        if let Err(e) = self.router.push_from_device(&session.device_id, &response).await {
            error!("failed to forward command response from device {}: {}", session.device_id, e);
        }
    }

    async fn send_bytes(&self, data: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        trace!("sending {} bytes to {}: {}", data.len(), to, to_hex(data));

        let sent = self.socket.send_to(data, to).await?;
        self.metrics.add_sent_bytes(sent as u64);
        self.metrics.add_sent_packets(1);
        Ok(())
    }
}
