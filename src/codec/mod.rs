use bytes::Bytes;
use serde::Serialize;

pub mod frame;

/// The single-byte keepalive ping a tracker emits while it has nothing to
///  report. It doubles as the delivery window for the reverse channel: a
///  command can only be pushed to a device in direct reply to one of these.
pub const HEARTBEAT_BYTE: u8 = 0xff;

/// Classification of an inbound datagram. Exactly one of these is produced
///  for every datagram the gateway receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PduKind {
    /// single 0xff byte, never acked
    HeartbeatPing,
    AvlData(AvlPacket),
    CommandResponse { response: String },
    Malformed,
}

/// A decoded AVL data packet: the device identity it claims, the position
///  records it carries, and the exact bytes the device expects back as
///  acknowledgement. The ack must be returned verbatim or the device keeps
///  the records in its on-board buffer and retransmits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvlPacket {
    pub device_id: String,
    pub records: Vec<AvlRecord>,
    pub ack: Bytes,
}

/// One GPS fix plus its IO elements. Coordinates are fixed-point integers in
///  1e-7 degrees, exactly as they appear on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AvlRecord {
    pub timestamp_ms: u64,
    pub priority: u8,
    pub lat: i32,
    pub lng: i32,
    pub altitude: i16,
    pub heading: u16,
    pub satellites: u8,
    pub speed: u16,
    pub event_id: u16,
    pub elements: Vec<IoElement>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IoElement {
    pub id: u16,
    pub value: Vec<u8>,
}

/// Codec capability the protocol engine is built against. Implementations
///  own all byte-level knowledge of the wire format; the engine only ever
///  sees [PduKind] values and opaque ack/command buffers.
pub trait PacketCodec: Send + Sync {
    /// Classify a raw datagram. A 1-byte `0xff` datagram is always a
    ///  heartbeat and must never be attempted as anything else.
    fn classify(&self, datagram: &[u8]) -> PduKind;

    /// Wrap an ASCII command string into the frame the device understands.
    fn encode_command(&self, command: &str) -> anyhow::Result<Bytes>;
}
