use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::codec::AvlRecord;
use crate::gateway::device_id::DeviceId;
use crate::util::hex::to_hex;

/// One accepted AVL datagram, decoded and attributed: everything a storage
///  backend needs to persist the contained records.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryMessage {
    pub device_id: DeviceId,
    pub source: SocketAddr,
    pub records: Vec<AvlRecord>,
}

/// Storage capability the engine publishes decoded records into. Publication
///  happens off the receive hot path, so implementations may block on IO.
#[async_trait::async_trait]
pub trait RecordSink: Send + Sync {
    async fn publish(&self, message: TelemetryMessage) -> anyhow::Result<()>;
}

/// Forwards every message to a set of subscriber sinks. A failing subscriber
///  is logged and the remaining subscribers still receive the message.
pub struct FanOutSink {
    subscribers: Vec<Arc<dyn RecordSink>>,
}

impl FanOutSink {
    pub fn new(subscribers: Vec<Arc<dyn RecordSink>>) -> FanOutSink {
        FanOutSink { subscribers }
    }
}

#[async_trait::async_trait]
impl RecordSink for FanOutSink {
    async fn publish(&self, message: TelemetryMessage) -> anyhow::Result<()> {
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.publish(message.clone()).await {
                error!("failed to forward telemetry message: {}", e);
            }
        }
        Ok(())
    }
}

/// Appends one JSON object per record to a file, with wire fixed-point
///  coordinates rendered as degrees and IO elements as per-id fields.
pub struct JsonLinesSink {
    file: Mutex<tokio::fs::File>,
}

#[derive(Serialize)]
struct RecordRow<'a> {
    device_id: &'a str,
    source: String,
    server_time_ms: u64,
    timestamp_ms: u64,
    priority: u8,
    latitude: f64,
    longitude: f64,
    altitude: i16,
    speed: u16,
    heading: u16,
    satellites: u8,
    event_id: u16,
    io: BTreeMap<String, serde_json::Value>,
}

impl JsonLinesSink {
    pub async fn create(path: &Path) -> anyhow::Result<JsonLinesSink> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(JsonLinesSink {
            file: Mutex::new(file),
        })
    }
}

#[async_trait::async_trait]
impl RecordSink for JsonLinesSink {
    async fn publish(&self, message: TelemetryMessage) -> anyhow::Result<()> {
        let server_time_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis() as u64;

        let mut buf = Vec::new();
        for record in &message.records {
            let io = record
                .elements
                .iter()
                .map(|element| (format!("io{}", element.id), render_io_value(&element.value)))
                .collect();

            let row = RecordRow {
                device_id: message.device_id.as_str(),
                source: message.source.to_string(),
                server_time_ms,
                timestamp_ms: record.timestamp_ms,
                priority: record.priority,
                latitude: f64::from(record.lat) / 1e7,
                longitude: f64::from(record.lng) / 1e7,
                altitude: record.altitude,
                speed: record.speed,
                heading: record.heading,
                satellites: record.satellites,
                event_id: record.event_id,
                io,
            };
            serde_json::to_writer(&mut buf, &row)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

/// IO values up to 8 bytes are numeric on the wire; longer ones are opaque
///  and kept as hex strings.
fn render_io_value(value: &[u8]) -> serde_json::Value {
    if value.len() <= 8 {
        let mut n: u64 = 0;
        for b in value {
            n = (n << 8) | u64::from(*b);
        }
        serde_json::Value::from(n)
    } else {
        serde_json::Value::from(to_hex(value))
    }
}
