use std::time::Duration;

use tokio::time;

use crate::sink::{RecordSink, TelemetryMessage};

/// A [RecordSink] that remembers everything published into it.
#[derive(Default)]
pub struct RecordingSink {
    messages: parking_lot::Mutex<Vec<TelemetryMessage>>,
}

impl RecordingSink {
    pub fn new() -> RecordingSink {
        Default::default()
    }

    pub fn messages(&self) -> Vec<TelemetryMessage> {
        self.messages.lock().clone()
    }

    /// Publication runs on a spawned task, so tests poll for arrival.
    pub async fn wait_for_messages(&self, count: usize) -> Vec<TelemetryMessage> {
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            if time::Instant::now() > deadline {
                panic!("expected {} published messages, have {}", count, messages.len());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait::async_trait]
impl RecordSink for RecordingSink {
    async fn publish(&self, message: TelemetryMessage) -> anyhow::Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// A [RecordSink] that rejects every message, for exercising error paths.
pub struct FailingSink;

#[async_trait::async_trait]
impl RecordSink for FailingSink {
    async fn publish(&self, _message: TelemetryMessage) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("this sink fails on purpose"))
    }
}
