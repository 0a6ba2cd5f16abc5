/// Configuration structures that can be tested independently
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentinelConfig {
    pub device_id: String,
    pub broker_url: String,
    pub topic_prefix: String,
    pub http_timeout_secs: u32,
    pub http_buffer_size: usize,
    /// Time given to the broker client to push out the "completed" report
    /// before the device restarts into the new image.
    pub report_settle_ms: u32,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            device_id: "esp32-sentinel".to_string(),
            broker_url: "mqtts://broker.local:8883".to_string(),
            topic_prefix: "devices".to_string(),
            http_timeout_secs: 60,
            http_buffer_size: 4096,
            report_settle_ms: 2000,
        }
    }
}

impl SentinelConfig {
    /// Inbound update instructions for this device.
    pub fn command_topic(&self) -> String {
        format!("{}/{}/ota", self.topic_prefix, self.device_id)
    }

    /// Outbound status and failure reports.
    pub fn status_topic(&self) -> String {
        format!("{}/{}/ota/status", self.topic_prefix, self.device_id)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs as u64)
    }

    pub fn report_settle(&self) -> Duration {
        Duration::from_millis(self.report_settle_ms as u64)
    }
}
