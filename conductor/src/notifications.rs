use crate::model::JsonMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sensor telemetry envelope emitted by `_send_sensor_data` (§4.H, §6
/// "Notification schema"). The transport that actually ships this
/// somewhere (message bus, log, metrics backend) is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorNotification {
    pub message_id: Uuid,
    pub instance_uuid: Option<String>,
    pub node_uuid: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub payload: JsonMap,
}

impl SensorNotification {
    pub fn new(node_uuid: String, instance_uuid: Option<String>, payload: JsonMap) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            instance_uuid,
            node_uuid,
            timestamp: Utc::now(),
            event_type: "hardware.ipmi.metrics.update".to_string(),
            payload,
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send_sensor_data(&self, notification: SensorNotification);
}

/// In-memory sink for tests: captures every emitted notification.
pub struct CapturingNotificationSink {
    sent: parking_lot::Mutex<Vec<SensorNotification>>,
}

impl Default for CapturingNotificationSink {
    fn default() -> Self {
        Self {
            sent: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

impl CapturingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SensorNotification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for CapturingNotificationSink {
    async fn send_sensor_data(&self, notification: SensorNotification) {
        self.sent.lock().push(notification);
    }
}
