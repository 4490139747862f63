//! Real-time fan-out: one `broadcast` topic per device.
//!
//! A slow subscriber is dropped rather than allowed to push back on the
//! publisher — `broadcast::Receiver::recv` returning `Lagged` is treated by
//! the per-subscriber forwarding task as "you're gone", not retried.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use fleetlink_core::position::NormalizedPosition;

use crate::alert::{AlertOutcome, AlertType};
use crate::storage::models::AlertSeverity;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusMessage {
    PositionUpdate {
        device_id: Uuid,
        position: NormalizedPosition,
    },
    Alert {
        device_id: Uuid,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        metadata: serde_json::Value,
        triggered_at: DateTime<Utc>,
    },
}

/// Per-device broadcast registry. Topics are created lazily on first
/// publish or subscribe and kept for the life of the process — devices are
/// few enough relative to connections that this never needs eviction.
#[derive(Clone)]
pub struct Bus {
    topics: Arc<RwLock<HashMap<Uuid, broadcast::Sender<BusMessage>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus {
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn sender(&self, device_id: Uuid) -> broadcast::Sender<BusMessage> {
        if let Some(tx) = self.topics.read().unwrap().get(&device_id) {
            return tx.clone();
        }
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(device_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, device_id: Uuid) -> broadcast::Receiver<BusMessage> {
        self.sender(device_id).subscribe()
    }

    /// Publishes without caring whether anyone is listening — `send`
    /// failing with no receivers is not an error here.
    pub fn publish_position(&self, device_id: Uuid, position: NormalizedPosition) {
        let _ = self.sender(device_id).send(BusMessage::PositionUpdate {
            device_id,
            position,
        });
    }

    pub fn publish_alert(&self, device_id: Uuid, outcome: &AlertOutcome) {
        let _ = self.sender(device_id).send(BusMessage::Alert {
            device_id,
            alert_type: outcome.alert_type,
            severity: outcome.severity,
            message: outcome.message.clone(),
            metadata: outcome.metadata.clone(),
            triggered_at: Utc::now(),
        });
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetlink_core::position::Sensors;

    fn sample_position() -> NormalizedPosition {
        let t = Utc::now();
        NormalizedPosition {
            imei: "123".into(),
            device_time: t,
            server_time: t,
            latitude: 1.0,
            longitude: 2.0,
            altitude: None,
            speed: None,
            course: None,
            satellites: None,
            hdop: None,
            ignition: None,
            sensors: Sensors::new(),
            valid_fix: true,
            raw_data: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_position() {
        let bus = Bus::new();
        let device_id = Uuid::new_v4();
        let mut rx = bus.subscribe(device_id);
        bus.publish_position(device_id, sample_position());
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, BusMessage::PositionUpdate { .. }));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = Bus::new();
        bus.publish_position(Uuid::new_v4(), sample_position());
    }
}
