//! Publish planning: discovery-once, fresh telemetry, rate-limited settings.
//!
//! For every merged device update the scheduler plans the outbound broker
//! messages:
//!
//! 1. On first sight of a device, a retained discovery config message per
//!    register-map entity, emitted before any state publish so Home
//!    Assistant creates the entities before data arrives.
//! 2. A telemetry state publish on every update that carries telemetry;
//!    live values must stay fresh.
//! 3. A settings state publish only when the per-device interval has
//!    elapsed (or on first sight). Settings change rarely; re-publishing
//!    them on every report is needless broker traffic.

use crate::config::MqttConfig;
use crate::frame::{DeviceUpdate, FrameKind, Publication};
use crate::registers::{self, EntityClass};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Maps correlated device updates onto outbound publications.
///
/// Single-writer, owned by the ingest pipeline alongside the correlator.
#[derive(Debug)]
pub struct PublishScheduler {
    topic_prefix: String,
    discovery_prefix: String,
    status_topic: String,
    settings_interval: Duration,
    last_settings_published: HashMap<u32, Instant>,
    discovered: HashSet<u32>,
}

impl PublishScheduler {
    pub fn new(mqtt: &MqttConfig, settings_interval: Duration) -> Self {
        Self {
            topic_prefix: mqtt.topic_prefix.clone(),
            discovery_prefix: mqtt.discovery_prefix.clone(),
            status_topic: mqtt.status_topic(),
            settings_interval,
            last_settings_published: HashMap::new(),
            discovered: HashSet::new(),
        }
    }

    /// Plan the publications for one device update, in emission order.
    pub fn plan(&mut self, update: &DeviceUpdate, now: Instant) -> Vec<Publication> {
        let mut publications = Vec::new();
        let device_id = update.device_id;

        let first_sight = self.discovered.insert(device_id);
        if first_sight {
            info!(device_id, "new device identity; publishing discovery set");
            self.plan_discovery(device_id, &mut publications);
        }

        let settings_due = first_sight
            || self
                .last_settings_published
                .get(&device_id)
                .is_none_or(|last| now.duration_since(*last) >= self.settings_interval);
        if settings_due {
            self.last_settings_published.insert(device_id, now);
            publications.push(Publication {
                topic: self.state_topic(device_id, FrameKind::Settings),
                payload: serde_json::Value::Object(update.settings.clone()).to_string(),
                retain: true,
            });
        } else {
            debug!(device_id, "settings publish suppressed inside interval");
        }

        if let Some(telemetry) = &update.telemetry {
            publications.push(Publication {
                topic: self.state_topic(device_id, FrameKind::Telemetry),
                payload: serde_json::Value::Object(telemetry.clone()).to_string(),
                retain: false,
            });
        }

        publications
    }

    fn state_topic(&self, device_id: u32, kind: FrameKind) -> String {
        format!("{}/{}/{}", self.topic_prefix, device_id, kind.topic_key())
    }

    /// One retained discovery config message per register-map entity, for
    /// both frame kinds.
    fn plan_discovery(&self, device_id: u32, out: &mut Vec<Publication>) {
        let device_info = self.device_info(device_id);

        for kind in [FrameKind::Telemetry, FrameKind::Settings] {
            let state_topic = self.state_topic(device_id, kind);
            for def in registers::register_map(kind) {
                let unique_id = format!("jk_bms_{device_id}_{}", def.key);
                let mut payload = json!({
                    "name": def.name,
                    "unique_id": unique_id,
                    "object_id": unique_id,
                    "state_topic": state_topic,
                    "device": device_info,
                    "availability_topic": self.status_topic,
                    "payload_available": "online",
                    "payload_not_available": "offline",
                    "value_template": format!("{{{{ value_json['{}'] }}}}", def.key),
                });
                if let Some(unit) = def.unit {
                    payload["unit_of_measurement"] = json!(unit);
                }
                if def.class == EntityClass::BinarySensor {
                    payload["payload_on"] = json!("1");
                    payload["payload_off"] = json!("0");
                }

                out.push(Publication {
                    topic: format!(
                        "{}/{}/jk_bms_{device_id}/{}/config",
                        self.discovery_prefix,
                        def.class.component(),
                        def.key
                    ),
                    payload: payload.to_string(),
                    retain: true,
                });
            }
        }
    }

    fn device_info(&self, device_id: u32) -> serde_json::Value {
        // Device 0 is the parallel-group master on this BMS family.
        let name = if device_id == 0 {
            "JK BMS 0 (Master)".to_string()
        } else {
            format!("JK BMS {device_id}")
        };
        json!({
            "identifiers": [format!("jk_bms_{device_id}")],
            "manufacturer": "JiKong",
            "model": "JK-BMS-Parallel",
            "name": name,
        })
    }
}
