//! Resolved runtime configuration for the bridge.
//!
//! The bridge consumes a fully-resolved [`BridgeConfig`] at startup. When
//! running as a Home Assistant addon the supervisor hands the process an
//! options document (`options.json`); [`BridgeConfig::from_options_json`]
//! performs that translation once. All durations are stored as plain
//! numbers so the config round-trips through JSON/YAML without custom
//! serde glue.

use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_tcp_port() -> u16 {
    502
}

fn default_tcp_timeout() -> f64 {
    10.0
}

fn default_buffer_size() -> usize {
    4096
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_serial_timeout() -> f64 {
    1.0
}

fn default_reconnect_delay() -> f64 {
    5.0
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_topic_prefix() -> String {
    "Jikong_BMS".to_string()
}

fn default_client_id() -> String {
    "jk_bms_monitor".to_string()
}

fn default_packet_expire() -> f64 {
    0.4
}

fn default_settings_interval() -> u64 {
    60
}

/// TCP Modbus-gateway transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Socket read timeout in seconds; a silent gateway is treated as dead.
    #[serde(default = "default_tcp_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Fixed delay between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
}

impl TcpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs)
    }
}

/// RS485 USB dongle transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub device: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Serial read timeout in seconds; expiring is not an error on RS485.
    #[serde(default = "default_serial_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: f64,
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs)
    }
}

/// Device-side transport selection. The two modes are mutually exclusive
/// and chosen by configuration, never auto-detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp(TcpConfig),
    Serial(SerialConfig),
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl MqttConfig {
    /// Availability topic carrying retained `online`/`offline` payloads.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }
}

/// Fully-resolved bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub mqtt: MqttConfig,
    /// Correlation window in seconds: how long a telemetry snapshot may
    /// wait for its settings frame before it is discarded. Kept short:
    /// settings frames closely follow their telemetry on the wire, and a
    /// large window risks pairing a snapshot with an unrelated report.
    #[serde(default = "default_packet_expire")]
    pub packet_expire_secs: f64,
    /// Minimum spacing between settings-topic publishes per device, in
    /// seconds. Settings change rarely; hammering the broker with them
    /// is pure waste.
    #[serde(default = "default_settings_interval")]
    pub settings_publish_interval_secs: u64,
    /// Validate the trailing checksum byte on every frame. Off by default
    /// to match observed device behavior.
    #[serde(default)]
    pub strict_checksum: bool,
}

impl BridgeConfig {
    pub fn packet_expire(&self) -> Duration {
        Duration::from_secs_f64(self.packet_expire_secs)
    }

    pub fn settings_publish_interval(&self) -> Duration {
        Duration::from_secs(self.settings_publish_interval_secs)
    }

    /// Check the configuration for fatal mistakes.
    ///
    /// This is the only startup-time hard failure in the system; every
    /// later failure is retried or absorbed.
    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            TransportConfig::Tcp(tcp) if tcp.host.trim().is_empty() => {
                return Err(BridgeError::config_error("tcp transport selected but no host configured"));
            }
            TransportConfig::Serial(serial) if serial.device.trim().is_empty() => {
                return Err(BridgeError::config_error(
                    "serial transport selected but no device path configured",
                ));
            }
            _ => {}
        }
        if self.packet_expire_secs <= 0.0 {
            return Err(BridgeError::config_error("packet_expire_time must be positive"));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(BridgeError::config_error("mqtt host is required"));
        }
        Ok(())
    }

    /// Translate a Home Assistant addon options document into a resolved
    /// configuration. Unknown keys are ignored; missing keys fall back to
    /// the documented defaults.
    pub fn from_options_json(options: &str) -> Result<Self> {
        let options: AddonOptions = serde_json::from_str(options)
            .map_err(|e| BridgeError::config_error(format!("unparseable options document: {e}")))?;

        let transport = if options.connection_mode.as_deref() == Some("Modbus Gateway TCP") {
            TransportConfig::Tcp(TcpConfig {
                host: options.modbus_host.unwrap_or_default(),
                port: options.modbus_port.unwrap_or_else(default_tcp_port),
                timeout_secs: options.modbus_timeout.unwrap_or_else(default_tcp_timeout),
                buffer_size: options.modbus_buffer_size.unwrap_or_else(default_buffer_size),
                reconnect_delay_secs: default_reconnect_delay(),
            })
        } else {
            // "RS485 USB Dongle" is the shipped default mode.
            TransportConfig::Serial(SerialConfig {
                device: options.serial_device.unwrap_or_default(),
                baudrate: options.serial_baudrate.unwrap_or_else(default_baudrate),
                timeout_secs: default_serial_timeout(),
                reconnect_delay_secs: default_reconnect_delay(),
            })
        };

        let config = BridgeConfig {
            transport,
            mqtt: MqttConfig {
                host: options.mqtt_host.unwrap_or_default(),
                port: options.mqtt_port.unwrap_or_else(default_mqtt_port),
                username: options.mqtt_username,
                password: options.mqtt_password,
                discovery_prefix: options
                    .mqtt_discovery_prefix
                    .unwrap_or_else(default_discovery_prefix),
                topic_prefix: options.mqtt_topic_prefix.unwrap_or_else(default_topic_prefix),
                client_id: options.mqtt_client_id.unwrap_or_else(default_client_id),
            },
            packet_expire_secs: options.packet_expire_time.unwrap_or_else(default_packet_expire),
            settings_publish_interval_secs: options
                .settings_publish_interval
                .unwrap_or_else(default_settings_interval),
            strict_checksum: options.strict_checksum.unwrap_or(false),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Raw addon options as the supervisor writes them.
#[derive(Debug, Deserialize)]
struct AddonOptions {
    connection_mode: Option<String>,
    modbus_host: Option<String>,
    modbus_port: Option<u16>,
    modbus_timeout: Option<f64>,
    modbus_buffer_size: Option<usize>,
    serial_device: Option<String>,
    serial_baudrate: Option<u32>,
    mqtt_host: Option<String>,
    mqtt_port: Option<u16>,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_discovery_prefix: Option<String>,
    mqtt_topic_prefix: Option<String>,
    mqtt_client_id: Option<String>,
    packet_expire_time: Option<f64>,
    settings_publish_interval: Option<u64>,
    strict_checksum: Option<bool>,
}
