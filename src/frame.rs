//! Frame and record types flowing through the bridge pipeline.

use serde_json::{Map, Value};
use tokio::time::Instant;

/// Field map decoded from a frame payload via the register map.
pub type FieldMap = Map<String, Value>;

/// The two frame kinds the BMS emits on the shared RS485 bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Low-frequency settings/identity frame (type byte `0x01`).
    Settings,
    /// High-frequency live-measurement frame (type byte `0x02`).
    Telemetry,
}

impl FrameKind {
    /// Map the on-wire type discriminator byte to a frame kind.
    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Settings),
            0x02 => Some(FrameKind::Telemetry),
            _ => None,
        }
    }

    /// Fixed total frame length for this kind, marker included.
    pub fn frame_len(self) -> usize {
        match self {
            FrameKind::Settings => 300,
            FrameKind::Telemetry => 308,
        }
    }

    /// Topic path segment used for state publishes of this kind.
    pub fn topic_key(self) -> &'static str {
        match self {
            FrameKind::Settings => "settings",
            FrameKind::Telemetry => "realtime",
        }
    }
}

/// One structurally validated protocol frame, as cut from the byte stream.
///
/// A `RawFrame` is only ever constructed from bytes that passed marker,
/// type and length validation; semantic decoding is applied afterwards by
/// the register map.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    /// Full frame bytes, start marker included.
    pub payload: Vec<u8>,
    /// Monotonic arrival timestamp of the chunk that completed the frame.
    pub received_at: Instant,
}

/// Merged per-device result emitted by the correlator.
///
/// Carries the settings fields of the triggering settings frame, plus the
/// pending telemetry snapshot when one was matched inside the correlation
/// window.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub device_id: u32,
    pub settings: FieldMap,
    pub telemetry: Option<FieldMap>,
}

/// One outbound broker message planned by the publish scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Connection state of the device-side transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
}
