//! Static register map for the JK PB2A16S30P frame payloads.
//!
//! Maps (frame kind, byte offset, width, scale) to a named field with unit
//! and Home Assistant entity class. Consumed read-only by the pipeline and
//! the publish scheduler; decoding is a pure lookup applied after framing.
//!
//! Offsets are relative to the payload base (6 bytes: 4-byte start marker,
//! type byte, counter byte) and were calibrated against captured frames
//! from a real PB2A16S30P pack; treat them as device-sample-driven, not
//! protocol gospel.

use crate::frame::{FieldMap, FrameKind};
use serde_json::Value;

/// Offset of the first register byte inside a frame.
pub const PAYLOAD_BASE: usize = 6;

/// Register offset of the 32-bit device address inside a settings frame.
pub const DEVICE_ADDRESS_OFFSET: usize = 270;

/// Field width and signedness, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    U8,
    U16,
    I16,
    U32,
    I32,
}

impl Width {
    pub fn size(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 | Width::I16 => 2,
            Width::U32 | Width::I32 => 4,
        }
    }

    /// Bounds-checked little-endian read at an absolute frame offset.
    pub fn read(self, frame: &[u8], at: usize) -> Option<i64> {
        let end = at.checked_add(self.size())?;
        let bytes = frame.get(at..end)?;
        Some(match self {
            Width::U8 => bytes[0] as i64,
            Width::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Width::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            Width::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            Width::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        })
    }
}

/// Unit conversion applied to the raw register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// No conversion.
    Raw,
    /// 0.1-steps (temperatures).
    Div10,
    /// 0.01-steps.
    Div100,
    /// mV -> V, mA -> A, mAh -> Ah.
    Div1000,
    /// Zero-based index to one-based.
    PlusOne,
    /// Render as a hex string.
    Hex,
}

impl Scale {
    pub fn apply(self, raw: i64) -> Value {
        match self {
            Scale::Raw => Value::from(raw),
            Scale::Div10 => Value::from(round_to(raw as f64 / 10.0, 1)),
            Scale::Div100 => Value::from(round_to(raw as f64 / 100.0, 2)),
            Scale::Div1000 => Value::from(round_to(raw as f64 / 1000.0, 3)),
            Scale::PlusOne => Value::from(raw + 1),
            Scale::Hex => Value::from(format!("0x{raw:08X}")),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Home Assistant entity class for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Sensor,
    BinarySensor,
}

impl EntityClass {
    /// Discovery topic component for this class.
    pub fn component(self) -> &'static str {
        match self {
            EntityClass::Sensor => "sensor",
            EntityClass::BinarySensor => "binary_sensor",
        }
    }
}

/// One entry of the register map.
#[derive(Debug, Clone, Copy)]
pub struct RegisterDef {
    pub offset: usize,
    pub width: Width,
    pub scale: Scale,
    pub key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub class: EntityClass,
}

const fn sensor(
    offset: usize,
    width: Width,
    scale: Scale,
    key: &'static str,
    name: &'static str,
    unit: Option<&'static str>,
) -> RegisterDef {
    RegisterDef { offset, width, scale, key, name, unit, class: EntityClass::Sensor }
}

const fn binary(
    offset: usize,
    width: Width,
    key: &'static str,
    name: &'static str,
) -> RegisterDef {
    RegisterDef {
        offset,
        width,
        scale: Scale::Raw,
        key,
        name,
        unit: None,
        class: EntityClass::BinarySensor,
    }
}

use Scale::{Div10, Div1000, Hex, PlusOne, Raw};
use Width::{I16, I32, U8, U16, U32};

/// Settings frame (0x01) registers: protection setpoints and identity.
pub static SETTINGS_REGISTERS: &[RegisterDef] = &[
    sensor(0, U32, Div1000, "sleep_voltage", "Sleep Voltage", Some("V")),
    sensor(4, U32, Div1000, "cell_uvp", "Cell Undervoltage Protection", Some("V")),
    sensor(8, U32, Div1000, "cell_uvp_recovery", "Cell Undervoltage Recovery", Some("V")),
    sensor(12, U32, Div1000, "cell_ovp", "Cell Overvoltage Protection", Some("V")),
    sensor(16, U32, Div1000, "cell_ovp_recovery", "Cell Overvoltage Recovery", Some("V")),
    sensor(20, U32, Div1000, "balance_trigger_diff", "Balance Trigger Difference", Some("V")),
    sensor(24, U32, Div1000, "soc_100_voltage", "SOC 100% Voltage", Some("V")),
    sensor(28, U32, Div1000, "soc_0_voltage", "SOC 0% Voltage", Some("V")),
    sensor(32, U32, Div1000, "rec_charge_voltage", "Recommended Charge Voltage", Some("V")),
    sensor(36, U32, Div1000, "float_charge_voltage", "Float Charge Voltage", Some("V")),
    sensor(40, U32, Div1000, "auto_shutdown_voltage", "Auto Shutdown Voltage", Some("V")),
    sensor(44, U32, Div1000, "cont_charge_current", "Continuous Charge Current", Some("A")),
    sensor(48, U32, Raw, "charge_ocp_delay", "Charge OCP Delay", Some("s")),
    sensor(52, U32, Raw, "charge_ocp_release", "Charge OCP Release", Some("s")),
    sensor(56, U32, Div1000, "cont_discharge_current", "Continuous Discharge Current", Some("A")),
    sensor(60, U32, Raw, "discharge_ocp_delay", "Discharge OCP Delay", Some("s")),
    sensor(64, U32, Raw, "discharge_ocp_release", "Discharge OCP Release", Some("s")),
    sensor(68, U32, Raw, "sc_release", "Short Circuit Release", Some("s")),
    sensor(72, U32, Raw, "max_balance_current", "Max Balance Current", Some("mA")),
    sensor(76, I32, Div10, "charge_otp", "Charge Overtemperature Protection", Some("°C")),
    sensor(80, I32, Div10, "charge_otp_recovery", "Charge Overtemperature Recovery", Some("°C")),
    sensor(84, I32, Div10, "discharge_otp", "Discharge Overtemperature Protection", Some("°C")),
    sensor(88, I32, Div10, "discharge_otp_recovery", "Discharge Overtemperature Recovery", Some("°C")),
    sensor(92, I32, Div10, "charge_utp", "Charge Undertemperature Protection", Some("°C")),
    sensor(96, I32, Div10, "charge_utp_recovery", "Charge Undertemperature Recovery", Some("°C")),
    sensor(100, I32, Div10, "mos_otp", "MOS Overtemperature Protection", Some("°C")),
    sensor(104, I32, Div10, "mos_otp_recovery", "MOS Overtemperature Recovery", Some("°C")),
    sensor(108, U32, Raw, "cell_count", "Cell Count", None),
    binary(112, U32, "charge_switch", "Charge Switch"),
    binary(116, U32, "discharge_switch", "Discharge Switch"),
    binary(120, U32, "balance_switch", "Balance Switch"),
    sensor(128, U32, Raw, "sc_delay", "Short Circuit Delay", Some("us")),
    sensor(132, U32, Div1000, "balance_start_voltage", "Balance Start Voltage", Some("V")),
    sensor(DEVICE_ADDRESS_OFFSET, U32, Hex, "device_address", "Device Address", None),
    sensor(280, U8, Raw, "smart_sleep_time", "Smart Sleep Time", Some("h")),
];

/// Telemetry frame (0x02) registers: live measurements.
pub static TELEMETRY_REGISTERS: &[RegisterDef] = &[
    sensor(0, U16, Div1000, "cell_01_voltage", "Cell 01 Voltage", Some("V")),
    sensor(2, U16, Div1000, "cell_02_voltage", "Cell 02 Voltage", Some("V")),
    sensor(4, U16, Div1000, "cell_03_voltage", "Cell 03 Voltage", Some("V")),
    sensor(6, U16, Div1000, "cell_04_voltage", "Cell 04 Voltage", Some("V")),
    sensor(8, U16, Div1000, "cell_05_voltage", "Cell 05 Voltage", Some("V")),
    sensor(10, U16, Div1000, "cell_06_voltage", "Cell 06 Voltage", Some("V")),
    sensor(12, U16, Div1000, "cell_07_voltage", "Cell 07 Voltage", Some("V")),
    sensor(14, U16, Div1000, "cell_08_voltage", "Cell 08 Voltage", Some("V")),
    sensor(16, U16, Div1000, "cell_09_voltage", "Cell 09 Voltage", Some("V")),
    sensor(18, U16, Div1000, "cell_10_voltage", "Cell 10 Voltage", Some("V")),
    sensor(20, U16, Div1000, "cell_11_voltage", "Cell 11 Voltage", Some("V")),
    sensor(22, U16, Div1000, "cell_12_voltage", "Cell 12 Voltage", Some("V")),
    sensor(24, U16, Div1000, "cell_13_voltage", "Cell 13 Voltage", Some("V")),
    sensor(26, U16, Div1000, "cell_14_voltage", "Cell 14 Voltage", Some("V")),
    sensor(28, U16, Div1000, "cell_15_voltage", "Cell 15 Voltage", Some("V")),
    sensor(30, U16, Div1000, "cell_16_voltage", "Cell 16 Voltage", Some("V")),
    sensor(68, U16, Div1000, "avg_voltage", "Average Cell Voltage", Some("V")),
    sensor(70, U16, Div1000, "max_diff_voltage", "Max Cell Difference", Some("V")),
    sensor(72, U8, PlusOne, "max_cell_index", "Highest Cell", None),
    sensor(73, U8, PlusOne, "min_cell_index", "Lowest Cell", None),
    sensor(138, I16, Div10, "power_board_temp", "Power Board Temperature", Some("°C")),
    sensor(144, U32, Div1000, "total_voltage", "Pack Voltage", Some("V")),
    sensor(148, U32, Div1000, "power_watts", "Pack Power", Some("W")),
    sensor(152, I32, Div1000, "current", "Pack Current", Some("A")),
    sensor(156, I16, Div10, "temp_sensor_1", "Temperature 1", Some("°C")),
    sensor(158, I16, Div10, "temp_sensor_2", "Temperature 2", Some("°C")),
    sensor(164, I16, Raw, "balance_current", "Balance Current", Some("mA")),
    sensor(166, U8, Raw, "balance_action", "Balance Action", None),
    sensor(167, U8, Raw, "soc_percent", "State of Charge", Some("%")),
    sensor(168, I32, Div1000, "remaining_capacity_ah", "Remaining Capacity", Some("Ah")),
    sensor(172, U32, Div1000, "actual_capacity_ah", "Actual Capacity", Some("Ah")),
    sensor(176, U32, Raw, "cycle_count", "Cycle Count", None),
    sensor(180, U32, Div1000, "total_cycle_capacity", "Total Cycle Capacity", Some("Ah")),
    sensor(188, U32, Raw, "runtime_seconds", "Runtime", Some("s")),
    sensor(192, U16, Hex, "charge_status", "Charge Status", None),
    sensor(196, U16, Raw, "discharge_ocp_release_time", "Discharge OCP Release Time", Some("s")),
    sensor(198, U16, Raw, "discharge_sc_release_time", "Discharge SC Release Time", Some("s")),
    sensor(200, U16, Raw, "charge_ocp_release_time", "Charge OCP Release Time", Some("s")),
    sensor(202, U16, Raw, "charge_sc_release_time", "Charge SC Release Time", Some("s")),
    sensor(204, U16, Raw, "cell_uvp_release_time", "Cell UVP Release Time", Some("s")),
    sensor(206, U16, Raw, "cell_ovp_release_time", "Cell OVP Release Time", Some("s")),
    sensor(212, U16, Raw, "emergency_switch_time", "Emergency Switch Time", Some("s")),
    sensor(248, I16, Div10, "temp_sensor_3", "Temperature 3", Some("°C")),
    sensor(250, I16, Div10, "temp_sensor_4", "Temperature 4", Some("°C")),
    sensor(252, I16, Div10, "temp_sensor_5", "Temperature 5", Some("°C")),
    sensor(264, U32, Raw, "sleep_time_seconds", "Sleep Timer", Some("s")),
];

/// Register table for a frame kind.
pub fn register_map(kind: FrameKind) -> &'static [RegisterDef] {
    match kind {
        FrameKind::Settings => SETTINGS_REGISTERS,
        FrameKind::Telemetry => TELEMETRY_REGISTERS,
    }
}

/// Decode a validated frame into named, scaled fields.
///
/// Registers that fall outside the frame bounds are skipped silently; the
/// map is deliberately permissive so a shorter firmware revision does not
/// break the pipeline.
pub fn decode(kind: FrameKind, frame: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    for def in register_map(kind) {
        if let Some(raw) = def.width.read(frame, PAYLOAD_BASE + def.offset) {
            fields.insert(def.key.to_string(), def.scale.apply(raw));
        }
    }
    fields
}

/// Extract the hardware device address from a settings frame.
pub fn device_address(frame: &[u8]) -> Option<u32> {
    let at = PAYLOAD_BASE + DEVICE_ADDRESS_OFFSET;
    let bytes = frame.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
