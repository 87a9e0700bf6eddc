//! Time-windowed correlation of telemetry and settings frames.
//!
//! Telemetry frames on this protocol do not self-report a device identity;
//! only the infrequent settings frame carries the hardware address. The
//! correlator therefore keeps a single explicit pending slot holding the
//! most recent unmatched telemetry snapshot, and joins it with the next
//! settings frame that arrives inside the correlation window:
//!
//! ```text
//! empty -> pendingTelemetry -> matched (emit, back to empty)
//!                           \-> expired (discard, back to empty)
//! ```
//!
//! The slot is deliberately a first-class piece of state with an explicit
//! `now` parameter on every operation, so the whole state machine is unit
//! testable without a transport or a broker. Expiry is checked lazily on
//! settings arrival and additionally by [`sweep`], which the pipeline
//! drives on a timer so an unmatched snapshot never lingers silently.
//!
//! [`sweep`]: Correlator::sweep

use crate::frame::{DeviceUpdate, FieldMap};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// The most recent unmatched telemetry snapshot.
#[derive(Debug)]
struct PendingTelemetry {
    fields: FieldMap,
    received_at: Instant,
}

/// Merged per-device state, kept for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub settings: FieldMap,
    pub telemetry: Option<FieldMap>,
    pub last_update: Instant,
}

/// Joins the telemetry and settings event streams inside a bounded window.
///
/// Single-writer: the ingest pipeline is the only mutator.
#[derive(Debug)]
pub struct Correlator {
    pending: Option<PendingTelemetry>,
    devices: HashMap<u32, DeviceRecord>,
    packet_expire: Duration,
    expired_snapshots: u64,
}

impl Correlator {
    pub fn new(packet_expire: Duration) -> Self {
        Self { pending: None, devices: HashMap::new(), packet_expire, expired_snapshots: 0 }
    }

    /// Store or replace the pending telemetry snapshot.
    ///
    /// A newer snapshot always wins; an unmatched older one is superseded,
    /// not emitted.
    pub fn on_telemetry(&mut self, fields: FieldMap, received_at: Instant) {
        if self.pending.is_some() {
            trace!("replacing unmatched pending telemetry");
        }
        self.pending = Some(PendingTelemetry { fields, received_at });
    }

    /// Handle a settings frame carrying device identity.
    ///
    /// Merges the pending telemetry into the device record when it is still
    /// inside the correlation window; otherwise the snapshot is discarded
    /// and the update carries settings only. The device record is always
    /// updated.
    pub fn on_settings(&mut self, device_id: u32, fields: FieldMap, now: Instant) -> DeviceUpdate {
        let telemetry = match self.pending.take() {
            Some(pending) if now.duration_since(pending.received_at) <= self.packet_expire => {
                Some(pending.fields)
            }
            Some(pending) => {
                self.expired_snapshots += 1;
                debug!(
                    age_ms = now.duration_since(pending.received_at).as_millis() as u64,
                    device_id, "pending telemetry expired; publishing settings only"
                );
                None
            }
            None => None,
        };

        let record = self.devices.entry(device_id).or_insert_with(|| DeviceRecord {
            settings: FieldMap::new(),
            telemetry: None,
            last_update: now,
        });
        record.settings = fields.clone();
        if let Some(telemetry) = &telemetry {
            record.telemetry = Some(telemetry.clone());
        }
        record.last_update = now;

        DeviceUpdate { device_id, settings: fields, telemetry }
    }

    /// Drop the pending snapshot if its window has already elapsed.
    ///
    /// Driven periodically by the pipeline; expired snapshots are never
    /// merged into output regardless of which check catches them first.
    pub fn sweep(&mut self, now: Instant) {
        if let Some(pending) = &self.pending
            && now.duration_since(pending.received_at) > self.packet_expire
        {
            self.expired_snapshots += 1;
            debug!(
                age_ms = now.duration_since(pending.received_at).as_millis() as u64,
                "sweeping expired telemetry snapshot"
            );
            self.pending = None;
        }
    }

    /// Whether an unmatched telemetry snapshot is currently buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Total snapshots discarded as expired.
    pub fn expired_snapshots(&self) -> u64 {
        self.expired_snapshots
    }

    /// The merged record for a device, if it has ever been observed.
    pub fn record(&self, device_id: u32) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    /// Number of distinct device identities observed so far.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
