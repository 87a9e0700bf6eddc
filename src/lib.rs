//! Bridge between JiKong PB2A16S30P battery packs and MQTT.
//!
//! `jkbridge` listens on the pack's RS485 bus (directly through a USB
//! dongle, or through a TCP Modbus gateway), decodes the vendor's binary
//! frames, joins live telemetry with the settings frames that carry the
//! device identity, and publishes the merged result to an MQTT broker in
//! a shape Home Assistant discovers automatically.
//!
//! # Design
//!
//! - **Continuous operation over completeness**: every transport and
//!   broker failure is retried forever with fixed backoff; a missing
//!   reading is acceptable, a crash on recoverable I/O is not.
//! - **Single-writer pipeline**: transport → decoder → correlator →
//!   scheduler run as one sequential task; only the broker connection is
//!   maintained concurrently, behind the [`MessageSink`] seam.
//! - **Explicit correlation state**: telemetry frames carry no identity,
//!   so the most recent unmatched snapshot waits in a single, inspectable
//!   pending slot until a settings frame names its device or the
//!   correlation window expires.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use jkbridge::{Bridge, BridgeConfig};
//! use futures::StreamExt;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> jkbridge::Result<()> {
//!     let options = std::fs::read_to_string("/data/options.json")
//!         .map_err(|e| jkbridge::BridgeError::config_error(e.to_string()))?;
//!     let config = BridgeConfig::from_options_json(&options)?;
//!
//!     let handle = Bridge::start(config)?;
//!     let mut updates = std::pin::pin!(handle.updates());
//!     while let Some(update) = updates.next().await {
//!         println!("device {}: merged={}", update.device_id, update.telemetry.is_some());
//!     }
//!     Ok(())
//! }
//! ```

mod config;
mod correlator;
mod decoder;
mod driver;
mod error;
mod frame;
mod publisher;
mod scheduler;
pub mod registers;
pub mod transport;

pub use config::{BridgeConfig, MqttConfig, SerialConfig, TcpConfig, TransportConfig};
pub use correlator::{Correlator, DeviceRecord};
pub use decoder::{FRAME_MARKER, FrameDecoder};
pub use driver::{BridgeChannels, Driver};
pub use error::{BridgeError, Result};
pub use frame::{DeviceUpdate, FieldMap, FrameKind, LinkState, Publication, RawFrame};
pub use publisher::{MessageSink, MqttPublisher};
pub use scheduler::PublishScheduler;
pub use transport::{ChunkSource, SerialSource, TcpSource};

use futures::Stream;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Unified entry point wiring the full pipeline from configuration.
///
/// Validates the configuration, connects the broker publisher, builds the
/// configured transport and spawns the ingest pipeline. Must be called
/// from within a Tokio runtime.
pub struct Bridge;

impl Bridge {
    /// Start the bridge and return a handle for observation and shutdown.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError::Config`] for fatal misconfiguration (the
    /// only startup-time hard failure); all later I/O trouble is retried
    /// internally.
    pub fn start(config: BridgeConfig) -> Result<BridgeHandle> {
        config.validate()?;
        info!(transport = ?config.transport, "starting bridge");

        let cancel = CancellationToken::new();
        let (publisher, broker_task) = MqttPublisher::connect(&config.mqtt, cancel.clone());
        let sink: Arc<dyn MessageSink> = Arc::new(publisher);

        let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
        let channels = match &config.transport {
            TransportConfig::Tcp(tcp) => {
                let source = TcpSource::new(tcp.clone(), link_tx)?;
                Driver::spawn(source, sink, &config, link_rx, cancel)
            }
            TransportConfig::Serial(serial) => {
                let source = SerialSource::new(serial.clone(), link_tx)?;
                Driver::spawn(source, sink, &config, link_rx, cancel)
            }
        };

        Ok(BridgeHandle { channels, broker_task: Some(broker_task) })
    }
}

/// Running bridge handle.
///
/// Dropping the handle cancels both the ingest pipeline and the broker
/// connection task.
pub struct BridgeHandle {
    channels: BridgeChannels,
    // Option so shutdown can take the handle out despite the Drop impl.
    broker_task: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Stream of merged device updates.
    pub fn updates(&self) -> impl Stream<Item = Arc<DeviceUpdate>> + 'static {
        use futures::StreamExt;
        WatchStream::new(self.channels.updates.clone()).filter_map(|opt| async move { opt })
    }

    /// Latest merged device update, if any has been produced yet.
    pub fn latest_update(&self) -> Option<Arc<DeviceUpdate>> {
        self.channels.updates.borrow().clone()
    }

    /// Current device-side link state.
    pub fn link_state(&self) -> LinkState {
        *self.channels.link.borrow()
    }

    /// Watch receiver for device-side link state transitions.
    pub fn link_changes(&self) -> watch::Receiver<LinkState> {
        self.channels.link.clone()
    }

    /// Stop both execution contexts and wait for the broker task to
    /// release its connection.
    pub async fn shutdown(mut self) {
        self.channels.cancel.cancel();
        if let Some(task) = self.broker_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.channels.cancel.cancel();
    }
}
