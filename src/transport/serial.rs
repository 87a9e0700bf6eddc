//! Serial transport for RS485 USB dongles.

use super::ChunkSource;
use crate::config::SerialConfig;
use crate::frame::LinkState;
use crate::{BridgeError, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

/// Read buffer size for serial chunks; RS485 at 115200 baud never bursts
/// more than this between polls.
const SERIAL_CHUNK_SIZE: usize = 1024;

/// Byte-chunk source over an RS485 USB dongle.
///
/// Unlike the TCP gateway, a quiet serial port is normal (the bus master
/// polls in rounds), so a read timeout just means "no traffic yet" and the
/// port is kept open. End of stream and real I/O errors tear the port
/// down, covering dongle unplug/replug cycles.
///
/// The reconnect backoff is an absolute deadline in the struct so that a
/// `next_chunk` future dropped by the pipeline's `select!` cannot reset it.
pub struct SerialSource {
    config: SerialConfig,
    link: watch::Sender<LinkState>,
    port: Option<SerialStream>,
    /// Earliest instant the next open attempt may start.
    next_attempt_at: Option<Instant>,
}

impl SerialSource {
    /// Validate the configuration and create the source. The port is not
    /// opened until the first [`ChunkSource::next_chunk`] call.
    pub fn new(config: SerialConfig, link: watch::Sender<LinkState>) -> Result<Self> {
        if config.device.trim().is_empty() {
            return Err(BridgeError::config_error(
                "serial transport selected but no device path configured",
            ));
        }
        Ok(Self { config, link, port: None, next_attempt_at: None })
    }

    async fn open_with_backoff(&mut self) -> SerialStream {
        loop {
            if let Some(deadline) = self.next_attempt_at {
                sleep_until(deadline).await;
            }
            self.next_attempt_at = Some(Instant::now() + self.config.reconnect_delay());
            match tokio_serial::new(self.config.device.as_str(), self.config.baudrate)
                .open_native_async()
            {
                Ok(port) => {
                    info!(device = %self.config.device, baudrate = self.config.baudrate, "serial port opened");
                    self.link.send_replace(LinkState::Connected);
                    return port;
                }
                Err(e) => {
                    warn!(
                        device = %self.config.device,
                        "serial open failed: {e}; retrying in {:?}",
                        self.config.reconnect_delay()
                    );
                }
            }
        }
    }

    fn drop_port(&mut self) {
        self.port = None;
        self.link.send_replace(LinkState::Disconnected);
    }
}

#[async_trait::async_trait]
impl ChunkSource for SerialSource {
    async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.port.is_none() {
                let port = self.open_with_backoff().await;
                self.port = Some(port);
            }
            let Some(port) = self.port.as_mut() else {
                continue;
            };

            let mut chunk = vec![0u8; SERIAL_CHUNK_SIZE];
            match timeout(self.config.read_timeout(), port.read(&mut chunk)).await {
                Err(_) => {
                    // No traffic inside the timeout window; keep listening.
                    continue;
                }
                Ok(Ok(n)) if n > 0 => {
                    chunk.truncate(n);
                    return Ok(chunk);
                }
                Ok(Ok(_)) => {
                    // End of stream means the dongle went away, not a quiet
                    // bus; reopen so a replugged device node is picked up.
                    warn!(device = %self.config.device, "serial port returned end of stream; reopening");
                }
                Ok(Err(e)) => {
                    warn!(device = %self.config.device, "serial read failed: {e}");
                }
            }

            self.drop_port();
        }
    }
}
