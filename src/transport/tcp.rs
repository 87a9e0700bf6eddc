//! TCP transport for Modbus-gateway attached packs.

use super::ChunkSource;
use crate::config::TcpConfig;
use crate::frame::LinkState;
use crate::{BridgeError, Result};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{info, warn};

/// Byte-chunk source over a TCP Modbus gateway.
///
/// The gateway forwards the RS485 bus verbatim; a socket that stays silent
/// past the read timeout is considered dead, since a healthy bus chatters
/// constantly.
///
/// The pipeline polls [`ChunkSource::next_chunk`] inside a `select!`, so
/// the future may be dropped and recreated at any await point. Both the
/// reconnect backoff and the read timeout are therefore kept as absolute
/// deadlines in the struct, not as local sleeps that a cancellation would
/// reset.
pub struct TcpSource {
    config: TcpConfig,
    link: watch::Sender<LinkState>,
    stream: Option<TcpStream>,
    /// Earliest instant the next connect attempt may start.
    next_attempt_at: Option<Instant>,
    /// Instant the current connection is declared dead if no bytes arrive.
    read_deadline: Instant,
}

impl TcpSource {
    /// Validate the configuration and create the source. No connection is
    /// attempted until the first [`ChunkSource::next_chunk`] call.
    pub fn new(config: TcpConfig, link: watch::Sender<LinkState>) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(BridgeError::config_error("tcp transport selected but no host configured"));
        }
        Ok(Self { config, link, stream: None, next_attempt_at: None, read_deadline: Instant::now() })
    }

    async fn connect_with_backoff(&mut self) -> TcpStream {
        loop {
            if let Some(deadline) = self.next_attempt_at {
                sleep_until(deadline).await;
            }
            // Recorded before the attempt so cancellation mid-connect still
            // leaves at most one attempt per backoff interval.
            self.next_attempt_at = Some(Instant::now() + self.config.reconnect_delay());
            match TcpStream::connect((self.config.host.as_str(), self.config.port)).await {
                Ok(stream) => {
                    info!(host = %self.config.host, port = self.config.port, "tcp gateway connected");
                    self.link.send_replace(LinkState::Connected);
                    return stream;
                }
                Err(e) => {
                    warn!(
                        host = %self.config.host,
                        port = self.config.port,
                        "tcp connect failed: {e}; retrying in {:?}",
                        self.config.reconnect_delay()
                    );
                }
            }
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.link.send_replace(LinkState::Disconnected);
    }
}

#[async_trait::async_trait]
impl ChunkSource for TcpSource {
    async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.stream.is_none() {
                let stream = self.connect_with_backoff().await;
                self.read_deadline = Instant::now() + self.config.read_timeout();
                self.stream = Some(stream);
            }
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };

            let mut chunk = vec![0u8; self.config.buffer_size];
            match timeout_at(self.read_deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    warn!("tcp gateway closed the connection");
                }
                Ok(Ok(n)) => {
                    self.read_deadline = Instant::now() + self.config.read_timeout();
                    chunk.truncate(n);
                    return Ok(chunk);
                }
                Ok(Err(e)) => {
                    warn!("tcp read failed: {e}");
                }
                Err(_) => {
                    warn!(
                        timeout = ?self.config.read_timeout(),
                        "tcp gateway silent past read timeout; reconnecting"
                    );
                }
            }

            self.drop_connection();
        }
    }
}
