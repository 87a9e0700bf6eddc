//! Best-effort MQTT publishing with background reconnection.
//!
//! The broker connection lives in its own task and never blocks the ingest
//! pipeline: `publish` drops the message (with a log line) when the broker
//! is unreachable, because telemetry is perishable and a backlog of stale
//! values helps nobody. Reconnection is retried forever with a fixed
//! backoff, both at startup and after later disconnects.

use crate::config::MqttConfig;
use crate::frame::Publication;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, LastWill, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed delay between broker reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Outbound message sink the pipeline publishes through.
///
/// Abstracts over the broker so the pipeline (and its tests) never touch a
/// network connection directly.
#[async_trait::async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Best-effort publish; implementations must never block on a dead
    /// broker.
    async fn publish(&self, publication: Publication);

    /// Whether the sink currently has a live broker connection.
    fn is_connected(&self) -> bool;
}

/// MQTT publisher backed by `rumqttc`, with its event loop running as an
/// independent background task.
pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    dropped: AtomicU64,
}

impl MqttPublisher {
    /// Create the publisher and spawn its connection-maintenance task.
    ///
    /// The task keeps polling the event loop until `cancel` fires; a last
    /// will marks the bridge `offline` on the status topic if the process
    /// dies uncleanly, and `online` is (re-)published on every successful
    /// connect.
    pub fn connect(config: &MqttConfig, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let status_topic = config.status_topic();

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(status_topic.clone(), "offline", QoS::AtLeastOnce, true));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let connected = Arc::new(AtomicBool::new(false));

        let task = {
            let client = client.clone();
            let connected = Arc::clone(&connected);
            let host = config.host.clone();
            let port = config.port;
            tokio::spawn(async move {
                info!(%host, port, "mqtt connection task started");
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = client.disconnect().await;
                            info!("mqtt connection task stopped");
                            break;
                        }
                        event = eventloop.poll() => match event {
                            Ok(Event::Incoming(Packet::ConnAck(ack)))
                                if ack.code == ConnectReturnCode::Success =>
                            {
                                connected.store(true, Ordering::Release);
                                info!(%host, port, "mqtt connected");
                                if let Err(e) = client
                                    .publish(status_topic.clone(), QoS::AtLeastOnce, true, "online")
                                    .await
                                {
                                    warn!("failed to publish online status: {e}");
                                }
                            }
                            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                                connected.store(false, Ordering::Release);
                                warn!(code = ?ack.code, "mqtt connection refused");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                if connected.swap(false, Ordering::AcqRel) {
                                    warn!("mqtt connection lost: {e}");
                                } else {
                                    debug!("mqtt connect attempt failed: {e}");
                                }
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                                }
                            }
                        }
                    }
                }
            })
        };

        (Self { client, connected, dropped: AtomicU64::new(0) }, task)
    }

    /// Messages dropped because the broker was unreachable.
    pub fn dropped_publishes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl MessageSink for MqttPublisher {
    async fn publish(&self, publication: Publication) {
        if !self.is_connected() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %publication.topic, "broker disconnected; dropping publish");
            return;
        }
        if let Err(e) = self
            .client
            .publish(publication.topic, QoS::AtMostOnce, publication.retain, publication.payload)
            .await
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("mqtt publish failed: {e}");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
