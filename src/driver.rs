//! Driver spawns and manages the ingest pipeline task.
//!
//! The pipeline (transport, decoder, correlator, scheduler) runs as one
//! sequential task: the correlator has a single writer by construction, so
//! no locking is needed anywhere in the hot path. The only concurrent
//! neighbor is the MQTT event-loop task, reached through the [`MessageSink`]
//! seam, which is safe to call from here while it reconnects in the
//! background.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::decoder::FrameDecoder;
use crate::frame::{DeviceUpdate, FrameKind, LinkState};
use crate::publisher::MessageSink;
use crate::registers;
use crate::scheduler::PublishScheduler;
use crate::transport::ChunkSource;

/// Handles returned by [`Driver::spawn`].
pub struct BridgeChannels {
    /// Latest merged device update.
    pub updates: watch::Receiver<Option<Arc<DeviceUpdate>>>,
    /// Device-side link state transitions.
    pub link: watch::Receiver<LinkState>,
    /// Cancellation token for graceful shutdown.
    pub cancel: CancellationToken,
}

/// Driver spawns and manages the ingest pipeline task.
pub struct Driver;

impl Driver {
    /// Spawn the ingest task over the given chunk source and message sink.
    ///
    /// Returns a watch receiver for merged device updates, the transport
    /// link-state receiver, and the cancellation token that stops the task.
    pub fn spawn<S>(
        source: S,
        sink: Arc<dyn MessageSink>,
        config: &BridgeConfig,
        link: watch::Receiver<LinkState>,
        cancel: CancellationToken,
    ) -> BridgeChannels
    where
        S: ChunkSource,
    {
        let (update_tx, update_rx) = watch::channel(None);

        let decoder = FrameDecoder::new(config.strict_checksum);
        let correlator = Correlator::new(config.packet_expire());
        let scheduler = PublishScheduler::new(&config.mqtt, config.settings_publish_interval());

        let cancel_task = cancel.clone();
        let sweep_period = config.packet_expire();
        tokio::spawn(async move {
            Self::ingest_task(
                source,
                sink,
                decoder,
                correlator,
                scheduler,
                sweep_period,
                update_tx,
                cancel_task,
            )
            .await;
        });

        BridgeChannels { updates: update_rx, link, cancel }
    }

    #[allow(clippy::too_many_arguments)]
    async fn ingest_task<S>(
        mut source: S,
        sink: Arc<dyn MessageSink>,
        mut decoder: FrameDecoder,
        mut correlator: Correlator,
        mut scheduler: PublishScheduler,
        sweep_period: std::time::Duration,
        update_tx: watch::Sender<Option<Arc<DeviceUpdate>>>,
        cancel: CancellationToken,
    ) where
        S: ChunkSource,
    {
        info!("ingest task started");
        let mut sweep = interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingest task cancelled");
                    break;
                }
                _ = sweep.tick() => {
                    correlator.sweep(Instant::now());
                }
                chunk = source.next_chunk() => {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            // Transports absorb transient failures; reaching
                            // here means the source can never make progress.
                            error!("transport failed permanently: {e}");
                            break;
                        }
                    };

                    let now = Instant::now();
                    for frame in decoder.push(&chunk, now) {
                        match frame.kind {
                            FrameKind::Telemetry => {
                                let fields = registers::decode(frame.kind, &frame.payload);
                                trace!(fields = fields.len(), "telemetry frame pending correlation");
                                correlator.on_telemetry(fields, frame.received_at);
                            }
                            FrameKind::Settings => {
                                let Some(device_id) = registers::device_address(&frame.payload)
                                else {
                                    warn!("settings frame without readable device address; ignoring");
                                    continue;
                                };
                                let fields = registers::decode(frame.kind, &frame.payload);
                                let update = correlator.on_settings(device_id, fields, now);
                                debug!(
                                    device_id,
                                    merged_telemetry = update.telemetry.is_some(),
                                    "device update"
                                );

                                for publication in scheduler.plan(&update, now) {
                                    sink.publish(publication).await;
                                }

                                if update_tx.send(Some(Arc::new(update))).is_err() {
                                    trace!("no update subscribers");
                                }
                            }
                        }
                    }
                }
            }
        }

        info!(
            frames = decoder.frames_emitted(),
            malformed = decoder.frames_malformed(),
            expired = correlator.expired_snapshots(),
            devices = correlator.device_count(),
            "ingest task ended"
        );
    }
}
