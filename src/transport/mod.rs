//! Device-side transports: resilient byte-chunk sources.
//!
//! A transport owns exactly one connection (TCP gateway socket or serial
//! port), reconnects forever on transient failure with a fixed backoff,
//! and hands raw byte chunks to the decoder. To the caller the chunk
//! sequence never ends; a dead link just looks like a pause. Backoff is
//! deliberately fixed rather than exponential: failures here are resolved
//! externally (gateway reboot, cable replug), so ramping the delay only
//! slows recovery.

mod serial;
mod tcp;

pub use serial::SerialSource;
pub use tcp::TcpSource;

use crate::Result;

/// Infinite source of raw byte chunks.
///
/// `next_chunk` suspends until bytes arrive; transient I/O failures are
/// absorbed internally (teardown, backoff, reconnect). An `Err` from this
/// trait means the source cannot ever make progress and the pipeline
/// should stop.
#[async_trait::async_trait]
pub trait ChunkSource: Send + 'static {
    async fn next_chunk(&mut self) -> Result<Vec<u8>>;
}
