//! Incremental frame decoder for the JK wire protocol.
//!
//! The transport delivers raw byte chunks with no respect for frame
//! boundaries: a frame may span several chunks, and one chunk may carry
//! several frames. The decoder accumulates bytes across [`push`] calls,
//! scans for the 4-byte start marker, reads the type discriminator to get
//! the fixed expected length, and emits a [`RawFrame`] once structural
//! validation passes.
//!
//! Recovery rules:
//! - Not enough bytes for a complete frame is not an error; the decoder
//!   simply waits for more input.
//! - An unrecognized type byte after a marker, or a failed checksum in
//!   strict mode, discards exactly one byte and resumes scanning, so a
//!   corrupt stream can never stall the parser.
//! - Markerless garbage is pruned down to the last 3 bytes (a possible
//!   partial marker), keeping the buffer bounded.
//!
//! [`push`]: FrameDecoder::push

use crate::frame::{FrameKind, RawFrame};
use tokio::time::Instant;
use tracing::{trace, warn};

/// Start-of-frame marker shared by both frame kinds.
pub const FRAME_MARKER: [u8; 4] = [0x55, 0xAA, 0xEB, 0x90];

/// Stateful incremental parser over the transport chunk sequence.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    strict_checksum: bool,
    frames_emitted: u64,
    frames_malformed: u64,
}

impl FrameDecoder {
    /// Create a decoder. With `strict_checksum` set, the trailing byte of
    /// every frame must equal the low byte of the sum of all preceding
    /// frame bytes; otherwise the trailing byte is ignored, matching
    /// observed device behavior.
    pub fn new(strict_checksum: bool) -> Self {
        Self { buf: Vec::new(), strict_checksum, frames_emitted: 0, frames_malformed: 0 }
    }

    /// Feed one transport chunk and drain every frame it completes.
    ///
    /// `now` is stamped onto emitted frames as their arrival time.
    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Vec<RawFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf) else {
                // No marker anywhere; keep only a possible partial marker.
                if self.buf.len() > FRAME_MARKER.len() - 1 {
                    self.buf.drain(..self.buf.len() - (FRAME_MARKER.len() - 1));
                }
                break;
            };
            if start > 0 {
                trace!(skipped = start, "skipping bytes ahead of frame marker");
                self.buf.drain(..start);
            }

            // Marker is now at offset 0; the type byte sits right after it.
            if self.buf.len() <= FRAME_MARKER.len() {
                break;
            }
            let type_byte = self.buf[FRAME_MARKER.len()];
            let Some(kind) = FrameKind::from_type_byte(type_byte) else {
                self.frames_malformed += 1;
                warn!("unknown frame type 0x{type_byte:02X}; resynchronizing");
                self.buf.drain(..1);
                continue;
            };

            let frame_len = kind.frame_len();
            if self.buf.len() < frame_len {
                break;
            }

            if self.strict_checksum && !checksum_ok(&self.buf[..frame_len]) {
                self.frames_malformed += 1;
                warn!(kind = ?kind, "frame checksum mismatch; resynchronizing");
                self.buf.drain(..1);
                continue;
            }

            let payload = self.buf[..frame_len].to_vec();
            self.buf.drain(..frame_len);
            self.frames_emitted += 1;
            trace!(kind = ?kind, len = frame_len, "frame decoded");
            frames.push(RawFrame { kind, payload, received_at: now });
        }

        frames
    }

    /// Total structurally valid frames emitted.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Total byte runs rejected during resynchronization.
    pub fn frames_malformed(&self) -> u64 {
        self.frames_malformed
    }

    /// Bytes currently buffered awaiting completion.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MARKER.len()).position(|window| window == FRAME_MARKER)
}

fn checksum_ok(frame: &[u8]) -> bool {
    let Some((&expected, body)) = frame.split_last() else {
        return false;
    };
    let sum: u32 = body.iter().map(|&b| b as u32).sum();
    (sum & 0xFF) as u8 == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Build a structurally valid frame with a correct trailing checksum.
    fn make_frame(kind: FrameKind, fill: u8) -> Vec<u8> {
        let len = kind.frame_len();
        let mut frame = vec![fill; len];
        frame[..4].copy_from_slice(&FRAME_MARKER);
        frame[4] = match kind {
            FrameKind::Settings => 0x01,
            FrameKind::Telemetry => 0x02,
        };
        let sum: u32 = frame[..len - 1].iter().map(|&b| b as u32).sum();
        frame[len - 1] = (sum & 0xFF) as u8;
        frame
    }

    fn kinds(frames: &[RawFrame]) -> Vec<FrameKind> {
        frames.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn single_frame_in_one_chunk() {
        let mut decoder = FrameDecoder::new(false);
        let frame = make_frame(FrameKind::Telemetry, 0x11);
        let out = decoder.push(&frame, Instant::now());

        assert_eq!(kinds(&out), vec![FrameKind::Telemetry]);
        assert_eq!(out[0].payload, frame);
        assert_eq!(decoder.frames_emitted(), 1);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new(false);
        let mut stream = make_frame(FrameKind::Telemetry, 0x11);
        stream.extend(make_frame(FrameKind::Settings, 0x22));
        let out = decoder.push(&stream, Instant::now());

        assert_eq!(kinds(&out), vec![FrameKind::Telemetry, FrameKind::Settings]);
    }

    #[test]
    fn one_byte_chunks_yield_identical_frames() {
        let mut stream = make_frame(FrameKind::Settings, 0x33);
        stream.extend(make_frame(FrameKind::Telemetry, 0x44));

        let now = Instant::now();
        let mut whole = FrameDecoder::new(false);
        let expected = whole.push(&stream, now);

        let mut bytewise = FrameDecoder::new(false);
        let mut collected = Vec::new();
        for byte in &stream {
            collected.extend(bytewise.push(std::slice::from_ref(byte), now));
        }

        assert_eq!(kinds(&collected), kinds(&expected));
        for (a, b) in collected.iter().zip(&expected) {
            assert_eq!(a.payload, b.payload);
        }
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let mut decoder = FrameDecoder::new(false);
        let mut stream = vec![0x00, 0xFF, 0x55, 0xAA]; // includes a partial marker
        stream.extend(make_frame(FrameKind::Telemetry, 0x11));
        stream.extend([0xDE, 0xAD, 0xBE, 0xEF]);
        stream.extend(make_frame(FrameKind::Settings, 0x22));

        let out = decoder.push(&stream, Instant::now());
        assert_eq!(kinds(&out), vec![FrameKind::Telemetry, FrameKind::Settings]);
    }

    #[test]
    fn unknown_type_byte_resynchronizes() {
        let mut decoder = FrameDecoder::new(false);
        // A marker followed by an invalid type, then a real frame.
        let mut stream = FRAME_MARKER.to_vec();
        stream.push(0x7F);
        stream.extend(make_frame(FrameKind::Telemetry, 0x11));

        let out = decoder.push(&stream, Instant::now());
        assert_eq!(kinds(&out), vec![FrameKind::Telemetry]);
        assert_eq!(decoder.frames_malformed(), 1);
    }

    #[test]
    fn strict_mode_rejects_bad_checksum() {
        let mut bad = make_frame(FrameKind::Telemetry, 0x11);
        let len = bad.len();
        bad[len - 1] ^= 0xFF;

        let mut strict = FrameDecoder::new(true);
        let out = strict.push(&bad, Instant::now());
        assert!(out.is_empty());
        assert!(strict.frames_malformed() >= 1);

        // Permissive mode accepts the same bytes.
        let mut permissive = FrameDecoder::new(false);
        let out = permissive.push(&bad, Instant::now());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn strict_mode_accepts_valid_checksum_and_recovers_after_corruption() {
        let mut decoder = FrameDecoder::new(true);
        let mut corrupted = make_frame(FrameKind::Settings, 0x22);
        corrupted[100] ^= 0x01; // breaks the checksum
        let mut stream = corrupted;
        stream.extend(make_frame(FrameKind::Telemetry, 0x11));

        let out = decoder.push(&stream, Instant::now());
        assert_eq!(kinds(&out), vec![FrameKind::Telemetry]);
    }

    #[test]
    fn markerless_garbage_stays_bounded() {
        let mut decoder = FrameDecoder::new(false);
        let out = decoder.push(&vec![0xAB; 10_000], Instant::now());
        assert!(out.is_empty());
        assert!(decoder.buffered() < FRAME_MARKER.len());
    }

    #[test]
    fn partial_marker_survives_pruning() {
        let mut decoder = FrameDecoder::new(false);
        let frame = make_frame(FrameKind::Telemetry, 0x11);

        // Garbage ending in the first 3 marker bytes, then the rest of the frame.
        let mut first = vec![0x00; 512];
        first.extend(&frame[..3]);
        assert!(decoder.push(&first, Instant::now()).is_empty());

        let out = decoder.push(&frame[3..], Instant::now());
        assert_eq!(kinds(&out), vec![FrameKind::Telemetry]);
    }

    proptest! {
        #[test]
        fn chunk_partition_independence(cuts in prop::collection::vec(1usize..64, 0..48)) {
            // Any partition of the byte stream must produce the same frames
            // as feeding it whole.
            let mut stream = make_frame(FrameKind::Telemetry, 0x11);
            stream.extend([0xDE, 0xAD]);
            stream.extend(make_frame(FrameKind::Settings, 0x22));
            stream.extend(make_frame(FrameKind::Telemetry, 0x33));

            let now = Instant::now();
            let mut whole = FrameDecoder::new(false);
            let expected = whole.push(&stream, now);
            prop_assert_eq!(expected.len(), 3);

            let mut split = FrameDecoder::new(false);
            let mut collected = Vec::new();
            let mut rest: &[u8] = &stream;
            for cut in cuts {
                let cut = cut.min(rest.len());
                let (head, tail) = rest.split_at(cut);
                collected.extend(split.push(head, now));
                rest = tail;
            }
            collected.extend(split.push(rest, now));

            prop_assert_eq!(collected.len(), expected.len());
            for (a, b) in collected.iter().zip(&expected) {
                prop_assert_eq!(a.kind, b.kind);
                prop_assert_eq!(&a.payload, &b.payload);
            }
        }
    }
}
