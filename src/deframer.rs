use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};
use crate::consts::{CANCEL, FLAG, MAX_STUFFED_FRAME_LEN};

/// A flag-terminated chunk of raw (still stuffed) bytes as it arrived from the transport
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawFrame {
    /// the bytes up to and including the terminating FLAG, starting after the last CANCEL
    pub data: Bytes,
    /// true if the chunk contained a CANCEL byte, i.e. the peer aborted a frame in progress
    pub cancelled: bool,
}

/// Splits a stream of bytes arriving in arbitrary chunks into flag-terminated raw frames. Bytes
///  after the last flag are kept until the next chunk arrives, but no more than a maximum size
///  frame: anything older than that can only be the start of an oversized frame.
#[derive(Default)]
pub struct Deframer {
    pending: BytesMut,
}

impl Deframer {
    pub fn new() -> Deframer {
        Deframer::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        trace!("received {} raw bytes: {:02X?}", chunk.len(), chunk);
        self.pending.extend_from_slice(chunk);
        self.trim_partial_frame();
    }

    /// Drops the oldest bytes of an overlong partial frame, keeping a CANCEL among them
    fn trim_partial_frame(&mut self) {
        let tail_start = self.pending.iter().rposition(|&b| b == FLAG).map_or(0, |pos| pos + 1);
        let tail_len = self.pending.len() - tail_start;
        if tail_len <= MAX_STUFFED_FRAME_LEN {
            return;
        }

        let excess = tail_len - MAX_STUFFED_FRAME_LEN;
        let dropped = tail_start..tail_start + excess;
        debug!("discarding {} bytes without frame delimiter", excess);

        let mut trimmed = BytesMut::with_capacity(self.pending.len() - excess + 1);
        trimmed.put_slice(&self.pending[..tail_start]);
        if self.pending[dropped.clone()].contains(&CANCEL) {
            trimmed.put_u8(CANCEL);
        }
        trimmed.put_slice(&self.pending[dropped.end..]);
        self.pending = trimmed;
    }

    /// number of buffered bytes that do not belong to a complete frame yet
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn next_frame(&mut self) -> Option<RawFrame> {
        let pos = self.pending.iter().position(|&b| b == FLAG)?;
        let mut data = self.pending.split_to(pos + 1).freeze();

        // a CANCEL aborts everything before it
        let cancelled = match data.iter().rposition(|&b| b == CANCEL) {
            Some(idx) => {
                let _ = data.split_to(idx + 1);
                true
            }
            None => false,
        };

        Some(RawFrame { data, cancelled })
    }

    /// Lazily iterates the complete frames currently buffered
    pub fn frames(&mut self) -> impl Iterator<Item = RawFrame> + '_ {
        std::iter::from_fn(move || self.next_frame())
    }

    /// Convenience for pushing a chunk and collecting the frames it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawFrame> {
        self.push(chunk);
        self.frames().collect()
    }
}
