use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Outgoing byte buffer between the protocol engine and the transport. The engine stops encoding
///  once the high water mark is reached and resumes when the transport has taken the bytes.
pub struct AshWriter {
    pending: BytesMut,
    high_water_mark: usize,
}

impl AshWriter {
    pub fn new(high_water_mark: usize) -> AshWriter {
        AshWriter {
            pending: BytesMut::with_capacity(high_water_mark),
            high_water_mark,
        }
    }

    pub fn write_available(&self) -> bool {
        self.pending.len() < self.high_water_mark
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.pending.put_u8(byte);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hands all buffered bytes over for writing to the transport
    pub fn take(&mut self) -> Bytes {
        let result = self.pending.split().freeze();
        if !result.is_empty() {
            trace!("writing {} raw bytes: {:02X?}", result.len(), result.as_ref());
        }
        result
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
