use super::codec::split_frame;
use super::types::{Message, Result, WireError};

/// Reassembles length-delimited messages from arbitrarily chunked reads.
///
/// Bytes are appended as they arrive. `cursor` marks the start of the first
/// frame not yet decoded; the consumed prefix is only dropped once a whole
/// frame has been taken off, so a partial frame stays exactly where it was
/// until the rest of it shows up.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    cursor: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed and leaves the buffer untouched.
    ///
    /// A frame whose payload fails to decode is consumed and reported as
    /// [`WireError::MalformedFrame`]; decoding can carry on with the next
    /// frame. Any other error comes from the length prefix itself: the
    /// stream is corrupt, the buffer is left as-is and should not be reused.
    pub fn decode_next<T: Message>(&mut self) -> Result<Option<T>> {
        let pending = &self.buf[self.cursor..];
        let Some((header_len, payload_len)) = split_frame(pending)? else {
            return Ok(None);
        };
        let start = header_len;
        let end = header_len + payload_len;
        let decoded = T::decode_from_slice(&pending[start..end]);

        self.cursor += end;
        self.collapse();
        decoded.map(Some).map_err(|err| WireError::MalformedFrame {
            len: payload_len,
            source: Box::new(err),
        })
    }

    fn collapse(&mut self) {
        debug_assert!(self.cursor <= self.buf.len());
        if self.cursor == self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.drain(..self.cursor);
        }
        self.cursor = 0;
    }
}
