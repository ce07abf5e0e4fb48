use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;

/// Length prefix size: 4-byte big-endian unsigned.
pub const PREFIX_LEN: usize = 4;

/// Frames larger than this are treated as a protocol violation.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Encode one length-prefixed frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    let mut prefix = [0u8; PREFIX_LEN];
    BigEndian::write_u32(&mut prefix, payload.len() as u32);
    out.extend_from_slice(&prefix);
    out.extend_from_slice(payload);
    out
}

/// Incremental decoder for length-prefixed frames: feed arbitrary chunks,
/// pop complete payloads.
pub struct FrameDecoder {
    buffer: BytesMut,
    pending: Option<usize>,
    max_frame: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        Self::with_max_frame(DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(max_frame: usize) -> FrameDecoder {
        FrameDecoder { buffer: BytesMut::new(), pending: None, max_frame }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, Error> {
        if self.pending.is_none() && self.buffer.len() >= PREFIX_LEN {
            let len = BigEndian::read_u32(&self.buffer[..PREFIX_LEN]) as usize;
            if len > self.max_frame {
                return Err(Error::Decode(format!(
                    "frame of {} bytes exceeds limit of {}",
                    len, self.max_frame
                )));
            }
            self.buffer.advance(PREFIX_LEN);
            self.pending = Some(len);
        }
        if let Some(len) = self.pending {
            if self.buffer.len() >= len {
                self.pending = None;
                return Ok(Some(self.buffer.split_to(len).freeze()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_arbitrary_fragmentation() {
        let encoded = [frame(b"hello"), frame(b""), frame(b"world")].concat();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in encoded {
            decoder.feed(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![&b"hello"[..], &b""[..], &b"world"[..]]);
    }

    #[test]
    fn coalesced_frames_decode_one_at_a_time() {
        let encoded = [frame(b"one"), frame(b"two")].concat();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(decoder.next_frame().unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::with_max_frame(8);
        decoder.feed(&frame(&[0u8; 9]));
        assert!(matches!(decoder.next_frame(), Err(Error::Decode(_))));
    }
}
