//! Wire framing for relay traffic.
//!
//! Every binary message between wrapper, relay and viewers carries a sequence
//! of frames:
//!
//! ```text
//! [u8 type] [u32 BE payload length] [payload bytes]
//! ```
//!
//! Frame types: `0` OUTPUT (raw terminal bytes, upstream → viewers),
//! `1` INPUT (raw keystrokes, viewer → upstream), `2` RESIZE (payload is
//! `[u16 BE rows][u16 BE cols]`). The type values are part of the wire
//! contract shared with browser viewers.
//!
//! A WebSocket/TCP read may contain a fraction of a frame or several frames
//! back to back; [`FrameBuffer`] reassembles them and leaves partial trailing
//! bytes buffered for the next read.

use bytes::{Buf, Bytes, BytesMut};

/// Raw terminal output from the PTY.
pub const FRAME_TYPE_OUTPUT: u8 = 0;
/// Raw keystrokes destined for the PTY.
pub const FRAME_TYPE_INPUT: u8 = 1;
/// Window size change; payload is `[u16 BE rows][u16 BE cols]`.
pub const FRAME_TYPE_RESIZE: u8 = 2;

/// Type byte plus u32 length prefix.
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum accepted payload length for a single frame (16 MiB).
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A malformed incoming byte stream.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Declared payload length exceeds [`MAX_FRAME_LEN`].
    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(u32),
}

/// Serialize a frame with the type + length header.
pub fn pack_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.push(frame_type);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a RESIZE payload (`rows` first, matching the wire contract).
pub fn encode_resize(rows: u16, cols: u16) -> [u8; 4] {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&rows.to_be_bytes());
    payload[2..].copy_from_slice(&cols.to_be_bytes());
    payload
}

/// Decode a RESIZE payload into `(rows, cols)`.
///
/// Returns `None` unless the payload is exactly four bytes; callers skip
/// malformed resizes rather than tearing the connection down.
pub fn decode_resize(payload: &[u8]) -> Option<(u16, u16)> {
    if payload.len() != 4 {
        return None;
    }
    let rows = u16::from_be_bytes([payload[0], payload[1]]);
    let cols = u16::from_be_bytes([payload[2], payload[3]]);
    Some((rows, cols))
}

/// Incremental frame decoder over a byte stream.
///
/// Feed reads via [`FrameBuffer::extend`] and pop complete frames with
/// [`FrameBuffer::next_frame`]. Unknown type bytes are yielded as-is so the
/// endpoint can log and skip them.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, or `None` while only a partial frame is
    /// buffered.
    pub fn next_frame(&mut self) -> Result<Option<(u8, Bytes)>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let frame_type = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(len));
        }
        let total = FRAME_HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some((frame_type, frame.freeze())))
    }

    /// True if bytes of an incomplete frame remain buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut FrameBuffer) -> Vec<(u8, Bytes)> {
        let mut frames = Vec::new();
        while let Some(frame) = buf.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_round_trip_single_frame() {
        let mut buf = FrameBuffer::new();
        buf.extend(&pack_frame(FRAME_TYPE_OUTPUT, b"hello\r\n"));
        let frames = drain(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, FRAME_TYPE_OUTPUT);
        assert_eq!(&frames[0].1[..], b"hello\r\n");
        assert!(!buf.has_partial());
    }

    #[test]
    fn test_two_packed_frames_yield_in_order() {
        let mut wire = pack_frame(FRAME_TYPE_OUTPUT, b"first");
        wire.extend_from_slice(&pack_frame(FRAME_TYPE_INPUT, b"second"));
        let mut buf = FrameBuffer::new();
        buf.extend(&wire);
        let frames = drain(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].0, &frames[0].1[..]), (FRAME_TYPE_OUTPUT, &b"first"[..]));
        assert_eq!((frames[1].0, &frames[1].1[..]), (FRAME_TYPE_INPUT, &b"second"[..]));
    }

    #[test]
    fn test_partial_frame_stays_buffered() {
        let wire = pack_frame(FRAME_TYPE_OUTPUT, b"split me");
        let mid = wire.len() / 2;
        let mut buf = FrameBuffer::new();
        buf.extend(&wire[..mid]);
        assert_eq!(buf.next_frame().unwrap(), None);
        assert!(buf.has_partial());
        buf.extend(&wire[mid..]);
        let frames = drain(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].1[..], b"split me");
        assert!(!buf.has_partial());
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let wire = pack_frame(FRAME_TYPE_INPUT, b"x");
        let mut buf = FrameBuffer::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.extend(&[*byte]);
            let frame = buf.next_frame().unwrap();
            if i < wire.len() - 1 {
                assert!(frame.is_none());
            } else {
                let (ty, payload) = frame.unwrap();
                assert_eq!(ty, FRAME_TYPE_INPUT);
                assert_eq!(&payload[..], b"x");
            }
        }
    }

    #[test]
    fn test_empty_payload_round_trips() {
        let mut buf = FrameBuffer::new();
        buf.extend(&pack_frame(FRAME_TYPE_OUTPUT, b""));
        let frames = drain(&mut buf);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].1.is_empty());
    }

    #[test]
    fn test_unknown_type_is_yielded_not_rejected() {
        let mut buf = FrameBuffer::new();
        buf.extend(&pack_frame(0x7f, b"future"));
        let frames = drain(&mut buf);
        assert_eq!(frames[0].0, 0x7f);
        assert_eq!(&frames[0].1[..], b"future");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = vec![FRAME_TYPE_OUTPUT];
        header.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut buf = FrameBuffer::new();
        buf.extend(&header);
        assert_eq!(buf.next_frame(), Err(FrameError::Oversized(MAX_FRAME_LEN + 1)));
    }

    #[test]
    fn test_resize_payload_round_trip() {
        let payload = encode_resize(30, 120);
        assert_eq!(decode_resize(&payload), Some((30, 120)));
    }

    #[test]
    fn test_resize_payload_wrong_length_is_none() {
        assert_eq!(decode_resize(b"abc"), None);
        assert_eq!(decode_resize(b"abcde"), None);
        assert_eq!(decode_resize(b""), None);
    }

    #[test]
    fn test_binary_payload_survives() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut buf = FrameBuffer::new();
        buf.extend(&pack_frame(FRAME_TYPE_OUTPUT, &data));
        let frames = drain(&mut buf);
        assert_eq!(&frames[0].1[..], &data[..]);
    }
}
