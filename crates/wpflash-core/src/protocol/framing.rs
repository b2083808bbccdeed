//! HDLC-style serial framing for the legacy Qualcomm protocols.
//!
//! Frames are delimited by 0x7E, payload and CRC bytes are escaped
//! with 0x7D / XOR 0x20, and a little-endian CRC-16 (reflected X.25
//! polynomial) over the unstuffed payload trails the data. Sahara and
//! Firehose exchange raw bytes and bypass this layer entirely.

use tracing::trace;

use super::transport::RawTransport;
use super::ProtocolError;
use crate::bytes::crc16_x25;

const FRAME_DELIMITER: u8 = 0x7E;
const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

const READ_CHUNK: usize = 0x1000;
/// Incomplete frames are retried with further reads up to this bound.
const MAX_READ_ATTEMPTS: usize = 16;

/// Decoder outcome internal to this module: `Incomplete` means "read
/// more bytes and retry"; it never escapes to protocol callers.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecodeError {
    Incomplete,
    BadMessage(String),
}

/// Wrap `payload` in a complete frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let crc = crc16_x25(payload);
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FRAME_DELIMITER);
    for &b in payload.iter().chain(crc.to_le_bytes().iter()) {
        if b == FRAME_DELIMITER || b == ESCAPE {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out.push(FRAME_DELIMITER);
    out
}

/// Decode one frame from the front of `buffer`, returning the payload
/// and the number of input bytes consumed.
pub(crate) fn decode(buffer: &[u8]) -> Result<(Vec<u8>, usize), DecodeError> {
    if buffer.is_empty() {
        return Err(DecodeError::Incomplete);
    }
    if buffer[0] != FRAME_DELIMITER {
        return Err(DecodeError::BadMessage(format!(
            "frame does not start with 0x7E (got 0x{:02X})",
            buffer[0]
        )));
    }

    let mut unstuffed = Vec::new();
    let mut i = 1;
    loop {
        let Some(&b) = buffer.get(i) else {
            return Err(DecodeError::Incomplete);
        };
        i += 1;
        match b {
            FRAME_DELIMITER => break,
            ESCAPE => {
                let Some(&next) = buffer.get(i) else {
                    return Err(DecodeError::Incomplete);
                };
                i += 1;
                unstuffed.push(next ^ ESCAPE_XOR);
            }
            _ => unstuffed.push(b),
        }
    }

    if unstuffed.len() < 2 {
        return Err(DecodeError::BadMessage("frame shorter than its CRC".into()));
    }
    let (payload, crc_bytes) = unstuffed.split_at(unstuffed.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16_x25(payload);
    if received != computed {
        return Err(DecodeError::BadMessage(format!(
            "frame CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}"
        )));
    }
    Ok((payload.to_vec(), i))
}

/// A transport wrapped in the framing layer, with partial-read
/// reassembly.
pub struct FramedTransport<T: RawTransport> {
    inner: T,
    pending: Vec<u8>,
}

impl<T: RawTransport> FramedTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode(payload);
        trace!(payload = payload.len(), frame = frame.len(), "Sending frame");
        Ok(self.inner.write(&frame)?)
    }

    /// Receive one complete frame, reading more bytes while the
    /// decoder reports an incomplete buffer.
    pub fn receive(&mut self) -> Result<Vec<u8>, ProtocolError> {
        for _ in 0..MAX_READ_ATTEMPTS {
            match decode(&self.pending) {
                Ok((payload, consumed)) => {
                    self.pending.drain(..consumed);
                    return Ok(payload);
                }
                Err(DecodeError::Incomplete) => {
                    let more = self.inner.read(READ_CHUNK)?;
                    if more.is_empty() {
                        return Err(ProtocolError::BadConnection(
                            "transport closed mid-frame".into(),
                        ));
                    }
                    self.pending.extend_from_slice(&more);
                }
                Err(DecodeError::BadMessage(reason)) => {
                    self.pending.clear();
                    return Err(ProtocolError::BadMessage(reason));
                }
            }
        }
        Err(ProtocolError::BadMessage(
            "frame not completed after repeated reads".into(),
        ))
    }
}

impl<T: RawTransport> FramedTransport<T> {
    pub fn set_timeout(&mut self, timeout: std::time::Duration) {
        self.inner.set_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MockTransport;

    #[test]
    fn test_roundtrip_plain() {
        let payload = b"\x02\x00\x01binary payload";
        let (decoded, consumed) = decode(&encode(payload)).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, encode(payload).len());
    }

    #[test]
    fn test_roundtrip_with_reserved_bytes() {
        for payload in [
            &b"\x7E"[..],
            &b"\x7D"[..],
            &b"\x7E\x7D\x7E\x7D"[..],
            &b"data \x7E with \x7D escapes \x7E\x7E"[..],
            &b""[..],
        ] {
            let (decoded, _) = decode(&encode(payload)).unwrap();
            assert_eq!(decoded, payload, "payload {payload:02X?}");
        }
    }

    #[test]
    fn test_decode_incomplete_then_complete() {
        let frame = encode(b"split frame");
        let (head, tail) = frame.split_at(frame.len() / 2);
        assert_eq!(decode(head).unwrap_err(), DecodeError::Incomplete);

        let mock = MockTransport::new();
        mock.queue_read(head);
        mock.queue_read(tail);
        let mut framed = FramedTransport::new(mock.clone());
        assert_eq!(framed.receive().unwrap(), b"split frame");
    }

    #[test]
    fn test_decode_rejects_corrupt_crc() {
        let mut frame = encode(b"payload");
        let n = frame.len();
        frame[n - 2] ^= 0xFF; // inside CRC (no escapes in this frame)
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::BadMessage(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_delimiter() {
        assert!(matches!(
            decode(b"\x01\x02\x03"),
            Err(DecodeError::BadMessage(_))
        ));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut stream = encode(b"first");
        stream.extend_from_slice(&encode(b"second"));
        let (p1, used) = decode(&stream).unwrap();
        assert_eq!(p1, b"first");
        let (p2, _) = decode(&stream[used..]).unwrap();
        assert_eq!(p2, b"second");
    }
}
