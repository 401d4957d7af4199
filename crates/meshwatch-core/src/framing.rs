//! Meshtastic serial stream framing.
//!
//! Every protobuf exchanged over the serial stream API is wrapped as
//! `START1 START2 len_hi len_lo payload`, where the length is the big-endian
//! payload size in `1..=MAX_PAYLOAD_LEN`. Incremental extraction from a byte
//! stream lives in the link crate; this module handles single frames.

use crate::constants::{HEADER_LEN, MAX_PAYLOAD_LEN, START1, START2};
use crate::error::FramingError;

/// Wrap a payload in a stream frame header.
pub fn stream_frame(payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.is_empty() {
        return Err(FramingError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[START1, START2]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Extract the payload from exactly one complete frame.
///
/// Trailing bytes past the declared length are ignored.
pub fn stream_unframe(data: &[u8]) -> Result<&[u8], FramingError> {
    if data.len() < HEADER_LEN || data[0] != START1 || data[1] != START2 {
        return Err(FramingError::MissingHeader);
    }
    let declared = declared_len(data[2], data[3]);
    if declared == 0 {
        return Err(FramingError::EmptyPayload);
    }
    if declared > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge {
            len: declared,
            max: MAX_PAYLOAD_LEN,
        });
    }
    let body = &data[HEADER_LEN..];
    if body.len() < declared {
        return Err(FramingError::Truncated {
            declared,
            actual: body.len(),
        });
    }
    Ok(&body[..declared])
}

/// Payload length encoded in the two header length bytes.
fn declared_len(hi: u8, lo: u8) -> usize {
    usize::from(u16::from_be_bytes([hi, lo]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let framed = stream_frame(&[0x0A, 0x0B, 0x0C]).unwrap();
        assert_eq!(framed, vec![0x94, 0xC3, 0x00, 0x03, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn frame_length_is_big_endian() {
        let payload = vec![0x55; 300];
        let framed = stream_frame(&payload).unwrap();
        assert_eq!(&framed[2..4], &[0x01, 0x2C]);
        assert_eq!(stream_unframe(&framed).unwrap(), payload.as_slice());
    }

    #[test]
    fn rejects_empty_and_oversized() {
        assert_eq!(stream_frame(&[]), Err(FramingError::EmptyPayload));
        assert!(matches!(
            stream_frame(&vec![0u8; MAX_PAYLOAD_LEN + 1]),
            Err(FramingError::PayloadTooLarge { len: 513, .. })
        ));
        assert!(stream_frame(&vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
    }

    #[test]
    fn unframe_errors() {
        assert_eq!(stream_unframe(&[0x94]), Err(FramingError::MissingHeader));
        assert_eq!(
            stream_unframe(&[0x00, 0xC3, 0x00, 0x01, 0x00]),
            Err(FramingError::MissingHeader)
        );
        assert_eq!(
            stream_unframe(&[0x94, 0xC3, 0x00, 0x04, 0x01]),
            Err(FramingError::Truncated {
                declared: 4,
                actual: 1
            })
        );
        assert_eq!(
            stream_unframe(&[0x94, 0xC3, 0x00, 0x00]),
            Err(FramingError::EmptyPayload)
        );
    }

    #[test]
    fn unframe_ignores_trailing_bytes() {
        let mut framed = stream_frame(b"abc").unwrap();
        framed.extend_from_slice(b"trailing");
        assert_eq!(stream_unframe(&framed).unwrap(), b"abc");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn header_declares_payload_len(payload in proptest::collection::vec(any::<u8>(), 1..=MAX_PAYLOAD_LEN)) {
            let framed = stream_frame(&payload).unwrap();
            prop_assert_eq!(framed.len(), HEADER_LEN + payload.len());
            prop_assert_eq!(declared_len(framed[2], framed[3]), payload.len());
            prop_assert_eq!(stream_unframe(&framed).unwrap(), payload.as_slice());
        }
    }
}
