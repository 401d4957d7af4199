//! Streaming extraction of Meshtastic frames from serial bytes.
//!
//! The radio interleaves framed protobufs with plain-text debug console
//! output on the same port. The accumulator pulls out complete frames and
//! sets everything else aside as console text.

use meshwatch_core::constants::{HEADER_LEN, MAX_PAYLOAD_LEN, START1, START2};
use meshwatch_core::FramingError;
use meshwatch_core::framing::stream_unframe;

/// Stateful buffer that turns a byte stream into frame payloads.
///
/// - Bytes before a `START1 START2` header are console output.
/// - A header that declares a zero or oversized length is treated as
///   console output and scanning resumes at the next byte.
/// - A partial frame is kept until the rest arrives.
pub struct StreamFrameAccumulator {
    buffer: Vec<u8>,
    console: Vec<u8>,
}

impl StreamFrameAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD_LEN),
            console: Vec::new(),
        }
    }

    /// Feed bytes read from the port and return every complete payload.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match self.buffer.iter().position(|&b| b == START1) {
                Some(0) => {}
                Some(pos) => {
                    self.console.extend(self.buffer.drain(..pos));
                }
                None => {
                    self.console.append(&mut self.buffer);
                    break;
                }
            }

            if self.buffer.len() < 2 {
                break;
            }
            if self.buffer[1] != START2 {
                self.skip_one();
                continue;
            }
            match stream_unframe(&self.buffer) {
                Ok(payload) => {
                    let consumed = HEADER_LEN + payload.len();
                    frames.push(payload.to_vec());
                    self.buffer.drain(..consumed);
                }
                Err(FramingError::EmptyPayload | FramingError::PayloadTooLarge { .. }) => {
                    self.skip_one();
                }
                // Short header or partial body: wait for more bytes.
                Err(FramingError::MissingHeader | FramingError::Truncated { .. }) => break,
            }
        }

        frames
    }

    /// Take console text collected so far, if any.
    pub fn take_console(&mut self) -> Option<String> {
        if self.console.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.console).into_owned();
        self.console.clear();
        Some(text)
    }

    /// Bytes held while waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn skip_one(&mut self) {
        self.console.push(self.buffer.remove(0));
    }
}

impl Default for StreamFrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwatch_core::framing::stream_frame;

    #[test]
    fn single_complete_frame() {
        let mut acc = StreamFrameAccumulator::new();
        let frames = acc.feed(&stream_frame(b"hello").unwrap());
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.take_console(), None);
    }

    #[test]
    fn frame_split_across_reads() {
        let mut acc = StreamFrameAccumulator::new();
        let framed = stream_frame(&[0x11; 40]).unwrap();
        assert!(acc.feed(&framed[..3]).is_empty());
        assert!(acc.feed(&framed[3..20]).is_empty());
        let frames = acc.feed(&framed[20..]);
        assert_eq!(frames, vec![vec![0x11; 40]]);
    }

    #[test]
    fn console_text_around_frames() {
        let mut acc = StreamFrameAccumulator::new();
        let mut data = b"INFO | boot\n".to_vec();
        data.extend(stream_frame(b"one").unwrap());
        data.extend(b"DEBUG | tick\n");
        data.extend(stream_frame(b"two").unwrap());

        let frames = acc.feed(&data);
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(
            acc.take_console().as_deref(),
            Some("INFO | boot\nDEBUG | tick\n")
        );
        assert_eq!(acc.take_console(), None);
    }

    #[test]
    fn resyncs_after_bad_header() {
        let mut acc = StreamFrameAccumulator::new();
        // START1 followed by a non-START2 byte, then a zero-length header.
        let mut data = vec![START1, 0x41, START1, START2, 0x00, 0x00];
        data.extend(stream_frame(b"ok").unwrap());
        assert_eq!(acc.feed(&data), vec![b"ok".to_vec()]);
    }

    #[test]
    fn oversized_length_is_skipped() {
        let mut acc = StreamFrameAccumulator::new();
        let mut data = vec![START1, START2, 0x7F, 0xFF];
        data.extend(stream_frame(b"next").unwrap());
        assert_eq!(acc.feed(&data), vec![b"next".to_vec()]);
    }

    #[test]
    fn lone_start_byte_is_retained() {
        let mut acc = StreamFrameAccumulator::new();
        assert!(acc.feed(&[START1]).is_empty());
        assert_eq!(acc.pending(), 1);
        let framed = stream_frame(b"x").unwrap();
        assert_eq!(acc.feed(&framed[1..]), vec![b"x".to_vec()]);
    }
}
