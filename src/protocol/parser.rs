//! Streaming backend message parser.
//!
//! TCP gives no message-boundary guarantee, so the parser keeps its cursor,
//! partial length and partial body between calls. One parser per connection.

use bytes::{Buf, Bytes, BytesMut};

use super::backend::BackendMessage;
use super::error::FramingError;

/// 1 GiB, the largest field value PostgreSQL will ever send.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// Where the parser is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    NeedType,
    NeedLength,
    NeedBody,
}

/// One complete frame: tag plus body (length field stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: u8,
    pub body: Bytes,
}

/// Resumable frame reassembler.
#[derive(Debug)]
pub struct MessageParser {
    buf: BytesMut,
    state: ParseState,
    tag: u8,
    body_len: usize,
    max_message_size: usize,
    failed: Option<FramingError>,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Frames whose body exceeds `max` are rejected before any allocation.
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            state: ParseState::NeedType,
            tag: 0,
            body_len: 0,
            max_message_size: max,
            failed: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Bytes held for a frame that is not complete yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk and collect every frame it completes, in arrival order.
    ///
    /// After an error the parser is poisoned and keeps returning it. Frames
    /// completed before the error in the same chunk are still returned; the
    /// error then surfaces on the next call or on `finish`.
    pub fn parse(&mut self, chunk: &[u8]) -> Result<Vec<RawMessage>, FramingError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        match self.drain_frames(&mut out) {
            Ok(()) => Ok(out),
            Err(err) => {
                let err = self.fail(err);
                deliver(out, err)
            }
        }
    }

    /// Like `parse`, decoding each frame into a `BackendMessage`.
    ///
    /// A frame that fails to decode poisons the parser. Messages decoded
    /// before it are returned first.
    pub fn parse_backend(&mut self, chunk: &[u8]) -> Result<Vec<BackendMessage>, FramingError> {
        let frames = self.parse(chunk)?;
        let mut out = Vec::with_capacity(frames.len());
        for raw in &frames {
            match BackendMessage::decode(raw) {
                Ok(message) => out.push(message),
                Err(err) => {
                    let err = self.fail(err);
                    return deliver(out, err);
                }
            }
        }
        Ok(out)
    }

    fn drain_frames(&mut self, out: &mut Vec<RawMessage>) -> Result<(), FramingError> {
        loop {
            match self.state {
                ParseState::NeedType => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    self.tag = self.buf.get_u8();
                    self.state = ParseState::NeedLength;
                }
                ParseState::NeedLength => {
                    if self.buf.len() < 4 {
                        return Ok(());
                    }
                    let length = i32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                    if length < 4 {
                        return Err(FramingError::InvalidLength {
                            tag: self.tag,
                            length,
                        });
                    }
                    let body_len = length as usize - 4;
                    if body_len > self.max_message_size {
                        return Err(FramingError::Oversized {
                            tag: self.tag,
                            length: body_len,
                            max: self.max_message_size,
                        });
                    }
                    self.buf.advance(4);
                    self.body_len = body_len;
                    self.state = ParseState::NeedBody;
                }
                ParseState::NeedBody => {
                    if self.buf.len() < self.body_len {
                        self.buf.reserve(self.body_len - self.buf.len());
                        return Ok(());
                    }
                    let body = self.buf.split_to(self.body_len).freeze();
                    out.push(RawMessage {
                        tag: self.tag,
                        body,
                    });
                    self.state = ParseState::NeedType;
                }
            }
        }
    }

    /// Signal end of stream. Partial bytes still buffered are a truncation.
    pub fn finish(&self) -> Result<(), FramingError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        if self.state != ParseState::NeedType || !self.buf.is_empty() {
            return Err(FramingError::Truncated {
                state: self.state,
                buffered: self.buf.len(),
            });
        }
        Ok(())
    }

    fn fail(&mut self, err: FramingError) -> FramingError {
        tracing::warn!(error = %err, "framing error, parser poisoned");
        self.failed = Some(err.clone());
        err
    }
}

/// Hand back what was completed before `err`; the poisoned parser reports
/// `err` on the next call.
fn deliver<T>(out: Vec<T>, err: FramingError) -> Result<Vec<T>, FramingError> {
    if out.is_empty() { Err(err) } else { Ok(out) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::TransactionStatus;

    fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_single_frame() {
        let mut parser = MessageParser::new();
        let msgs = parser.parse(&frame(b'Z', b"I")).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].tag, b'Z');
        assert_eq!(&msgs[0].body[..], b"I");
        assert!(parser.finish().is_ok());
    }

    #[test]
    fn test_multiple_frames_one_chunk() {
        let mut bytes = frame(b'1', b"");
        bytes.extend(frame(b'2', b""));
        bytes.extend(frame(b'C', b"SELECT 1\0"));
        let mut parser = MessageParser::new();
        let tags: Vec<u8> = parser.parse(&bytes).unwrap().iter().map(|m| m.tag).collect();
        assert_eq!(tags, vec![b'1', b'2', b'C']);
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut bytes = frame(b'C', b"INSERT 0 1\0");
        bytes.extend(frame(b'Z', b"T"));
        let mut parser = MessageParser::new();
        let mut out = Vec::new();
        for b in &bytes {
            out.extend(parser.parse(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].body[..], b"INSERT 0 1\0");
        assert_eq!(&out[1].body[..], b"T");
        assert_eq!(parser.state(), ParseState::NeedType);
    }

    #[test]
    fn test_split_inside_length() {
        let bytes = frame(b'D', b"\0\0");
        let mut parser = MessageParser::new();
        assert!(parser.parse(&bytes[..3]).unwrap().is_empty());
        assert_eq!(parser.state(), ParseState::NeedLength);
        let msgs = parser.parse(&bytes[3..]).unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut parser = MessageParser::with_max_message_size(16);
        let mut bytes = vec![b'D'];
        bytes.extend_from_slice(&1000i32.to_be_bytes());
        let err = parser.parse(&bytes).unwrap_err();
        assert_eq!(
            err,
            FramingError::Oversized {
                tag: b'D',
                length: 996,
                max: 16
            }
        );
        // poisoned
        assert_eq!(parser.parse(b"").unwrap_err(), err);
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut parser = MessageParser::new();
        let err = parser.parse(&[b'Z', 0, 0, 0, 3]).unwrap_err();
        assert_eq!(err, FramingError::InvalidLength { tag: b'Z', length: 3 });
    }

    #[test]
    fn test_truncated_at_end_of_stream() {
        let bytes = frame(b'C', b"SELECT 1\0");
        let mut parser = MessageParser::new();
        parser.parse(&bytes[..7]).unwrap();
        assert_eq!(
            parser.finish(),
            Err(FramingError::Truncated {
                state: ParseState::NeedBody,
                buffered: 2
            })
        );
    }

    #[test]
    fn test_dangling_tag_is_truncation() {
        let mut parser = MessageParser::new();
        parser.parse(b"Z").unwrap();
        assert!(matches!(
            parser.finish(),
            Err(FramingError::Truncated {
                state: ParseState::NeedLength,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_frame_keeps_earlier_frames() {
        let mut bytes = frame(b'Z', b"I");
        bytes.extend_from_slice(&[b'Z', 0, 0, 0, 2]);
        bytes.extend(frame(b'Z', b"T"));
        let mut parser = MessageParser::new();

        let msgs = parser.parse(&bytes).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].body[..], b"I");

        let err = FramingError::InvalidLength { tag: b'Z', length: 2 };
        assert_eq!(parser.parse(b"").unwrap_err(), err);
        assert_eq!(parser.finish(), Err(err));
    }

    #[test]
    fn test_undecodable_frame_poisons_in_order() {
        let mut bytes = frame(b'Z', b"I");
        bytes.extend(frame(b'Z', b"Q"));
        bytes.extend(frame(b'Z', b"T"));
        let mut parser = MessageParser::new();

        let msgs = parser.parse_backend(&bytes).unwrap();
        assert_eq!(
            msgs,
            vec![BackendMessage::ReadyForQuery(TransactionStatus::Idle)]
        );

        let err = parser.parse_backend(&frame(b'Z', b"I")).unwrap_err();
        assert!(matches!(err, FramingError::Malformed { tag: b'Z', .. }), "{err:?}");
        assert_eq!(parser.finish(), Err(err));
    }

    #[test]
    fn test_undecodable_first_frame_errors_immediately() {
        let mut parser = MessageParser::new();
        let err = parser.parse_backend(&frame(b'Z', b"Q")).unwrap_err();
        assert!(matches!(err, FramingError::Malformed { tag: b'Z', .. }));
        assert_eq!(parser.parse_backend(b"").unwrap_err(), err);
    }

    #[test]
    fn test_parse_backend_decodes() {
        let mut parser = MessageParser::new();
        let msgs = parser.parse_backend(&frame(b'Z', b"I")).unwrap();
        assert!(matches!(msgs[0], BackendMessage::ReadyForQuery(_)));
    }
}
