//! Line framing codec.
//!
//! Every unit on the wire is a single line: a one-character tag, a UTF-8
//! payload and a terminating `\n`.
//!
//! | tag | payload                                     |
//! |-----|---------------------------------------------|
//! | `I` | JSON `{"name": .., "supportedMethods": [..]}` |
//! | `Q` | JSON-RPC request envelope                   |
//! | `S` | JSON-RPC response envelope                  |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag of an interface announcement frame.
pub const TAG_INTERFACE: char = 'I';
/// Tag of a request frame.
pub const TAG_REQUEST: char = 'Q';
/// Tag of a response frame.
pub const TAG_RESPONSE: char = 'S';

/// Maximum single frame size (16 MB), terminator excluded.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A peer's declaration of its name and the methods it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Peer name; peers sharing a name share a balancer group.
    pub name: String,
    /// Method names the peer can execute.
    pub supported_methods: Vec<String>,
}

impl Interface {
    /// Build an announcement.
    pub fn new(name: impl Into<String>, supported_methods: Vec<String>) -> Self {
        Self {
            name: name.into(),
            supported_methods,
        }
    }
}

/// Codec errors. All of them are protocol violations from the peer's side
/// except [`FrameError::EmbeddedNewline`], which is a local encoding bug.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag {0:?}")]
    UnknownTag(char),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed interface announcement: {0}")]
    Interface(#[from] serde_json::Error),
    #[error("payload contains a raw newline")]
    EmbeddedNewline,
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// One decoded wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `I`: interface announcement.
    Interface(Interface),
    /// `Q`: request envelope string.
    Request(String),
    /// `S`: response envelope string.
    Response(String),
}

impl Frame {
    /// The frame's wire tag.
    pub fn tag(&self) -> char {
        match self {
            Frame::Interface(_) => TAG_INTERFACE,
            Frame::Request(_) => TAG_REQUEST,
            Frame::Response(_) => TAG_RESPONSE,
        }
    }

    /// Payload text without tag or terminator.
    pub fn payload(&self) -> Result<String, FrameError> {
        let payload = match self {
            Frame::Interface(iface) => serde_json::to_string(iface)?,
            Frame::Request(s) | Frame::Response(s) => s.clone(),
        };
        if payload.contains('\n') {
            return Err(FrameError::EmbeddedNewline);
        }
        Ok(payload)
    }

    /// Encode to `tag + payload + "\n"`, ready for a single write.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let payload = self.payload()?;
        let mut bytes = Vec::with_capacity(payload.len() + 2);
        let mut tag = [0u8; 4];
        bytes.extend_from_slice(self.tag().encode_utf8(&mut tag).as_bytes());
        bytes.extend_from_slice(payload.as_bytes());
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Build a frame from an already-split tag and payload.
    pub fn from_parts(tag: char, payload: &str) -> Result<Self, FrameError> {
        match tag {
            TAG_INTERFACE => Ok(Frame::Interface(serde_json::from_str(payload)?)),
            TAG_REQUEST => Ok(Frame::Request(payload.to_string())),
            TAG_RESPONSE => Ok(Frame::Response(payload.to_string())),
            other => Err(FrameError::UnknownTag(other)),
        }
    }

    /// Decode one line (terminator already stripped).
    pub fn decode_line(line: &str) -> Result<Self, FrameError> {
        let mut chars = line.chars();
        let tag = chars.next().ok_or(FrameError::Empty)?;
        Self::from_parts(tag, chars.as_str())
    }
}

/// Incremental decoder: feed arbitrary byte chunks, pull complete frames.
///
/// Bytes are buffered raw and split on `0x0A`, which never occurs inside a
/// multi-byte UTF-8 sequence, so chunk boundaries may fall anywhere.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Offset up to which `buf` is known to contain no newline.
    scanned: usize,
    /// Dropping the remainder of an oversized line up to its newline.
    discarding: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the carrier.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet terminated.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if one is buffered.
    ///
    /// A line longer than [`MAX_FRAME_SIZE`] yields [`FrameError::TooLarge`]
    /// once; the rest of that line, up to and including its newline, is
    /// dropped so it can never surface as a frame of its own.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.discarding {
            match self.buf.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    self.buf.drain(..=end);
                    self.discarding = false;
                }
                None => {
                    self.buf.clear();
                    self.scanned = 0;
                    return None;
                }
            }
        }

        let newline = self.buf[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|i| i + self.scanned);

        let Some(end) = newline else {
            self.scanned = self.buf.len();
            if self.buf.len() > MAX_FRAME_SIZE {
                let size = self.buf.len();
                self.buf.clear();
                self.scanned = 0;
                self.discarding = true;
                return Some(Err(FrameError::TooLarge {
                    size,
                    max: MAX_FRAME_SIZE,
                }));
            }
            return None;
        };

        let line: Vec<u8> = self.buf.drain(..=end).take(end).collect();
        self.scanned = 0;

        if line.len() > MAX_FRAME_SIZE {
            return Some(Err(FrameError::TooLarge {
                size: line.len(),
                max: MAX_FRAME_SIZE,
            }));
        }

        Some(match String::from_utf8(line) {
            Ok(text) => Frame::decode_line(&text),
            Err(_) => Err(FrameError::InvalidUtf8),
        })
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Vec<Result<Frame, FrameError>> {
        self.feed(chunk);
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            out.push(frame);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder, chunk: &[u8]) -> Vec<Frame> {
        decoder
            .decode_chunk(chunk)
            .into_iter()
            .map(|f| f.unwrap())
            .collect()
    }

    #[test]
    fn test_interface_roundtrip() {
        let frame = Frame::Interface(Interface::new("w1", vec!["add".to_string()]));
        let bytes = frame.encode().unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            "I{\"name\":\"w1\",\"supportedMethods\":[\"add\"]}\n"
        );

        let mut decoder = FrameDecoder::new();
        assert_eq!(decode_all(&mut decoder, &bytes), vec![frame]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_request_response_bytes_preserved() {
        let payload = r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":["héllo \"q\" \\n"]}"#;
        for frame in [
            Frame::Request(payload.to_string()),
            Frame::Response(payload.to_string()),
        ] {
            let bytes = frame.encode().unwrap();
            assert_eq!(&bytes[1..bytes.len() - 1], payload.as_bytes());
            let mut decoder = FrameDecoder::new();
            assert_eq!(decode_all(&mut decoder, &bytes), vec![frame]);
        }
    }

    #[test]
    fn test_split_at_every_offset() {
        let first = Frame::Request("{\"method\":\"grüße\",\"params\":[\"日本\"]}".to_string());
        let second = Frame::Interface(Interface::new("wörker", vec!["ping".to_string()]));
        let mut bytes = first.encode().unwrap();
        bytes.extend(second.encode().unwrap());

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decode_all(&mut decoder, &bytes[..split]);
            frames.extend(decode_all(&mut decoder, &bytes[split..]));
            assert_eq!(frames, vec![first.clone(), second.clone()], "split at {split}");
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let frame = Frame::Response("{\"result\":\"ok\"}".to_string());
        let bytes = frame.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for b in &bytes {
            frames.extend(decode_all(&mut decoder, std::slice::from_ref(b)));
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.decode_chunk(b"Xwhatever\nQ{}\n");
        assert!(matches!(results[0], Err(FrameError::UnknownTag('X'))));
        assert_eq!(results[1].as_ref().unwrap(), &Frame::Request("{}".to_string()));
    }

    #[test]
    fn test_empty_line_and_bad_interface() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.decode_chunk(b"\nI{not json}\n");
        assert!(matches!(results[0], Err(FrameError::Empty)));
        assert!(matches!(results[1], Err(FrameError::Interface(_))));
    }

    #[test]
    fn test_invalid_utf8_line() {
        let mut decoder = FrameDecoder::new();
        let results = decoder.decode_chunk(b"Q\xff\xfe\n");
        assert!(matches!(results[0], Err(FrameError::InvalidUtf8)));
    }

    #[test]
    fn test_embedded_newline_rejected() {
        let frame = Frame::Request("line one\nline two".to_string());
        assert!(matches!(frame.encode(), Err(FrameError::EmbeddedNewline)));
    }

    #[test]
    fn test_oversized_partial_line() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&vec![b'Q'; MAX_FRAME_SIZE + 1]);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(FrameError::TooLarge { .. }))
        ));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_oversized_line_tail_is_dropped() {
        let mut decoder = FrameDecoder::new();
        let head = decoder.decode_chunk(&vec![b'Q'; MAX_FRAME_SIZE + 2]);
        assert_eq!(head.len(), 1);
        assert!(matches!(head[0], Err(FrameError::TooLarge { .. })));

        // More of the same line, still unterminated.
        assert!(decoder.decode_chunk(b"S{\"partial\":").is_empty());
        assert_eq!(decoder.pending(), 0);

        // The tail looks like a response but belongs to the oversized line.
        let tail = decoder.decode_chunk(b"S{\"jsonrpc\":\"2.0\",\"result\":42,\"id\":1}\n");
        assert!(tail.is_empty(), "tail of oversized line decoded: {tail:?}");

        // Framing resumes with the next line.
        assert_eq!(
            decode_all(&mut decoder, b"S\"ok\"\n"),
            vec![Frame::Response("\"ok\"".to_string())]
        );
    }
}
