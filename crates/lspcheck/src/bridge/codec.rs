//! Content-Length framed codec for LSP stdio streams.
//!
//! A textual header block (`Key: Value` lines ended by an empty line) carries
//! the byte length of the JSON body that follows. Works over any
//! AsyncRead/AsyncWrite via `FramedRead`/`FramedWrite`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Message;

pub const CONTENT_LENGTH: &str = "Content-Length";

/// Upper bound on a header block still waiting for its terminator.
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("truncated frame body: expected {expected} bytes, got {received}")]
    TruncatedBody { expected: usize, received: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("frame declares an empty body")]
    EmptyBody,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Header fields of one frame, in the order they appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    /// Case-insensitive lookup; the first occurrence wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Body length in bytes. Zero is rejected: every real message has a body.
    pub fn content_length(&self) -> Result<usize, CodecError> {
        let raw = self.get(CONTENT_LENGTH).ok_or_else(|| {
            CodecError::MalformedHeader(format!("missing {CONTENT_LENGTH}"))
        })?;
        let length: usize = raw.parse().map_err(|_| {
            CodecError::MalformedHeader(format!("invalid {CONTENT_LENGTH} value {raw:?}"))
        })?;
        if length == 0 {
            return Err(CodecError::EmptyBody);
        }
        Ok(length)
    }
}

/// Parse a header block (without its terminating empty line).
///
/// Lines without a colon are ignored. Keys and values are trimmed.
pub fn parse_headers(block: &[u8]) -> Result<Headers, CodecError> {
    let text = std::str::from_utf8(block)
        .map_err(|e| CodecError::MalformedHeader(format!("header is not UTF-8: {e}")))?;

    let fields = text
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(Headers { fields })
}

pub fn parse_body(body: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(body).map_err(CodecError::MalformedPayload)
}

/// Append one framed message to `dst`.
pub fn encode_frame(message: &Message, dst: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(message).map_err(CodecError::MalformedPayload)?;
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

    tracing::trace!(
        method = message.label(),
        body_bytes = body.len(),
        "Encoding frame"
    );

    dst.reserve(header.len() + body.len());
    dst.put_slice(header.as_bytes());
    dst.put_slice(&body);
    Ok(())
}

/// Encode a single message into a standalone frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    encode_frame(message, &mut buf)?;
    Ok(buf.to_vec())
}

/// Locate the empty line ending the header block.
///
/// Returns `(header_len, consumed)`: the length of the header lines and the
/// length including the terminator. Accepts both `\r\n` and bare `\n`.
fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    while let Some(offset) = src[pos..].iter().position(|&b| b == b'\n') {
        let line_end = pos + offset;
        if src[pos..line_end].iter().all(u8::is_ascii_whitespace) {
            return Some((pos, line_end + 1));
        }
        pos = line_end + 1;
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body(usize),
}

/// Codec for `Content-Length` framed JSON-RPC messages.
///
/// Keeps the decoded body length between calls so a frame split across many
/// reads is only header-parsed once.
#[derive(Debug)]
pub struct LspCodec {
    state: DecodeState,
}

impl Default for LspCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LspCodec {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
        }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<usize>, CodecError> {
        let Some((header_len, consumed)) = find_header_end(src) else {
            if src.len() > MAX_HEADER_BYTES {
                return Err(CodecError::MalformedHeader(format!(
                    "no header terminator within {MAX_HEADER_BYTES} bytes"
                )));
            }
            return Ok(None);
        };

        let headers = parse_headers(&src[..header_len])?;
        let length = headers.content_length()?;
        src.advance(consumed);
        Ok(Some(length))
    }
}

impl Decoder for LspCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(length) => {
                    self.state = DecodeState::Body(length);
                    length
                }
                None => return Ok(None),
            },
            DecodeState::Body(length) => length,
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length);
        self.state = DecodeState::Head;
        parse_body(&body).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }

        match self.state {
            DecodeState::Body(expected) => Err(CodecError::TruncatedBody {
                expected,
                received: buf.len(),
            }),
            DecodeState::Head if buf.iter().all(u8::is_ascii_whitespace) => {
                buf.clear();
                Ok(None)
            }
            DecodeState::Head => Err(CodecError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ))),
        }
    }
}

impl Encoder<Message> for LspCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}
