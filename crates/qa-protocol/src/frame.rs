//! Length-prefixed JSON frame codec.
//!
//! One frame on the wire is `[length, body]` in compact JSON followed by
//! `\r\n\r\n`, where `length` is the total byte count of the frame
//! *including* the length digits themselves and the trailing delimiter.
//! Because the digit count of `length` feeds back into the byte count, the
//! encoder finds the value by fixed-point iteration.
//!
//! Decoding works against a growing byte buffer fed by a socket in arbitrary
//! chunk sizes; [`FrameDecoder::next_frame`] yields `Ok(None)` until a full
//! frame is buffered. Every error is fatal for the connection that produced
//! the bytes.

use serde_json::{Value, json};
use thiserror::Error;

/// Frame trailer; its four bytes are counted by the length header.
pub const DELIMITER: &[u8] = b"\r\n\r\n";

/// The last six bytes of every well-formed frame: the body's closing brace,
/// the outer list's closing bracket, and the delimiter.
const TRAILER: &[u8] = b"}]\r\n\r\n";

/// The fixed point is reached in two or three rounds; anything near this cap
/// means the arithmetic is wrong.
const FIXPOINT_CAP: usize = 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing length header: {0:?}")]
    MissingLengthHeader(String),
    #[error("invalid length header: {0:?}")]
    InvalidLengthHeader(String),
    #[error("missing message delimiter: {0:?}")]
    MissingMessageDelimiter(String),
    #[error("invalid message delimiter: {0:?}")]
    InvalidMessageDelimiter(String),
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("frame failed to parse as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a [length, body] pair")]
    NotAFrame,
}

/// Compute the self-referential length for `body`.
///
/// Serialized compactly, `[L, body]` is `1 + digits(L) + 1 + |body| + 1`
/// bytes plus the delimiter. Iterating that map from the un-prefixed length
/// converges because appending a digit grows the total by at most one byte.
fn fixed_point_length(body_len: usize) -> usize {
    let mut length = body_len + DELIMITER.len();
    for _ in 0..FIXPOINT_CAP {
        let framed = body_len + 3 + decimal_digits(length) + DELIMITER.len();
        if framed == length {
            return length;
        }
        length = framed;
    }
    debug_assert!(false, "frame length failed to stabilize at {length}");
    length
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Encode a frame body into its on-wire bytes.
pub fn encode(body: &Value) -> Vec<u8> {
    let body_len = body.to_string().len();
    let length = fixed_point_length(body_len);
    let mut bytes =
        serde_json::to_vec(&json!([length, body])).expect("JSON values always serialize");
    debug_assert_eq!(bytes.len() + DELIMITER.len(), length);
    bytes.extend_from_slice(DELIMITER);
    bytes
}

/// Streaming decoder over a growing byte buffer.
///
/// Feed socket reads in with [`extend`](FrameDecoder::extend), then call
/// [`next_frame`](FrameDecoder::next_frame) until it reports `Ok(None)`
/// (more bytes needed). Decoded frames are consumed from the front of the
/// buffer; the remainder is the next frame's prefix.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The undecoded tail, for logging offending bytes after an error.
    pub fn remaining(&self) -> &[u8] {
        &self.buf
    }

    /// Try to decode one frame from the front of the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        let Some(length) = self.parse_length_header()? else {
            return Ok(None);
        };
        if self.buf.len() < length {
            return Ok(None);
        }

        let frame = &self.buf[..length];
        check_trailer(frame)?;
        let text = std::str::from_utf8(frame)?;
        let mut parsed: Value = serde_json::from_str(text)?;
        let body = match &mut parsed {
            Value::Array(items)
                if items.len() == 2 && items[0].is_u64() && items[1].is_object() =>
            {
                items[1].take()
            }
            _ => return Err(FrameError::NotAFrame),
        };

        self.buf.drain(..length);
        Ok(Some(body))
    }

    /// Parse the `[<digits>` prefix up to the first comma.
    ///
    /// `Ok(None)` means no comma has arrived yet. The header may contain
    /// whitespace between the bracket and the digits, must end with a digit,
    /// and must encode a positive value.
    fn parse_length_header(&self) -> Result<Option<usize>, FrameError> {
        let Some(comma) = self.buf.iter().position(|&b| b == b',') else {
            return Ok(None);
        };
        let header = &self.buf[..comma];
        let lossy = || String::from_utf8_lossy(header).into_owned();

        if header.first() != Some(&b'[') {
            return Err(FrameError::MissingLengthHeader(lossy()));
        }
        if !header.last().is_some_and(u8::is_ascii_digit) {
            return Err(FrameError::InvalidLengthHeader(lossy()));
        }
        for &byte in header {
            if !matches!(byte, b'[' | b' ' | b'\t' | b'\r' | b'\n') && !byte.is_ascii_digit() {
                return Err(FrameError::InvalidLengthHeader(lossy()));
            }
        }

        let digits: String = header
            .iter()
            .filter(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();
        let length: usize = digits
            .parse()
            .map_err(|_| FrameError::InvalidLengthHeader(lossy()))?;
        if length == 0 {
            return Err(FrameError::InvalidLengthHeader(lossy()));
        }
        Ok(Some(length))
    }
}

/// Verify the last six bytes of a frame slice are `}]\r\n\r\n`.
fn check_trailer(frame: &[u8]) -> Result<(), FrameError> {
    let lossy = || String::from_utf8_lossy(frame).into_owned();
    if frame.len() < TRAILER.len() {
        return Err(FrameError::MissingMessageDelimiter(lossy()));
    }
    let tail = &frame[frame.len() - TRAILER.len()..];
    if tail == TRAILER {
        return Ok(());
    }
    // A brace in the tail means the frame boundary is off (typically by a
    // byte); no brace at all means the delimiter never arrived.
    if tail.contains(&b'}') {
        Err(FrameError::InvalidMessageDelimiter(lossy()))
    } else {
        Err(FrameError::MissingMessageDelimiter(lossy()))
    }
}
