//! Purpose: Split the raw input byte stream into newline-delimited text frames.
//! Exports: `LineFramer`, `FrameError`, `DEFAULT_MAX_FRAME_BYTES`.
//! Role: Lowest layer of the stdio transport; no JSON awareness.
//! Invariants: Frames split across reads are reassembled; several frames per read are all yielded.
//! Invariants: Buffering is bounded by `max_frame_bytes`; oversized lines are discarded whole.
//! Invariants: Blank lines are skipped; a trailing `\r` is stripped.

use bytes::BytesMut;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    TooLong { len: usize },
    /// `lossy` is the frame with invalid sequences replaced, kept so an id can still be recovered.
    InvalidUtf8 { lossy: String },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooLong { len } => write!(f, "frame of {len} bytes exceeds limit"),
            FrameError::InvalidUtf8 { .. } => f.write_str("frame is not valid UTF-8"),
        }
    }
}

#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
    max_frame_bytes: usize,
    // Bytes already searched for a newline, so each byte is scanned once.
    scanned: usize,
    // Length of an oversized line being skipped, if any.
    discarding: Option<usize>,
}

impl LineFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes: max_frame_bytes.max(1),
            scanned: 0,
            discarding: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let newline = self.buf[self.scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
                .map(|pos| pos + self.scanned);

            let Some(pos) = newline else {
                if let Some(len) = self.discarding.as_mut() {
                    *len += self.buf.len();
                    self.buf.clear();
                    self.scanned = 0;
                } else if self.buf.len() > self.max_frame_bytes {
                    self.discarding = Some(self.buf.len());
                    self.buf.clear();
                    self.scanned = 0;
                } else {
                    self.scanned = self.buf.len();
                }
                return None;
            };

            let line = self.buf.split_to(pos + 1);
            self.scanned = 0;

            if let Some(len) = self.discarding.take() {
                return Some(Err(FrameError::TooLong {
                    len: len + line.len() - 1,
                }));
            }
            if line.len() - 1 > self.max_frame_bytes {
                return Some(Err(FrameError::TooLong { len: line.len() - 1 }));
            }

            match decode_line(&line[..line.len() - 1]) {
                Some(result) => return Some(result),
                None => continue,
            }
        }
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<String, FrameError>> {
        if let Some(len) = self.discarding.take() {
            let len = len + self.buf.len();
            self.buf.clear();
            return Some(Err(FrameError::TooLong { len }));
        }
        let rest = self.buf.split();
        self.scanned = 0;
        if rest.len() > self.max_frame_bytes {
            return Some(Err(FrameError::TooLong { len: rest.len() }));
        }
        decode_line(&rest)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<String, FrameError>> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(
        std::str::from_utf8(raw)
            .map(ToString::to_string)
            .map_err(|_| FrameError::InvalidUtf8 {
                lossy: String::from_utf8_lossy(raw).into_owned(),
            }),
    )
}
