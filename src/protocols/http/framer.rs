//! Incremental request framing.
//!
//! The framer owns the connection's receive buffer. Bytes are appended as
//! they arrive; `next_message` hands out each complete request as soon as its
//! last body byte is buffered. A message is split off the front of the buffer
//! without copying, so the echoed bytes are exactly the received bytes.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::parser::{parse_head, ParseError, ParsedHead};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Framing failure. The connection cannot be resynchronized after one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] ParseError),
}

/// Size bounds applied while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest accepted head, terminator included.
    pub max_head_size: usize,
    /// Largest accepted body, `None` for unbounded.
    pub max_body_size: Option<u64>,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_head_size: 64 * 1024,
            max_body_size: None,
        }
    }
}

/// Where the framer stands between two messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No partial message buffered.
    Idle,
    /// Part of a head is buffered.
    ReadingHead,
    /// Head complete, waiting for `remaining` body bytes.
    ReadingBody { remaining: u64 },
}

/// One complete request exactly as received.
#[derive(Debug, Clone)]
pub struct RawMessage {
    bytes: Bytes,
    head_len: usize,
    head: ParsedHead,
}

impl RawMessage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn head(&self) -> &ParsedHead {
        &self.head
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[self.head_len..]
    }

    /// Request line through last body byte.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[derive(Debug)]
enum State {
    /// Searching for the head terminator; `scanned` bytes are known not to
    /// contain it.
    Head { scanned: usize },
    Body(PendingBody),
}

#[derive(Debug)]
struct PendingBody {
    head: ParsedHead,
    head_len: usize,
    body_len: usize,
}

impl PendingBody {
    fn total_len(&self) -> usize {
        self.head_len + self.body_len
    }
}

/// Splits a byte stream into complete requests.
#[derive(Debug)]
pub struct Framer {
    buffer: BytesMut,
    state: State,
    limits: FrameLimits,
}

impl Framer {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::Head { scanned: 0 },
            limits,
        }
    }

    /// Receive buffer, for reads that fill it in place.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Make room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered that do not yet form a complete message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn state(&self) -> ConnectionState {
        match &self.state {
            State::Head { .. } if self.buffer.is_empty() => ConnectionState::Idle,
            State::Head { .. } => ConnectionState::ReadingHead,
            State::Body(pending) => ConnectionState::ReadingBody {
                remaining: pending.total_len().saturating_sub(self.buffer.len()) as u64,
            },
        }
    }

    /// Take the next complete message off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Call repeatedly to drain
    /// pipelined requests.
    pub fn next_message(&mut self) -> Result<Option<RawMessage>, FrameError> {
        let pending = match std::mem::replace(&mut self.state, State::Head { scanned: 0 }) {
            State::Body(pending) => pending,
            State::Head { scanned } => match self.scan_head(scanned)? {
                Some(pending) => pending,
                None => return Ok(None),
            },
        };

        if self.buffer.len() < pending.total_len() {
            self.state = State::Body(pending);
            return Ok(None);
        }

        let bytes = self.buffer.split_to(pending.total_len()).freeze();
        Ok(Some(RawMessage {
            bytes,
            head_len: pending.head_len,
            head: pending.head,
        }))
    }

    fn scan_head(&mut self, scanned: usize) -> Result<Option<PendingBody>, FrameError> {
        let max_head_size = self.limits.max_head_size;

        // The terminator may straddle the previous scan boundary.
        let start = scanned.saturating_sub(HEAD_TERMINATOR.len() - 1);
        let head_len = match find_terminator(&self.buffer[start..]) {
            Some(pos) => start + pos + HEAD_TERMINATOR.len(),
            None => {
                if self.buffer.len() >= max_head_size {
                    return Err(ParseError::HeadTooLarge {
                        limit: max_head_size,
                    }
                    .into());
                }
                self.state = State::Head {
                    scanned: self.buffer.len(),
                };
                return Ok(None);
            }
        };

        if head_len > max_head_size {
            return Err(ParseError::HeadTooLarge {
                limit: max_head_size,
            }
            .into());
        }

        let head = parse_head(&self.buffer[..head_len])?;
        let length = head.content_length()?;
        if let Some(limit) = self.limits.max_body_size {
            if length > limit {
                return Err(ParseError::BodyTooLarge { length, limit }.into());
            }
        }
        let too_large = ParseError::BodyTooLarge {
            length,
            limit: (usize::MAX - head_len) as u64,
        };
        let body_len = usize::try_from(length)
            .ok()
            .filter(|body_len| head_len.checked_add(*body_len).is_some())
            .ok_or(too_large)?;

        Ok(Some(PendingBody {
            head,
            head_len,
            body_len,
        }))
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}
