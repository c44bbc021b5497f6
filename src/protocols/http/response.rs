//! Echo responses and the per-connection outbound queue.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes};

use super::framer::RawMessage;

/// Format the head of an echo response carrying `length` body bytes.
pub fn response_header(length: usize) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 200 Ok\r\nContent-Length: {length}\r\nContent-Type: text/plain\r\n\r\n"
    ))
}

/// Responses waiting to be written, oldest first.
///
/// Each echo is queued as two chunks: the formatted head and the request
/// bytes themselves, shared with the receive buffer rather than copied.
/// Implements [`Buf`] so writers can drain it with vectored writes.
#[derive(Debug, Default)]
pub struct ResponseQueue {
    chunks: VecDeque<Bytes>,
    remaining: usize,
    queued: u64,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the echo of `message`.
    pub fn push_echo(&mut self, message: RawMessage) {
        let body = message.into_bytes();
        self.push_chunk(response_header(body.len()));
        self.push_chunk(body);
        self.queued += 1;
    }

    fn push_chunk(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.remaining += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Responses queued over the lifetime of the connection.
    pub fn queued(&self) -> u64 {
        self.queued
    }
}

impl Buf for ResponseQueue {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.chunks.front().map(|chunk| &chunk[..]).unwrap_or_default()
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for (slot, chunk) in dst.iter_mut().zip(&self.chunks) {
            *slot = IoSlice::new(chunk);
            filled += 1;
        }
        filled
    }

    fn advance(&mut self, mut cnt: usize) {
        while cnt > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if cnt < front.len() {
                front.advance(cnt);
                self.remaining -= cnt;
                break;
            }
            cnt -= front.len();
            self.remaining -= front.len();
            self.chunks.pop_front();
        }
    }
}
