//! HTTP/1.1 echo protocol.
//!
//! Every complete request is answered with a `200 Ok` whose body is the
//! request itself, byte for byte:
//!
//! ```text
//! Request:  POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello
//! Response: HTTP/1.1 200 Ok\r\nContent-Length: 44\r\nContent-Type: text/plain\r\n\r\n
//!           POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello
//! ```
//!
//! Bodies are delimited by `Content-Length` only (absent means empty).
//! Requests may be pipelined; responses go out in request order. A request
//! whose head does not parse closes the connection without a response.

pub mod framer;
pub mod handler;
pub mod parser;
pub mod response;

pub use framer::{ConnectionState, FrameError, FrameLimits, Framer};
pub use handler::{handle_connection, ConnectionError};
pub use response::ResponseQueue;

/// Per-connection settings shared by both runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub limits: FrameLimits,
    /// Queued response bytes above which reading pauses.
    pub max_pending_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            max_pending_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Queue an echo for every complete message in `framer`.
///
/// Returns the number of responses queued.
pub fn queue_echoes(framer: &mut Framer, responses: &mut ResponseQueue) -> Result<usize, FrameError> {
    let mut count = 0;
    while let Some(message) = framer.next_message()? {
        tracing::trace!(
            method = %message.head().request_line.method,
            target = %message.head().request_line.target,
            len = message.len(),
            body_len = message.body().len(),
            "Echoing request"
        );
        responses.push_echo(message);
        count += 1;
    }
    Ok(count)
}
