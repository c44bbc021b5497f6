//! Echo connection handler for the Tokio runtime.
//!
//! Reading and writing are multiplexed on the two halves of the stream, so
//! framing keeps going while earlier responses are still unread by the peer.
//! Reading pauses once `max_pending_bytes` of responses are queued.

use std::io::{self, IoSlice};

use bytes::Buf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{queue_echoes, ConnectionConfig, ConnectionState, FrameError, Framer, ResponseQueue};
use crate::shutdown::ShutdownListener;

/// Spare capacity ensured before each read
const READ_CHUNK: usize = 16 * 1024;

/// Maximum chunks handed to a single vectored write
const MAX_IOVECS: usize = 64;

/// Why a connection ended abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Malformed(#[from] FrameError),
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Serve one echo connection until the peer closes it, an error occurs, or
/// shutdown drains it.
///
/// Returns the number of responses sent. Responses already queued are
/// flushed before returning, also after a malformed request; a partial
/// request left in the buffer is dropped without a response.
pub async fn handle_connection<S>(
    stream: S,
    config: ConnectionConfig,
    mut shutdown: ShutdownListener,
) -> Result<u64, ConnectionError>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = Framer::new(config.limits);
    let mut responses = ResponseQueue::new();
    let mut reading = true;
    let mut malformed = None;

    loop {
        if !reading && !responses.has_remaining() {
            break;
        }

        let can_read = reading && responses.remaining() < config.max_pending_bytes;
        if can_read {
            framer.reserve(READ_CHUNK);
        }

        tokio::select! {
            read = reader.read_buf(framer.buffer_mut()), if can_read => {
                if read? == 0 {
                    if framer.state() != ConnectionState::Idle {
                        debug!(
                            state = ?framer.state(),
                            buffered = framer.buffered(),
                            "Peer closed with a partial request"
                        );
                    }
                    reading = false;
                    continue;
                }
                if let Err(e) = queue_echoes(&mut framer, &mut responses) {
                    malformed = Some(e);
                    reading = false;
                }
            }
            written = write_queued(&mut writer, &mut responses), if responses.has_remaining() => {
                written?;
            }
            _ = shutdown.draining(), if reading => {
                trace!(pending = responses.remaining(), "Draining connection");
                reading = false;
            }
        }
    }

    // Best effort: the peer may already be gone.
    let _ = writer.shutdown().await;

    match malformed {
        Some(e) => Err(e.into()),
        None => Ok(responses.queued()),
    }
}

/// Write as much of the queue as the socket takes in one vectored write.
async fn write_queued<W>(writer: &mut W, responses: &mut ResponseQueue) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = {
        let mut slices = [IoSlice::new(&[]); MAX_IOVECS];
        let count = responses.chunks_vectored(&mut slices);
        writer.write_vectored(&slices[..count]).await?
    };
    if written == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    responses.advance(written);
    Ok(())
}
