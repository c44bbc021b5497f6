//! Connection state for the mio runtime.
//!
//! Sockets are edge-triggered, so every readiness event is followed by
//! reading or writing until the socket reports `WouldBlock`. The
//! connection only asks for the readiness it can act on: no `READABLE`
//! while reading is paused, no `WRITABLE` while nothing is queued.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::Buf;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::protocols::http::{
    queue_echoes, ConnectionConfig, ConnectionError, ConnectionState, FrameError, Framer,
    ResponseQueue,
};

/// Maximum chunks handed to a single vectored write
const MAX_IOVECS: usize = 64;

/// One accepted HTTP connection driven by the event loop.
pub(crate) struct MioConnection {
    stream: TcpStream,
    peer: SocketAddr,
    framer: Framer,
    responses: ResponseQueue,
    /// Cleared on EOF, malformed input or shutdown.
    reading: bool,
    /// Interest currently registered, `None` while deregistered.
    interest: Option<Interest>,
    max_pending_bytes: usize,
    malformed: Option<FrameError>,
}

impl MioConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, config: ConnectionConfig) -> Self {
        Self {
            stream,
            peer,
            framer: Framer::new(config.limits),
            responses: ResponseQueue::new(),
            reading: true,
            interest: None,
            max_pending_bytes: config.max_pending_bytes,
            malformed: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Make all the progress the socket allows right now.
    ///
    /// `scratch` is the event loop's shared read buffer; bytes read into it
    /// are copied into the framer before the next read.
    pub fn drive(&mut self, scratch: &mut [u8]) -> io::Result<()> {
        loop {
            self.flush()?;
            if !self.can_read() {
                return Ok(());
            }

            match self.stream.read(scratch) {
                Ok(0) => {
                    if self.framer.state() != ConnectionState::Idle {
                        debug!(
                            peer = %self.peer,
                            state = ?self.framer.state(),
                            buffered = self.framer.buffered(),
                            "Peer closed with a partial request"
                        );
                    }
                    self.reading = false;
                }
                Ok(n) => {
                    self.framer.extend_from_slice(&scratch[..n]);
                    if let Err(e) = queue_echoes(&mut self.framer, &mut self.responses) {
                        self.malformed = Some(e);
                        self.reading = false;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Write queued responses until the queue is empty or the socket is full.
    fn flush(&mut self) -> io::Result<()> {
        while self.responses.has_remaining() {
            let result = {
                let mut slices = [IoSlice::new(&[]); MAX_IOVECS];
                let count = self.responses.chunks_vectored(&mut slices);
                self.stream.write_vectored(&slices[..count])
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.responses.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn can_read(&self) -> bool {
        self.reading && self.responses.remaining() < self.max_pending_bytes
    }

    /// Stop accepting new requests; queued responses are still written.
    pub fn stop_reading(&mut self) {
        if self.reading {
            trace!(peer = %self.peer, pending = self.responses.remaining(), "Draining connection");
            self.reading = false;
        }
    }

    /// Nothing left to read or write.
    pub fn is_finished(&self) -> bool {
        !self.reading && !self.responses.has_remaining()
    }

    fn wanted_interest(&self) -> Option<Interest> {
        match (self.can_read(), self.responses.has_remaining()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Bring the registration in line with what the connection can act on.
    pub fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let wanted = self.wanted_interest();
        if wanted == self.interest {
            return Ok(());
        }

        match (self.interest, wanted) {
            (None, Some(interest)) => registry.register(&mut self.stream, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(&mut self.stream, token, interest)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.interest = wanted;
        Ok(())
    }

    /// Close the connection, reporting how it ended.
    ///
    /// Returns the number of responses queued over its lifetime.
    pub fn close(mut self, registry: &Registry) -> Result<u64, ConnectionError> {
        if self.interest.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        // Best effort: the peer may already be gone.
        let _ = self.stream.shutdown(Shutdown::Write);

        match self.malformed {
            Some(e) => Err(e.into()),
            None => Ok(self.responses.queued()),
        }
    }
}
