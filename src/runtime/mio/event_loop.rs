//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.

use std::io::{self, Read};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocols::http::{ConnectionConfig, ConnectionError};
use crate::runtime::connection::MioConnection;
use crate::runtime::listener::{self, ListenerRole};
use crate::runtime::{ListenerPorts, ServerError};
use crate::shutdown::Shutdown;

const HTTP_LISTENER: Token = Token(usize::MAX);
const ADMIN_LISTENER: Token = Token(usize::MAX - 1);

const EVENT_CAPACITY: usize = 1024;

/// Shared read buffer size
const SCRATCH_SIZE: usize = 64 * 1024;

/// Delay before retrying accept after the process ran out of resources
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Single-threaded server multiplexing both listeners and every connection.
pub struct MioServer {
    poll: Poll,
    http: Option<TcpListener>,
    admin: Option<TcpListener>,
    ports: ListenerPorts,
    connections: Slab<MioConnection>,
    connection_config: ConnectionConfig,
    config: Config,
    shutdown: Shutdown,
    scratch: Vec<u8>,
    /// Set when accept failed with connections possibly still queued. No
    /// new edge arrives for those, so the loop retries on a timer.
    accept_retry_at: Option<Instant>,
}

impl MioServer {
    /// Bind both listeners and register them with a new poll instance.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let poll = Poll::new()?;

        let http = listener::bind(ListenerRole::Http, &config)?;
        let admin = listener::bind(ListenerRole::Admin, &config)?;
        let ports = ListenerPorts {
            http: listener::local_port(&http)?,
            admin: listener::local_port(&admin)?,
        };

        let mut http = TcpListener::from_std(http);
        let mut admin = TcpListener::from_std(admin);
        poll.registry()
            .register(&mut http, HTTP_LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut admin, ADMIN_LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            http: Some(http),
            admin: Some(admin),
            ports,
            connections: Slab::with_capacity(config.max_connections.min(1024)),
            connection_config: config.connection_config(),
            config,
            shutdown: Shutdown::new(),
            scratch: vec![0u8; SCRATCH_SIZE],
            accept_retry_at: None,
        })
    }

    pub fn ports(&self) -> ListenerPorts {
        self.ports
    }

    /// Handle for observing the shutdown phase in tests.
    #[cfg(test)]
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve until an admin connection arrives and draining finishes.
    pub fn run(mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut drain_deadline: Option<Instant> = None;

        info!(
            http_port = self.ports.http,
            admin_port = self.ports.admin,
            "Server listening"
        );

        loop {
            let now = Instant::now();
            let drain_timeout = match drain_deadline {
                None => None,
                Some(_) if self.connections.is_empty() => break,
                Some(deadline) => {
                    if now >= deadline {
                        warn!(
                            remaining = self.connections.len(),
                            "Drain timeout elapsed, abandoning connections"
                        );
                        break;
                    }
                    Some(deadline - now)
                }
            };
            let retry_timeout = self
                .accept_retry_at
                .map(|retry_at| retry_at.saturating_duration_since(now));
            let timeout = match (drain_timeout, retry_timeout) {
                (Some(drain), Some(retry)) => Some(drain.min(retry)),
                (drain, retry) => drain.or(retry),
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    HTTP_LISTENER => self.accept_http(),
                    ADMIN_LISTENER => self.accept_admin(),
                    Token(conn_id) => self.process(conn_id),
                }
            }

            if self
                .accept_retry_at
                .is_some_and(|retry_at| Instant::now() >= retry_at)
            {
                self.accept_http();
            }

            if drain_deadline.is_none() && !self.shutdown.is_running() {
                self.begin_drain();
                drain_deadline = Some(Instant::now() + self.config.drain_timeout);
            }
        }

        let abandoned: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in abandoned {
            self.close(conn_id);
        }

        self.shutdown.complete();
        info!("Server stopped");
        Ok(())
    }

    fn accept_http(&mut self) {
        self.accept_retry_at = None;
        loop {
            let Some(listener) = &self.http else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.config.max_connections {
                        warn!(peer = %peer, "Connection limit reached, closing connection");
                        continue;
                    }

                    let conn_id = self
                        .connections
                        .insert(MioConnection::new(stream, peer, self.connection_config));
                    debug!(conn_id, peer = %peer, "New connection");

                    // Bytes may already be waiting; drive once before registering.
                    self.process(conn_id);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Accepted connection failed");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    self.accept_retry_at = Some(Instant::now() + ACCEPT_ERROR_BACKOFF);
                    return;
                }
            }
        }
    }

    fn accept_admin(&mut self) {
        let Some(listener) = &self.admin else {
            return;
        };
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if self.shutdown.trigger() {
                    info!(peer = %peer, "Shutdown requested on admin port");
                }
                // The payload is informational; whatever already arrived is logged.
                let mut payload = [0u8; 64];
                match stream.read(&mut payload) {
                    Ok(n) => debug!(
                        payload = %String::from_utf8_lossy(&payload[..n]),
                        "Admin payload"
                    ),
                    Err(e) => debug!(error = %e, "No admin payload"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!(error = %e, "Failed to accept admin connection"),
        }
    }

    /// Drive one connection and close it if it is done.
    fn process(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        let result = conn
            .drive(&mut self.scratch)
            .and_then(|()| conn.sync_interest(self.poll.registry(), Token(conn_id)));
        match result {
            Ok(()) if !conn.is_finished() => return,
            Ok(()) => {}
            Err(e) => debug!(conn_id, peer = %conn.peer(), error = %e, "Connection error"),
        }
        self.close(conn_id);
    }

    fn close(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.try_remove(conn_id) else {
            return;
        };
        let peer = conn.peer();
        match conn.close(self.poll.registry()) {
            Ok(served) => debug!(conn_id, peer = %peer, served, "Connection closed"),
            Err(ConnectionError::Malformed(e)) => {
                debug!(conn_id, peer = %peer, error = %e, "Closed connection on malformed request")
            }
            Err(e) => debug!(conn_id, peer = %peer, error = %e, "Connection error"),
        }
    }

    /// Stop accepting, stop reading, and close whatever is already idle.
    fn begin_drain(&mut self) {
        for mut listener in [self.http.take(), self.admin.take()].into_iter().flatten() {
            let _ = self.poll.registry().deregister(&mut listener);
        }

        info!(connections = self.connections.len(), "Draining connections");
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                conn.stop_reading();
            }
            self.process(conn_id);
        }
    }
}

/// Accept errors that concern only the connection being accepted; the
/// backlog behind it is unaffected.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::response::response_header;
    use crate::shutdown::Phase;
    use std::io::Write;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn echo_of(request: &[u8]) -> Vec<u8> {
        let mut response = response_header(request.len()).to_vec();
        response.extend_from_slice(request);
        response
    }

    fn connect(port: u16) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn start() -> (
        ListenerPorts,
        Shutdown,
        thread::JoinHandle<Result<(), ServerError>>,
    ) {
        let server = MioServer::bind(Config::default()).unwrap();
        let ports = server.ports();
        let shutdown = server.shutdown();
        (ports, shutdown, thread::spawn(move || server.run()))
    }

    fn stop(ports: ListenerPorts, handle: thread::JoinHandle<Result<(), ServerError>>) {
        let mut admin = connect(ports.admin);
        admin.write_all(b"shutdown").unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_echo_and_admin_shutdown() {
        let (ports, shutdown, handle) = start();
        let mut stream = connect(ports.http);

        let first = b"POST /first HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let second = b"GET /second HTTP/1.1\r\nHost: x\r\n\r\n";
        stream.write_all(first).unwrap();
        stream.write_all(second).unwrap();

        let mut expected = echo_of(first);
        expected.extend_from_slice(&echo_of(second));
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);

        stop(ports, handle);
        assert_eq!(shutdown.phase(), Phase::Stopped);

        // Drained: the server closed its side.
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_large_body_echoed() {
        let (ports, _shutdown, handle) = start();
        let mut stream = connect(ports.http);

        let body = vec![b'x'; 512 * 1024];
        let mut request =
            format!("PUT /big HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        request.extend_from_slice(&body);
        let expected = echo_of(&request);

        let mut reader = stream.try_clone().unwrap();
        let receiver = thread::spawn(move || {
            let mut received = vec![0u8; expected.len()];
            reader.read_exact(&mut received).unwrap();
            received == expected
        });
        stream.write_all(&request).unwrap();
        assert!(receiver.join().unwrap(), "echo differs from request");

        stop(ports, handle);
    }

    #[test]
    fn test_malformed_request_closes_connection() {
        let (ports, _shutdown, handle) = start();
        let mut stream = connect(ports.http);

        stream.write_all(b"NOT HTTP AT ALL\r\n\r\n").unwrap();
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received);
        assert!(received.is_empty());

        stop(ports, handle);
    }

    #[test]
    fn test_idle_connection_does_not_block_shutdown() {
        let (ports, _shutdown, handle) = start();
        let _idle = connect(ports.http);
        thread::sleep(Duration::from_millis(20));

        stop(ports, handle);
    }

    #[test]
    fn test_connection_error_kinds() {
        assert!(is_connection_error(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_connection_error(&io::ErrorKind::ConnectionReset.into()));
        // EMFILE and friends leave the backlog queued.
        assert!(!is_connection_error(&io::Error::from_raw_os_error(24)));
    }

    #[test]
    fn test_accept_retry_picks_up_queued_connection() {
        let mut server = MioServer::bind(Config::default()).unwrap();
        let ports = server.ports();
        let mut stream = connect(ports.http);

        // Consume the listener's readiness edge without accepting, as a
        // failed accept would.
        let mut events = Events::with_capacity(8);
        server
            .poll
            .poll(&mut events, Some(Duration::from_millis(200)))
            .unwrap();
        server.accept_retry_at = Some(Instant::now());

        let handle = thread::spawn(move || server.run());

        let request = b"GET /queued HTTP/1.1\r\n\r\n";
        stream.write_all(request).unwrap();
        let expected = echo_of(request);
        let mut received = vec![0u8; expected.len()];
        stream.read_exact(&mut received).unwrap();
        assert_eq!(received, expected);

        stop(ports, handle);
    }

    /// utime + stime of one thread, in clock ticks.
    #[cfg(target_os = "linux")]
    fn thread_cpu_ticks(stat_path: &std::path::Path) -> u64 {
        let stat = std::fs::read_to_string(stat_path).unwrap();
        // Fields after the parenthesised command name start at `state`.
        let fields: Vec<&str> = stat[stat.rfind(')').unwrap() + 1..]
            .split_whitespace()
            .collect();
        fields[11].parse::<u64>().unwrap() + fields[12].parse::<u64>().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_idle_and_stalled_connections_use_no_cpu() {
        let server = MioServer::bind(Config::default()).unwrap();
        let ports = server.ports();

        let (task_tx, task_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let task = std::fs::read_link("/proc/thread-self").unwrap();
            task_tx.send(task).unwrap();
            server.run()
        });
        let stat_path = std::path::Path::new("/proc")
            .join(task_rx.recv().unwrap())
            .join("stat");

        let _idle = connect(ports.http);
        let mut stalled = connect(ports.http);
        stalled
            .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial")
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        let before = thread_cpu_ticks(&stat_path);
        thread::sleep(Duration::from_secs(2));
        let used = thread_cpu_ticks(&stat_path) - before;

        // USER_HZ is 100 on Linux: 2 s of one core is 200 ticks.
        assert!(used < 50, "event loop used {used} ticks while idle");

        stop(ports, handle);
    }
}
