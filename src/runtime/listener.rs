//! Listening socket setup shared by both runtimes.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, PortRange};

/// Which of the two listeners a socket serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    Http,
    Admin,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerRole::Http => f.write_str("http"),
            ListenerRole::Admin => f.write_str("admin"),
        }
    }
}

/// Ports resolved after binding, fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerPorts {
    pub http: u16,
    pub admin: u16,
}

/// A listener could not be bound. Fatal at startup.
#[derive(Debug, Error)]
#[error("failed to bind {role} listener on {host}:{port}: {source}")]
pub struct BindError {
    pub role: ListenerRole,
    pub host: String,
    pub port: u16,
    #[source]
    pub source: io::Error,
}

/// Bind the listener for `role` as configured.
///
/// The returned socket is non-blocking, ready to hand to tokio or mio.
/// Port 0 means an ephemeral port, or the first free port of the
/// configured range when there is one.
pub fn bind(role: ListenerRole, config: &Config) -> Result<TcpListener, BindError> {
    let port = match role {
        ListenerRole::Http => config.http_port,
        ListenerRole::Admin => config.admin_port,
    };
    let error = |source| BindError {
        role,
        host: config.host.clone(),
        port,
        source,
    };

    let ip: IpAddr = config
        .host
        .parse()
        .map_err(|e| error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let listener = match (port, config.port_range) {
        (0, Some(range)) => bind_in_range(ip, range, config.backlog),
        _ => create_listener(SocketAddr::new(ip, port), config.backlog),
    }
    .map_err(error)?;

    let local_addr = listener.local_addr().map_err(error)?;
    info!(role = %role, address = %local_addr, "Listener bound");
    Ok(listener)
}

/// Try each port of `range` in order, keeping the first that binds.
fn bind_in_range(ip: IpAddr, range: PortRange, backlog: u32) -> io::Result<TcpListener> {
    let mut last_error = None;
    for port in range.ports() {
        match create_listener(SocketAddr::new(ip, port), backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(port, error = %e, "Port unavailable");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no port available in {range}"))
    }))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Port a listener ended up on.
pub fn local_port(listener: &TcpListener) -> io::Result<u16> {
    listener.local_addr().map(|addr| addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_ports_differ() {
        let config = Config::default();
        let http = bind(ListenerRole::Http, &config).unwrap();
        let admin = bind(ListenerRole::Admin, &config).unwrap();

        let http_port = local_port(&http).unwrap();
        let admin_port = local_port(&admin).unwrap();
        assert_ne!(http_port, 0);
        assert_ne!(admin_port, 0);
        assert_ne!(http_port, admin_port);
    }

    #[test]
    fn test_port_range_skips_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        if taken_port == u16::MAX {
            return;
        }

        let config = Config {
            port_range: Some(PortRange {
                start: taken_port,
                end: taken_port + 1,
            }),
            ..Config::default()
        };

        match bind(ListenerRole::Http, &config) {
            Ok(listener) => assert_eq!(local_port(&listener).unwrap(), taken_port + 1),
            // The neighbouring port may be in use on a busy host.
            Err(e) => assert_eq!(e.role, ListenerRole::Http),
        }
    }

    #[test]
    fn test_bind_failure_reports_role() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            admin_port: taken.local_addr().unwrap().port(),
            ..Config::default()
        };

        let err = bind(ListenerRole::Admin, &config).unwrap_err();
        assert_eq!(err.role, ListenerRole::Admin);
        assert!(err.to_string().contains("admin listener"));
    }

    #[test]
    fn test_invalid_host() {
        let config = Config {
            host: "not-an-address".to_string(),
            ..Config::default()
        };
        let err = bind(ListenerRole::Http, &config).unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::InvalidInput);
    }
}
