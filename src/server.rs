//! TCP server for the Tokio runtime.
//!
//! Binds the HTTP and admin listeners, then runs one accept loop per
//! listener and one task per HTTP connection. The first admin connection
//! starts the shutdown: accepting stops, connections flush what they have
//! queued, and `run` returns once they are done or the grace period ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocols::http::{handle_connection, ConnectionConfig, ConnectionError};
use crate::runtime::listener::{self, ListenerRole};
use crate::runtime::{ListenerPorts, ServerError};
use crate::shutdown::Shutdown;

/// Pause after a failed accept, so persistent failures such as fd
/// exhaustion do not turn the loop into a spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// How long the admin connection is given to deliver its payload
const ADMIN_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    http: TcpListener,
    admin: TcpListener,
    ports: ListenerPorts,
    shutdown: Shutdown,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind both listeners.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let http = listener::bind(ListenerRole::Http, &config)?;
        let admin = listener::bind(ListenerRole::Admin, &config)?;

        let ports = ListenerPorts {
            http: listener::local_port(&http)?,
            admin: listener::local_port(&admin)?,
        };

        Ok(Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            http: TcpListener::from_std(http)?,
            admin: TcpListener::from_std(admin)?,
            ports,
            shutdown: Shutdown::new(),
            config,
        })
    }

    pub fn ports(&self) -> ListenerPorts {
        self.ports
    }

    /// Handle to the shutdown coordinator for testing
    #[cfg(test)]
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Serve until shutdown completes.
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            config,
            http,
            admin,
            ports,
            shutdown,
            connection_limit,
        } = self;

        info!(
            http_port = ports.http,
            admin_port = ports.admin,
            "Server listening"
        );

        let admin_task = tokio::spawn(admin_loop(admin, shutdown.clone()));
        accept_loop(
            http,
            config.connection_config(),
            &shutdown,
            Arc::clone(&connection_limit),
        )
        .await;

        // Every finished connection returns its permit; holding all of them
        // means no connection is left.
        let active = config.max_connections - connection_limit.available_permits();
        info!(connections = active, "Draining connections");
        let all_permits = u32::try_from(config.max_connections).unwrap_or(u32::MAX);
        match tokio::time::timeout(config.drain_timeout, connection_limit.acquire_many(all_permits))
            .await
        {
            Ok(_) => debug!("All connections closed"),
            Err(_) => warn!(
                remaining = config.max_connections - connection_limit.available_permits(),
                "Drain timeout elapsed, abandoning connections"
            ),
        }

        if let Err(e) = admin_task.await {
            error!(error = %e, "Admin listener task failed");
        }

        shutdown.complete();
        info!("Server stopped");
        Ok(())
    }
}

/// Accept HTTP connections until shutdown is triggered.
///
/// The listener is dropped on return; connection tasks keep running until
/// they drain.
async fn accept_loop(
    listener: TcpListener,
    config: ConnectionConfig,
    shutdown: &Shutdown,
    connection_limit: Arc<Semaphore>,
) {
    let mut draining = shutdown.subscribe();

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = draining.draining() => return,
            permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let accepted = tokio::select! {
            _ = draining.draining() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");

                let conn_shutdown = shutdown.subscribe();
                tokio::spawn(async move {
                    match handle_connection(stream, config, conn_shutdown).await {
                        Ok(served) => debug!(peer = %peer, served, "Connection closed"),
                        Err(ConnectionError::Malformed(e)) => {
                            debug!(peer = %peer, error = %e, "Closed connection on malformed request")
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
                    }
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Wait for the first admin connection and trigger shutdown.
async fn admin_loop(listener: TcpListener, shutdown: Shutdown) {
    let mut draining = shutdown.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = draining.draining() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if shutdown.trigger() {
                    info!(peer = %peer, "Shutdown requested on admin port");
                }
                read_admin_payload(stream).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to accept admin connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Read whatever the admin client sent, for the log only.
async fn read_admin_payload(mut stream: TcpStream) {
    let mut payload = [0u8; 64];
    match tokio::time::timeout(ADMIN_READ_TIMEOUT, stream.read(&mut payload)).await {
        Ok(Ok(n)) => debug!(
            payload = %String::from_utf8_lossy(&payload[..n]),
            "Admin payload"
        ),
        Ok(Err(e)) => debug!(error = %e, "Failed to read admin payload"),
        Err(_) => debug!("No admin payload"),
    }
}
