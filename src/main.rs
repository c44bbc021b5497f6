//! http_echo: an HTTP/1.1 echo server
//!
//! Every request received on the HTTP port is answered with a `200 Ok`
//! whose body is the request itself, byte for byte. Any connection to the
//! admin port shuts the server down gracefully.
//!
//! Features:
//! - Pipelined requests, answered in order
//! - Bound ports announced on stdout (`http <port>` / `adm <port>`)
//! - Tokio or mio runtime
//! - Configuration via CLI arguments or TOML file

mod announce;
mod config;
mod protocols;
mod runtime;
mod server;
mod shutdown;

use config::{Config, RuntimeType};
use runtime::MioServer;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for the port announcement
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        http_port = config.http_port,
        admin_port = config.admin_port,
        runtime = ?config.runtime,
        max_connections = config.max_connections,
        drain_timeout_ms = config.drain_timeout_ms(),
        "Starting http_echo server"
    );

    match config.runtime {
        RuntimeType::Tokio => run_tokio(config),
        RuntimeType::Mio => run_mio(config),
    }
}

/// Run with the multi-threaded Tokio runtime
fn run_tokio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    info!("Using tokio runtime");
    runtime.block_on(async move {
        let server = Server::bind(config)?;
        announce::announce_stdout(server.ports())?;
        server.run().await?;
        Ok::<_, Box<dyn std::error::Error>>(())
    })
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    let server = MioServer::bind(config)?;
    announce::announce_stdout(server.ports())?;
    server.run()?;
    Ok(())
}
