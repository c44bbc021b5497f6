//! Socket plumbing and the mio runtime.
//!
//! - `listener`: listening sockets for both roles, shared by both runtimes
//! - `mio`: single-threaded readiness event loop
//!
//! The Tokio runtime lives in `crate::server`.

mod connection;
pub mod listener;
mod mio;

use std::io;
use thiserror::Error;

pub use self::mio::MioServer;
pub use listener::{BindError, ListenerPorts};

/// Fatal server error, reported before or instead of a clean shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("server I/O failed: {0}")]
    Io(#[from] io::Error),
}
