//! Protocol implementations.
//!
//! - `http`: HTTP/1.1 request framing and the echo handler used by both
//!   runtimes
//!
//! The admin port carries no protocol: any connection is a shutdown request.

pub mod http;
