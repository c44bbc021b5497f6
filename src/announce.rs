//! Startup announcement of the bound ports.
//!
//! Test harnesses read these lines from stdout to find the server:
//!
//! ```text
//! http 49152
//! adm 49153
//! ```

use std::io::{self, Write};

use crate::runtime::ListenerPorts;

/// Write both port lines and flush.
pub fn announce<W: Write>(out: &mut W, ports: ListenerPorts) -> io::Result<()> {
    writeln!(out, "http {}", ports.http)?;
    writeln!(out, "adm {}", ports.admin)?;
    out.flush()
}

/// Announce on the process's stdout.
pub fn announce_stdout(ports: ListenerPorts) -> io::Result<()> {
    announce(&mut io::stdout().lock(), ports)
}
