//! Best-effort datagram mirror to the external ML analyzer.
//!
//! Connectionless UNIX datagrams: one 68-byte wire record per send, no
//! framing. The analyzer being absent, slow, or gone mid-run must never
//! stall or crash the detection pipeline, so sends are non-blocking with
//! no-signal semantics and expected transient errors are dropped silently.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::os::unix::prelude::AsRawFd;
use std::path::Path;

use tracing::warn;

use telemetry::{wire, TelemetrySample};

pub struct MlPublisher {
    socket: UnixDatagram,
    send_error_logged: bool,
}

impl MlPublisher {
    /// Associate an unbound non-blocking datagram socket with the analyzer's
    /// path. Fails when the peer endpoint does not exist; the caller treats
    /// that as "run standalone", not as an error.
    pub fn connect(path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.set_nonblocking(true)?;
        socket.connect(path)?;
        Ok(Self {
            socket,
            send_error_logged: false,
        })
    }

    /// Mirror one sample. Would-block, no-peer and connection-refused are
    /// silent drops; any other error class is logged once per publisher
    /// lifetime to keep a broken peer from flooding the log.
    pub fn send(&mut self, sample: &TelemetrySample) {
        let buf = wire::encode(sample);

        // SAFETY: plain send(2) on an owned descriptor with a stack buffer.
        // MSG_NOSIGNAL keeps a vanished peer from raising SIGPIPE.
        let rc = unsafe {
            libc::send(
                self.socket.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if rc >= 0 {
            return;
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code)
                if code == libc::EAGAIN
                    || code == libc::EWOULDBLOCK
                    || code == libc::ECONNREFUSED
                    || code == libc::ENOENT => {}
            _ => {
                if !self.send_error_logged {
                    warn!(error = %err, "ML mirror send failed; further errors suppressed");
                    self.send_error_logged = true;
                }
            }
        }
    }
}
