//! Output streams: where drained bytes go.
//!
//! Both variants share one contract: `write(data, header)` returns the
//! number of data bytes accepted, with 0 signalling failure (the caller
//! retries after backoff).  A stream tracks whether the header block has
//! been sent on the current connection; the TCP variant clears that flag
//! on every reconnection so the accumulated headers are replayed before
//! any payload.

use std::fs::File;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Destination for a drained byte stream.
pub trait OutStream: Send + Sync {
    /// Destination string, for logging.
    fn dest(&self) -> &str;

    /// Write `data`, preceded by `header` if this connection has not seen
    /// the header block yet.  Returns the number of data bytes written;
    /// 0 reports a (transient) failure.
    fn write(&self, data: &[u8], header: &[u8]) -> usize;

    fn close(&self);
}

// ---------------------------------------------------------------------------
// File variant
// ---------------------------------------------------------------------------

struct FileState {
    file: Option<File>,
    header_written: bool,
}

/// Writes samples to a local file.  There is no reconnect concept: the
/// header block is written once, when the file is first opened.
pub struct FileOutStream {
    dest: String,
    path: PathBuf,
    flush: bool,
    state: Mutex<FileState>,
}

impl FileOutStream {
    /// `flush` disables write buffering: every write is flushed to disk.
    pub fn new(path: &str, flush: bool) -> FileOutStream {
        FileOutStream {
            dest: format!("{}:{}", if flush { "flush" } else { "file" }, path),
            path: PathBuf::from(path),
            flush,
            state: Mutex::new(FileState {
                file: None,
                header_written: false,
            }),
        }
    }
}

impl OutStream for FileOutStream {
    fn dest(&self) -> &str {
        &self.dest
    }

    fn write(&self, data: &[u8], header: &[u8]) -> usize {
        let mut st = lock(&self.state);
        if st.file.is_none() {
            match File::create(&self.path) {
                Ok(f) => st.file = Some(f),
                Err(e) => {
                    tracing::error!(dest = %self.dest, error = %e, "cannot open output file");
                    return 0;
                }
            }
        }
        let st = &mut *st;
        let Some(file) = st.file.as_mut() else {
            return 0;
        };

        if !st.header_written {
            if file.write_all(header).is_err() {
                tracing::error!(dest = %self.dest, "short write on file header");
                return 0;
            }
            st.header_written = true;
        }

        match file.write(data) {
            Ok(n) => {
                if self.flush {
                    let _ = file.flush();
                }
                n
            }
            Err(e) => {
                tracing::error!(dest = %self.dest, error = %e, "file write failed");
                0
            }
        }
    }

    fn close(&self) {
        let mut st = lock(&self.state);
        if let Some(mut f) = st.file.take() {
            let _ = f.flush();
        }
    }
}

// ---------------------------------------------------------------------------
// TCP variant
// ---------------------------------------------------------------------------

struct TcpState {
    sock: Option<TcpStream>,
    header_written: bool,
}

/// Ships samples to a collection server over TCP.
///
/// On first use, or after a detected disconnect, the destination is
/// re-resolved (all address families) and each candidate address is tried
/// in turn; a refused connection simply advances the iterator.  Broken
/// pipes and connection resets mark the stream disconnected and report 0,
/// so the buffered writer backs off and retries.
pub struct TcpOutStream {
    dest: String,
    host: String,
    service: u16,
    state: Mutex<TcpState>,
}

impl TcpOutStream {
    pub fn new(host: &str, service: u16) -> TcpOutStream {
        TcpOutStream {
            dest: format!("tcp:{host}:{service}"),
            host: host.to_owned(),
            service,
            state: Mutex::new(TcpState {
                sock: None,
                header_written: false,
            }),
        }
    }

    fn connect(&self) -> Option<TcpStream> {
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), self.service).to_socket_addrs() {
            Ok(it) => it.collect(),
            Err(e) => {
                tracing::warn!(dest = %self.dest, error = %e, "cannot resolve collection server");
                return None;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(sock) => {
                    tracing::debug!(dest = %self.dest, %addr, "connected to collection server");
                    return Some(sock);
                }
                Err(e) => {
                    tracing::debug!(dest = %self.dest, %addr, error = %e, "connection attempt failed");
                }
            }
        }
        None
    }
}

impl OutStream for TcpOutStream {
    fn dest(&self) -> &str {
        &self.dest
    }

    fn write(&self, data: &[u8], header: &[u8]) -> usize {
        let mut st = lock(&self.state);
        if st.sock.is_none() {
            let Some(sock) = self.connect() else {
                return 0;
            };
            st.sock = Some(sock);
            st.header_written = false;
        }
        let st = &mut *st;
        let Some(sock) = st.sock.as_mut() else {
            return 0;
        };

        if !st.header_written {
            match send_all(sock, header) {
                Ok(()) => st.header_written = true,
                Err(sent) => {
                    if sent > 0 {
                        // Multi-packet header recovery is out of scope; the
                        // reconnect path resends the block from the start.
                        tracing::warn!(dest = %self.dest, sent, "partial header write");
                        st.header_written = true;
                    }
                    st.sock = None;
                    return 0;
                }
            }
        }

        match sock.write(data) {
            Ok(0) => {
                tracing::warn!(dest = %self.dest, "connection lost");
                st.sock = None;
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => {
                tracing::warn!(dest = %self.dest, error = %e, "connection lost");
                st.sock = None;
                0
            }
        }
    }

    fn close(&self) {
        let mut st = lock(&self.state);
        if let Some(sock) = st.sock.take() {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Write a whole buffer; on failure report how many bytes made it out.
fn send_all(sock: &mut TcpStream, buf: &[u8]) -> Result<(), usize> {
    let mut off = 0;
    while off < buf.len() {
        match sock.write(&buf[off..]) {
            Ok(0) => return Err(off),
            Ok(n) => off += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return Err(off),
        }
    }
    Ok(())
}
