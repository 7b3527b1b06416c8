//! TCP transport for draw commands.
//!
//! ## Wire format
//!
//! Each write is one frame, each response a fixed 8 bytes
//! (all little-endian):
//!
//! ```text
//! write:     length: u32 (4)  payload: [u8] (length)
//! response:  status: u32 (4)  applied: u32 (4)
//! ```
//!
//! | status | meaning            |
//! |--------|--------------------|
//! | 0      | ok                 |
//! | 1      | unknown image id   |
//! | 2      | short write        |

use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{info, warn};

use drawlink_core::{DrawChannel, DrawError, ErrorFlags};

pub const STATUS_OK: u32 = 0;
pub const STATUS_UNKNOWN_ID: u32 = 1;
pub const STATUS_SHORT_WRITE: u32 = 2;

/// Size of one response on the wire.
pub const RESPONSE_LEN: usize = 8;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`DrawChannel`] over a plain TCP stream.
///
/// Writes and responses use independent halves of the socket so the drain
/// thread can block on a response while the sender keeps writing.
pub struct TcpDrawChannel {
    writer: Mutex<TcpStream>,
    reader: Mutex<BufReader<TcpStream>>,
    flags: AtomicU32,
    max_write: Option<usize>,
    response_timeout: Option<Duration>,
    peer: SocketAddr,
}

impl TcpDrawChannel {
    /// Connect to `addr`, waiting at most `connect_timeout`; responses that
    /// take longer than `response_timeout` fail the read.
    pub fn connect(
        addr: &str,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, DrawError> {
        let peer = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DrawError::Other(format!("cannot resolve {addr}")))?;
        let stream = TcpStream::connect_timeout(&peer, connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(response_timeout))?;
        info!("connected to draw device at {peer}");
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, DrawError> {
        let peer = stream.peer_addr()?;
        let response_timeout = stream.read_timeout()?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: Mutex::new(stream),
            reader: Mutex::new(reader),
            flags: AtomicU32::new(0),
            max_write: None,
            response_timeout,
            peer,
        })
    }

    /// Advertise the remote's largest accepted message.
    pub fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = Some(max_write);
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn raise(&self, flag: ErrorFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    /// Map an I/O failure, flagging a lost connection.
    fn io_error(&self, e: std::io::Error) -> DrawError {
        match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                DrawError::Timeout(self.response_timeout.unwrap_or_default())
            }
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => {
                self.raise(ErrorFlags::CONNECTION_RESET);
                DrawError::ConnectionReset
            }
            _ => DrawError::Io(e),
        }
    }
}

impl DrawChannel for TcpDrawChannel {
    fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError> {
        let len = u32::try_from(bytes.len()).map_err(|_| DrawError::CapacityExceeded {
            what: "write",
            size: bytes.len(),
            max: u32::MAX as usize,
        })?;
        let mut writer = lock(&self.writer);
        writer
            .write_all(&len.to_le_bytes())
            .and_then(|()| writer.write_all(bytes))
            .map_err(|e| self.io_error(e))?;
        Ok(bytes.len())
    }

    fn receive_one_response(&self) -> Result<usize, DrawError> {
        let mut buf = [0u8; RESPONSE_LEN];
        lock(&self.reader)
            .read_exact(&mut buf)
            .map_err(|e| self.io_error(e))?;
        let status = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let applied = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        match status {
            STATUS_OK => Ok(applied),
            STATUS_UNKNOWN_ID => {
                self.raise(ErrorFlags::UNKNOWN_ID);
                Err(DrawError::UnknownImage)
            }
            STATUS_SHORT_WRITE => {
                self.raise(ErrorFlags::SHORT_WRITE);
                Ok(applied)
            }
            other => {
                warn!("draw device sent status {other}");
                Err(DrawError::ProtocolViolation("unknown response status"))
            }
        }
    }

    fn take_error_flags(&self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(self.flags.swap(0, Ordering::SeqCst))
    }

    fn max_write(&self) -> Option<usize> {
        self.max_write
    }
}

/// Encode one response.
pub fn response(status: u32, applied: u32) -> [u8; RESPONSE_LEN] {
    let mut buf = [0u8; RESPONSE_LEN];
    buf[..4].copy_from_slice(&status.to_le_bytes());
    buf[4..].copy_from_slice(&applied.to_le_bytes());
    buf
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpDrawChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let chan = TcpDrawChannel::connect(&addr, Duration::from_secs(2), Duration::from_secs(2)).unwrap();
        let (server, _) = listener.accept().unwrap();
        (chan, server)
    }

    #[test]
    fn writes_are_length_prefixed() {
        let (chan, mut server) = pair();
        assert_eq!(chan.write_pipelined(b"vv").unwrap(), 2);
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [2, 0, 0, 0, b'v', b'v']);
    }

    #[test]
    fn statuses_map_to_results_and_flags() {
        let (chan, mut server) = pair();
        server.write_all(&response(STATUS_OK, 10)).unwrap();
        server.write_all(&response(STATUS_SHORT_WRITE, 3)).unwrap();
        server.write_all(&response(STATUS_UNKNOWN_ID, 0)).unwrap();
        server.write_all(&response(9, 0)).unwrap();

        assert_eq!(chan.receive_one_response().unwrap(), 10);
        assert_eq!(chan.receive_one_response().unwrap(), 3);
        assert!(matches!(chan.receive_one_response(), Err(DrawError::UnknownImage)));
        assert!(matches!(chan.receive_one_response(), Err(DrawError::ProtocolViolation(_))));

        let flags = chan.take_error_flags();
        assert!(flags.contains(ErrorFlags::SHORT_WRITE | ErrorFlags::UNKNOWN_ID));
        assert!(chan.take_error_flags().is_empty());
    }

    #[test]
    fn closed_peer_flags_reset() {
        let (chan, server) = pair();
        drop(server);
        assert!(matches!(chan.receive_one_response(), Err(DrawError::ConnectionReset)));
        assert!(chan.take_error_flags().contains(ErrorFlags::CONNECTION_RESET));
    }
}
