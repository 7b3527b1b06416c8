//! Loopback draw device.
//!
//! Accepts the bridge's TCP framing (see [`crate::tcp`]), checks every
//! command against the wire grammar and the set of image ids it knows, and
//! answers each write with one response. No pixels are kept; the sink is for
//! exercising the bridge end to end without real display hardware.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use drawlink_core::draw::codec::decode_prefix;
use drawlink_core::draw::command::{
    DRAW_LEN, FREE_LEN, LOAD_HEADER_LEN, TAG_DRAW, TAG_FLUSH, TAG_FREE, TAG_LOAD_COMPRESSED,
    TAG_LOAD_RAW, TAG_NAME,
};

use crate::tcp::{STATUS_OK, STATUS_SHORT_WRITE, STATUS_UNKNOWN_ID, response};

/// Largest rectangle edge a load may carry.
const MAX_EDGE: i32 = 1 << 14;

/// Largest framed write the sink reads.
const MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Statistics ───────────────────────────────────────────────────

/// Counters shared by every connection of one sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub writes: AtomicU64,
    pub bytes: AtomicU64,
    pub flushes: AtomicU64,
    pub rejected: AtomicU64,
}

// ── Command checking ─────────────────────────────────────────────

/// Why a write was not applied in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A command referenced an id the sink does not hold.
    UnknownId { at: usize },
    /// A command was truncated or malformed.
    Malformed { at: usize },
}

/// Per-connection view of the remote image table.
#[derive(Debug, Clone)]
pub struct SinkSession {
    known: HashSet<u32>,
    flushes: u64,
}

fn le_u32(b: &[u8], at: usize) -> Option<u32> {
    let bytes = b.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn le_i32(b: &[u8], at: usize) -> Option<i32> {
    le_u32(b, at).map(|v| v as i32)
}

/// Byte size of the pixels covered by the rectangle at `at`.
fn rect_bytes(b: &[u8], at: usize) -> Option<usize> {
    let x1 = le_i32(b, at)?;
    let y1 = le_i32(b, at + 4)?;
    let x2 = le_i32(b, at + 8)?;
    let y2 = le_i32(b, at + 12)?;
    let (w, h) = (x2.checked_sub(x1)?, y2.checked_sub(y1)?);
    if w <= 0 || h <= 0 || w > MAX_EDGE || h > MAX_EDGE {
        return None;
    }
    Some(w as usize * h as usize * 4)
}

impl SinkSession {
    /// Start with `preallocated` ids already present.
    pub fn new(preallocated: impl IntoIterator<Item = u32>) -> Self {
        Self {
            known: preallocated.into_iter().collect(),
            flushes: 0,
        }
    }

    pub fn knows(&self, id: u32) -> bool {
        self.known.contains(&id)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Apply every command in one write.
    ///
    /// Commands before a rejected one stay applied.
    pub fn apply(&mut self, buf: &[u8]) -> Result<(), Rejection> {
        let mut at = 0;
        while at < buf.len() {
            at += self.apply_one(buf, at)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, buf: &[u8], at: usize) -> Result<usize, Rejection> {
        let malformed = Rejection::Malformed { at };
        let unknown = Rejection::UnknownId { at };
        let id = |off: usize| le_u32(buf, at + off).ok_or(malformed);
        match buf[at] {
            tag @ (TAG_LOAD_RAW | TAG_LOAD_COMPRESSED) => {
                let dst = id(1)?;
                let expected = rect_bytes(buf, at + 5).ok_or(malformed)?;
                if !self.knows(dst) {
                    return Err(unknown);
                }
                let body = &buf[(at + LOAD_HEADER_LEN).min(buf.len())..];
                let used = if tag == TAG_LOAD_RAW {
                    if body.len() < expected {
                        return Err(malformed);
                    }
                    expected
                } else {
                    decode_prefix(body, expected).map_err(|_| malformed)?.1
                };
                Ok(LOAD_HEADER_LEN + used)
            }
            TAG_DRAW => {
                if buf.len() < at + DRAW_LEN {
                    return Err(malformed);
                }
                let ids = [id(1)?, id(5)?, id(9)?];
                if !ids.iter().all(|i| self.knows(*i)) {
                    return Err(unknown);
                }
                Ok(DRAW_LEN)
            }
            TAG_FREE => {
                if !self.known.remove(&id(1)?) {
                    return Err(unknown);
                }
                Ok(FREE_LEN)
            }
            TAG_FLUSH => {
                self.flushes += 1;
                Ok(1)
            }
            TAG_NAME => {
                let bound = id(1)?;
                let len = *buf.get(at + 5).ok_or(malformed)? as usize;
                let name = buf.get(at + 6..at + 6 + len).ok_or(malformed)?;
                if name.is_empty() {
                    return Err(unknown);
                }
                debug!("bound image {bound} to '{}'", String::from_utf8_lossy(name));
                self.known.insert(bound);
                Ok(6 + len)
            }
            _ => Err(malformed),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────

/// Serve connections on `listener` until `running` clears.
pub async fn serve(
    listener: TcpListener,
    preallocated: Vec<u32>,
    stats: Arc<SinkStats>,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    info!("draw sink listening on {}", listener.local_addr()?);
    while running.load(Ordering::SeqCst) {
        let accept = tokio::select! {
            result = listener.accept() => result,
            _ = wait_for_stop(&running) => break,
        };
        let (stream, peer) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };
        let session = SinkSession::new(preallocated.iter().copied());
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            info!("bridge connected from {peer}");
            if let Err(e) = handle(stream, peer, session, &stats).await {
                warn!("session with {peer} failed: {e}");
            }
            info!("session with {peer} ended");
        });
    }
    info!("draw sink stopped");
    Ok(())
}

async fn handle(
    stream: TcpStream,
    peer: SocketAddr,
    mut session: SinkSession,
    stats: &SinkStats,
) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        let len = match reader.read_u32_le().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if len > MAX_FRAME {
            warn!("{peer} sent a {len}-byte write; closing");
            return Ok(());
        }
        buf.resize(len, 0);
        reader.read_exact(&mut buf).await?;

        stats.writes.fetch_add(1, Ordering::Relaxed);
        stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
        let before = session.flushes();
        let reply = match session.apply(&buf) {
            Ok(()) => response(STATUS_OK, len as u32),
            Err(Rejection::UnknownId { at }) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("{peer}: unknown image id at byte {at}");
                response(STATUS_UNKNOWN_ID, at as u32)
            }
            Err(Rejection::Malformed { at }) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("{peer}: malformed command at byte {at}");
                response(STATUS_SHORT_WRITE, at as u32)
            }
        };
        stats
            .flushes
            .fetch_add(session.flushes() - before, Ordering::Relaxed);
        writer.write_all(&reply).await?;
    }
}

/// Resolves when `running` becomes false.
async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────
