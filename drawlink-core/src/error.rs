//! Domain-specific error types for the drawlink engine.
//!
//! Fallible operations return `Result<T, DrawError>`. Cost decisions made by
//! the tile codec and the scroll detector are *not* errors: they come back as
//! `None` / `detected = false`. Only capacity bounds, configuration and the
//! transport boundary produce a `DrawError`.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the drawlink engine.
#[derive(Debug, Error)]
pub enum DrawError {
    // ── Capacity Errors ──────────────────────────────────────────
    /// A buffer would grow past its fixed bound.
    #[error("{what} too large: {size} bytes (max {max})")]
    CapacityExceeded {
        what: &'static str,
        size: usize,
        max: usize,
    },

    /// A tile was requested with an edge longer than the tile size.
    #[error("tile {width}x{height} exceeds the {max}px tile edge")]
    TileTooLarge { width: u32, height: u32, max: u32 },

    // ── Configuration Errors ─────────────────────────────────────
    /// Frame or rectangle dimensions that cannot be used.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A configuration value outside its permitted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The underlying I/O layer reported an error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote acknowledged fewer bytes than were written.
    #[error("short write: expected {expected} bytes, remote applied {actual}")]
    ShortWrite { expected: usize, actual: usize },

    /// The remote does not know an image id we referenced.
    #[error("remote reported unknown image id")]
    UnknownImage,

    /// The connection to the remote was reset.
    #[error("connection reset")]
    ConnectionReset,

    /// A response or token stream violated the wire grammar.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The pipeline is paused for an out-of-band operation.
    #[error("pipeline paused")]
    Paused,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A channel or handoff was closed by its peer.
    #[error("channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl DrawError {
    /// Whether this error means the remote image state can no longer be
    /// trusted (and the next frame must be a full resend).
    pub fn invalidates_remote(&self) -> bool {
        matches!(
            self,
            DrawError::Io(_)
                | DrawError::ShortWrite { .. }
                | DrawError::UnknownImage
                | DrawError::ConnectionReset
                | DrawError::ProtocolViolation(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for DrawError {
    fn from(s: String) -> Self {
        DrawError::Other(s)
    }
}

impl From<&str> for DrawError {
    fn from(s: &str) -> Self {
        DrawError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = DrawError::CapacityExceeded {
            what: "batch",
            size: 9000,
            max: 8192,
        };
        assert!(e.to_string().contains("9000"));
        assert!(e.to_string().contains("8192"));

        let e = DrawError::TileTooLarge {
            width: 32,
            height: 16,
            max: 16,
        };
        assert!(e.to_string().contains("32x16"));
    }

    #[test]
    fn from_string() {
        let e: DrawError = "something broke".into();
        assert!(matches!(e, DrawError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: DrawError = io_err.into();
        assert!(matches!(e, DrawError::Io(_)));
        assert!(e.invalidates_remote());
    }

    #[test]
    fn capacity_errors_keep_remote_state() {
        let e = DrawError::CapacityExceeded {
            what: "tile",
            size: 2,
            max: 1,
        };
        assert!(!e.invalidates_remote());
        assert!(!DrawError::Paused.invalidates_remote());
    }
}
