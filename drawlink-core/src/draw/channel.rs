//! The wire boundary.
//!
//! A [`DrawChannel`] is the narrow view the engine has of the remote draw
//! device: fire-and-forget writes, one response per write collected later
//! in the same order, and out-of-band error flags the protocol layer sets
//! on its own.

use crate::error::DrawError;
use crate::flags::ErrorFlags;

/// An ordered request/response channel to the remote draw device.
///
/// Responses arrive in the order writes were issued, so callers may match
/// them strictly FIFO.
pub trait DrawChannel: Send + Sync {
    /// Issue one atomic write without waiting for its response. Returns the
    /// number of bytes handed to the transport.
    fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError>;

    /// Block until the response to the oldest outstanding write arrives.
    /// Returns the byte count the remote reports as written.
    fn receive_one_response(&self) -> Result<usize, DrawError>;

    /// Error flags raised since the last call, clearing them.
    fn take_error_flags(&self) -> ErrorFlags;

    /// Largest write the remote accepts in one message, if negotiated.
    fn max_write(&self) -> Option<usize> {
        None
    }
}

impl<C: DrawChannel + ?Sized> DrawChannel for std::sync::Arc<C> {
    fn write_pipelined(&self, bytes: &[u8]) -> Result<usize, DrawError> {
        (**self).write_pipelined(bytes)
    }

    fn receive_one_response(&self) -> Result<usize, DrawError> {
        (**self).receive_one_response()
    }

    fn take_error_flags(&self) -> ErrorFlags {
        (**self).take_error_flags()
    }

    fn max_write(&self) -> Option<usize> {
        (**self).max_write()
    }
}
