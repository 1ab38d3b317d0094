//! Error taxonomy shared by every bridge operation.
//!
//! Each fallible operation returns a [`BridgeError`] whose variant tells the
//! caller what to do next:
//!
//! - [`BridgeError::BadHandle`], [`BridgeError::SessionBroken`]: fix the call
//!   sequence (stale handle, dead control session).
//! - [`BridgeError::WouldBlock`]: retry later, not a real failure.
//! - [`BridgeError::InsufficientBuffer`]: retry with more capacity.
//! - [`BridgeError::ConnectionReset`]: the owning side of a listener is gone.
//! - [`BridgeError::Fatal`]: inspect the error-message side channel.
//!
//! [`BridgeError::status`] maps each variant onto the integer status surface
//! that foreign bindings expose.

use crate::handle::Handle;

/// Result alias used across the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Errors returned by bridge, acceptor, and control-session operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Stale, unknown, or already-closed handle.
    #[error("bad handle {0}")]
    BadHandle(Handle),

    /// Non-blocking accept found no pending connection.
    #[error("no connection pending")]
    WouldBlock,

    /// The sending side of a descriptor channel went away.
    #[error("descriptor channel reset by peer")]
    ConnectionReset,

    /// A fixed-capacity result did not fit.
    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    InsufficientBuffer {
        /// Bytes required, including the NUL terminator.
        needed: usize,
        /// Capacity the caller offered.
        capacity: usize,
    },

    /// Opaque failure; detail is in the error-message side channel.
    #[error("{0}")]
    Fatal(String),

    /// The control pipe failed mid-exchange or was already closed.
    #[error("control session broken: {0}")]
    SessionBroken(String),
}

/// Operation succeeded.
pub const STATUS_OK: i32 = 0;

/// Opaque failure; fetch details with `errmsg`.
pub const STATUS_FAILED: i32 = -1;

impl BridgeError {
    /// Integer status for this error as seen across a binding boundary.
    ///
    /// `EBADF` for bad handles, `ERANGE` for short buffers, `EAGAIN` for an
    /// empty non-blocking accept, `-1` for everything else.
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::BadHandle(_) => libc::EBADF,
            Self::InsufficientBuffer { .. } => libc::ERANGE,
            Self::WouldBlock => libc::EAGAIN,
            Self::ConnectionReset | Self::Fatal(_) | Self::SessionBroken(_) => STATUS_FAILED,
        }
    }

    /// Rebuild an error from a status code reported by a remote worker.
    ///
    /// `handle` is the handle the request was about. Returns `None` for
    /// [`STATUS_OK`].
    #[must_use]
    pub fn from_status(status: i32, handle: Handle) -> Option<Self> {
        match status {
            STATUS_OK => None,
            s if s == libc::EBADF => Some(Self::BadHandle(handle)),
            s if s == libc::ERANGE => Some(Self::InsufficientBuffer {
                needed: 0,
                capacity: 0,
            }),
            s if s == libc::EAGAIN => Some(Self::WouldBlock),
            s => Some(Self::Fatal(format!(
                "remote operation on {handle} failed with status {s}"
            ))),
        }
    }

    /// True when the caller may simply retry the same call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Collapse a result into its integer status.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.status(),
    }
}

/// Check that `text` plus a NUL terminator fits in `capacity` bytes.
pub(crate) fn ensure_fits(text: &str, capacity: usize) -> Result<()> {
    let needed = text.len() + 1;
    if needed > capacity {
        return Err(BridgeError::InsufficientBuffer { needed, capacity });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let h = Handle::from_raw(7);
        assert_eq!(BridgeError::BadHandle(h).status(), libc::EBADF);
        assert_eq!(
            BridgeError::InsufficientBuffer { needed: 4, capacity: 2 }.status(),
            libc::ERANGE
        );
        assert_eq!(BridgeError::WouldBlock.status(), libc::EAGAIN);
        assert_eq!(BridgeError::Fatal("boom".into()).status(), STATUS_FAILED);
        assert_eq!(BridgeError::ConnectionReset.status(), STATUS_FAILED);
        assert_eq!(status_of::<()>(&Ok(())), STATUS_OK);
    }

    #[test]
    fn test_from_status_restores_bad_handle() {
        let h = Handle::from_raw(3);
        assert!(BridgeError::from_status(STATUS_OK, h).is_none());
        match BridgeError::from_status(libc::EBADF, h) {
            Some(BridgeError::BadHandle(got)) => assert_eq!(got, h),
            other => panic!("expected BadHandle, got {other:?}"),
        }
        assert!(matches!(
            BridgeError::from_status(-1, h),
            Some(BridgeError::Fatal(_))
        ));
    }

    #[test]
    fn test_ensure_fits_counts_terminator() {
        assert!(ensure_fits("abc", 4).is_ok());
        match ensure_fits("abc", 3) {
            Err(BridgeError::InsufficientBuffer { needed, capacity }) => {
                assert_eq!(needed, 4);
                assert_eq!(capacity, 3);
            }
            other => panic!("expected InsufficientBuffer, got {other:?}"),
        }
    }
}
