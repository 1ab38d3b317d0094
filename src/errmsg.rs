//! Error-message side channel.
//!
//! Every server handle owns an [`ErrorSlot`] holding the text of its most
//! recent failure. Failing operations overwrite the slot; nothing keeps
//! history, so a caller that needs the exact cause must fetch it before
//! issuing another operation on the same handle.
//!
//! Retrieval is capacity-bounded the way a C caller's buffer is: at most
//! `capacity - 1` bytes of text, always followed by a NUL terminator.

use std::sync::{Mutex, PoisonError};

use crate::error::{BridgeError, Result, STATUS_OK};

/// Last-error storage for one handle.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Mutex<String>,
}

impl ErrorSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored message.
    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("[errmsg] recording: {message}");
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = message;
    }

    /// Copy of the full stored message.
    #[must_use]
    pub fn message(&self) -> String {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch the stored message as it would appear in a `capacity`-byte buffer.
    ///
    /// Returns `InsufficientBuffer` when `capacity` is 0 (not even a NUL fits).
    /// Otherwise returns at most `capacity - 1` bytes, cut on a UTF-8
    /// character boundary.
    pub fn fetch(&self, capacity: usize) -> Result<String> {
        let message = self.message();
        Ok(truncate_message(&message, capacity)?.to_owned())
    }

    /// Copy the stored message into `buf` as a NUL-terminated C string.
    ///
    /// Returns `0` when the full message fit, `ERANGE` when it was truncated
    /// or `buf` is empty. The buffer is always NUL-terminated when non-empty.
    pub fn copy_into(&self, buf: &mut [u8]) -> i32 {
        let message = self.message();
        let Some(last) = buf.len().checked_sub(1) else {
            return libc::ERANGE;
        };
        let n = message.len().min(last);
        buf[..n].copy_from_slice(&message.as_bytes()[..n]);
        buf[n] = 0;
        if n < message.len() {
            libc::ERANGE
        } else {
            STATUS_OK
        }
    }
}

/// Cut `message` to fit a `capacity`-byte buffer that also holds a NUL.
pub fn truncate_message(message: &str, capacity: usize) -> Result<&str> {
    let Some(max) = capacity.checked_sub(1) else {
        return Err(BridgeError::InsufficientBuffer {
            needed: message.len() + 1,
            capacity,
        });
    };
    if message.len() <= max {
        return Ok(message);
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    Ok(&message[..end])
}
