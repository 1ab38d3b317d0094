//! Readiness-driven accept on tokio.
//!
//! A listener's receive endpoint turns readable when a connection is
//! pending. [`accept_ready`] registers a duplicate of that endpoint with the
//! reactor and retries the non-blocking accept each time it fires, so an
//! async task never parks a runtime thread in a blocking accept.

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::handle::Handle;
use crate::runtime::Runtime;

/// Wait until `listener` has a connection and accept it.
///
/// Returns the first result that is not `WouldBlock`, including
/// `ConnectionReset` once the listener is closed.
pub async fn accept_ready<R: Runtime>(bridge: &Bridge<R>, listener: Handle) -> Result<Handle> {
    match bridge.accept_nonblocking(listener) {
        Err(BridgeError::WouldBlock) => {}
        other => return other,
    }

    let fd = bridge.listener_fd(listener)?;
    let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)
        .map_err(|e| BridgeError::Fatal(format!("register listener {listener}: {e}")))?;

    loop {
        let mut guard = async_fd
            .readable()
            .await
            .map_err(|e| BridgeError::Fatal(format!("poll listener {listener}: {e}")))?;
        match bridge.accept_nonblocking(listener) {
            Err(BridgeError::WouldBlock) => guard.clear_ready(),
            other => return other,
        }
    }
}
