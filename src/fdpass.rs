//! Descriptor transfer channel over a connected Unix socket pair.
//!
//! One end (the [`FdSender`]) belongs to the runtime side of a listener; the
//! other (the [`FdReceiver`]) belongs to the consumer. Each accepted
//! connection travels as exactly one message: the one-byte
//! [`FD_MARKER`] payload plus a single `SCM_RIGHTS` ancillary block carrying
//! the connection descriptor. Connection payload bytes never cross this
//! channel; they flow on the delivered descriptor.
//!
//! ```text
//! runtime pump ──sendmsg(marker + SCM_RIGHTS fd)──► FdReceiver::receive()
//!                                                    │
//!                                      Ok(fd) / WouldBlock / ConnectionReset / Fatal
//! ```
//!
//! Blocking is chosen per receive call (`MSG_DONTWAIT`), not per channel, so
//! the same receiver can be polled and then awaited.
//!
//! The platform mechanics sit behind [`DescriptorSender`] and
//! [`DescriptorReceiver`] so another channel implementation can replace the
//! Unix one without touching the acceptor.

// Rust guideline compliant 2026-02

use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::constants::{FD_MARKER, RECV_CONTROL_BUF, RECV_PAYLOAD_BUF};
use crate::error::BridgeError;

/// Why a receive produced no descriptor.
#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    /// Non-blocking receive found nothing queued.
    #[error("no descriptor pending")]
    WouldBlock,

    /// The sending side reset or closed the channel.
    #[error("descriptor channel closed by sender")]
    ConnectionReset,

    /// Any other transport failure or protocol violation.
    #[error("descriptor receive failed: {0}")]
    Fatal(String),
}

impl From<RecvError> for BridgeError {
    fn from(err: RecvError) -> Self {
        match err {
            RecvError::WouldBlock => Self::WouldBlock,
            RecvError::ConnectionReset => Self::ConnectionReset,
            RecvError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}

/// Runtime-side capability: hand one descriptor to the receiver.
pub trait DescriptorSender: Send + Sync {
    /// Send `fd` with the marker payload. The caller keeps its own copy.
    fn send_fd(&self, fd: BorrowedFd<'_>) -> io::Result<()>;
}

/// Consumer-side capability: take the next descriptor.
///
/// The receive endpoint is itself pollable through [`AsFd`].
pub trait DescriptorReceiver: AsFd + Send + Sync {
    /// Receive one descriptor, suspending only when `blocking` is set.
    fn receive(&self, blocking: bool) -> Result<OwnedFd, RecvError>;

    /// Shut the endpoint down, waking any receive blocked on it.
    fn shutdown(&self);
}

/// True when a send failed because the receiving end is gone.
#[must_use]
pub fn is_receiver_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPIPE) | Some(libc::ECONNRESET) | Some(libc::ENOTCONN)
    )
}

/// Create a connected sender/receiver pair.
pub fn channel() -> io::Result<(FdSender, FdReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    set_nosigpipe(&tx)?;
    Ok((FdSender { stream: tx }, FdReceiver { stream: rx }))
}

/// Apple platforms lack `MSG_NOSIGNAL`; suppress `SIGPIPE` per socket instead.
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_nosigpipe(stream: &UnixStream) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads exactly size_of::<c_int>() bytes from `one`.
    let ret = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ─── Send side ─────────────────────────────────────────────────────────────

/// Sending endpoint, owned by the runtime side of a listener.
#[derive(Debug)]
pub struct FdSender {
    stream: UnixStream,
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

impl DescriptorSender for FdSender {
    /// Send `fd` via `sendmsg` + `SCM_RIGHTS`.
    ///
    /// The kernel duplicates the descriptor into the message; the sender's
    /// copy stays valid and is the caller's to close. A vanished receiver
    /// reports `EPIPE` instead of raising `SIGPIPE`.
    fn send_fd(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let sock_fd = self.stream.as_raw_fd();
        let fd_size = std::mem::size_of::<libc::c_int>();
        // SAFETY: CMSG_SPACE is a pure size computation.
        let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
        let mut cmsg_buf = ControlBuf::new();

        let mut iov = libc::iovec {
            iov_base: FD_MARKER.as_ptr() as *mut libc::c_void,
            iov_len: FD_MARKER.len(),
        };

        // SAFETY: msghdr is plain old data; zeroed is a valid empty header and
        // avoids naming platform-specific padding fields.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_space as _;

        // SAFETY: msg_control points at an aligned buffer of at least
        // cmsg_space bytes, so CMSG_FIRSTHDR is non-null and the header plus
        // one c_int fit inside it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
            let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            std::ptr::write_unaligned(data_ptr, fd.as_raw_fd());
        }

        loop {
            // SAFETY: msg references live buffers for the duration of the call.
            let n = unsafe { libc::sendmsg(sock_fd, &msg, SEND_FLAGS) };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
    }
}

// ─── Receive side ──────────────────────────────────────────────────────────

/// Receiving endpoint, owned by the consumer.
///
/// Only one thread should block in [`DescriptorReceiver::receive`] at a
/// time; concurrent blocking receives on one endpoint are not serialized
/// here and must be serialized by the caller.
#[derive(Debug)]
pub struct FdReceiver {
    stream: UnixStream,
}

/// Ancillary buffer with the alignment `cmsghdr` requires.
#[repr(C, align(8))]
struct ControlBuf([u8; RECV_CONTROL_BUF]);

impl ControlBuf {
    fn new() -> Self {
        Self([0u8; RECV_CONTROL_BUF])
    }
}

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

impl DescriptorReceiver for FdReceiver {
    fn receive(&self, blocking: bool) -> Result<OwnedFd, RecvError> {
        let flags = if blocking {
            RECV_FLAGS
        } else {
            RECV_FLAGS | libc::MSG_DONTWAIT
        };

        loop {
            match recvmsg_one(self.stream.as_raw_fd(), flags) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(classify(&err)),
                Ok(Received { bytes: 0, fds, .. }) if fds.is_empty() => {
                    // Orderly EOF: the sender (or our own shutdown) ended the channel.
                    return Err(RecvError::ConnectionReset);
                }
                Ok(Received { truncated: true, .. }) => {
                    return Err(RecvError::Fatal(
                        "ancillary data truncated; descriptor lost".to_owned(),
                    ));
                }
                Ok(Received { fds, bytes, .. }) => {
                    let mut fds = fds.into_iter();
                    let Some(fd) = fds.next() else {
                        return Err(RecvError::Fatal(format!(
                            "message of {bytes} byte(s) carried no descriptor"
                        )));
                    };
                    let extra = fds.count();
                    if extra > 0 {
                        log::warn!("[fdpass] dropped {extra} extra descriptor(s) in one message");
                    }
                    return Ok(fd);
                }
            }
        }
    }

    fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("[fdpass] shutdown receiver: {e}");
            }
        }
    }
}

impl AsFd for FdReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn classify(err: &io::Error) -> RecvError {
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => RecvError::WouldBlock,
        Some(libc::ECONNRESET) => RecvError::ConnectionReset,
        _ => RecvError::Fatal(err.to_string()),
    }
}

struct Received {
    bytes: usize,
    fds: Vec<OwnedFd>,
    truncated: bool,
}

/// One `recvmsg` call with bounded payload and control buffers.
///
/// Every `SCM_RIGHTS` descriptor that arrives is wrapped in an `OwnedFd`
/// immediately so none leak, whatever the caller decides to keep.
fn recvmsg_one(sock_fd: RawFd, flags: libc::c_int) -> io::Result<Received> {
    let mut data_buf = [0u8; RECV_PAYLOAD_BUF];
    let mut cmsg_buf = ControlBuf::new();

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: data_buf.len(),
    };
    // SAFETY: zeroed msghdr is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.0.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = RECV_CONTROL_BUF as _;

    // SAFETY: msg references live, correctly sized buffers.
    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control with well-formed cmsghdrs up to
    // msg_controllen; CMSG_* walk stays inside that range.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let fd_count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..fd_count {
                    let fd: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>()) as *const libc::c_int,
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Received {
        bytes: n as usize,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}
