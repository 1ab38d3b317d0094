//! tsnet-bridge: hand connected tailnet sockets to another thread, process,
//! or language runtime.
//!
//! # Overview
//!
//! A [`Bridge`] drives a network [`runtime`] through integer handles:
//!
//! - **Handles** ([`handle`]): per-category tables that reject stale or
//!   double-closed handles.
//! - **Descriptor transfer** ([`fdpass`]): one connection descriptor per
//!   message over a Unix socket pair, using `SCM_RIGHTS`.
//! - **Acceptor** ([`acceptor`]): blocking and non-blocking accept on top of
//!   descriptor transfer, plus [`readiness`] for tokio.
//! - **Control protocol** ([`control`]): opcode request/response over a pipe
//!   to a worker that owns the runtime.
//! - **Error messages** ([`errmsg`]): bounded retrieval of the last failure
//!   on a server.
//!
//! ```no_run
//! use tsnet_bridge::Bridge;
//!
//! let bridge = Bridge::default();
//! let server = bridge.new_server();
//! bridge.set_authkey(server, "tskey-example")?;
//! bridge.up(server)?;
//! let listener = bridge.listen(server, "tcp", ":8081")?;
//! let conn = bridge.accept(listener)?;
//! let socket = bridge.conn_stream(conn)?;
//! # drop(socket);
//! # Ok::<(), tsnet_bridge::BridgeError>(())
//! ```

pub mod acceptor;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod control;
pub mod errmsg;
pub mod error;
pub mod fdpass;
pub mod handle;
pub mod readiness;
pub mod runtime;

pub use bridge::{Bridge, Credential, Loopback};
pub use config::Config;
pub use error::{status_of, BridgeError, Result, STATUS_FAILED, STATUS_OK};
pub use handle::{Handle, HandleKind};
pub use runtime::{LocalNet, Runtime};
