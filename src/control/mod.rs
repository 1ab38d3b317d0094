//! Control protocol engine: drive a runtime living in another process.
//!
//! # Architecture
//!
//! ```text
//! ControlClient ──[op][args]──► pipe ──► ControlWorker ──► Bridge<R>
//!               ◄──[result]────      ◄──
//! ```
//!
//! A [`WorkerSpawner`] starts the worker and hands back the consumer end of
//! a Unix socket pair. [`ProcessSpawner`] re-executes `tsnet-bridge worker`
//! with the other end as stdin; [`ThreadSpawner`] runs the same loop on a
//! thread, which is what the tests use.
//!
//! # Session rules
//!
//! - One request in flight; the client API takes `&mut self` per call.
//! - `CloseServer` ends the session; the worker exits after replying.
//! - A short read or broken pipe ends the session as
//!   [`crate::BridgeError::SessionBroken`]. A remote failure inside a
//!   well-formed response is an ordinary status and leaves the session open.

pub mod client;
pub mod protocol;
pub mod spawn;
pub mod worker;

pub use client::ControlClient;
pub use protocol::{opcode, Request};
pub use spawn::{ProcessSpawner, ThreadSpawner, WorkerHandle, WorkerSpawner};
pub use worker::ControlWorker;
