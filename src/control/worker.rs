//! Worker side of the control protocol.
//!
//! The worker owns a [`Bridge`] and answers one request at a time until it
//! sees `CloseServer`, the pipe reaches end-of-stream, or the pipe breaks.
//!
//! ```text
//! consumer ──[op][args]──► ControlWorker::serve ──► Bridge verb
//!          ◄──[result]────
//! ```
//!
//! Error text travels in two steps: `FetchErrorMessage` snapshots the
//! server's current message and reports its length, `ReadErrorMessage`
//! transfers that snapshot. A failing call between the two cannot change
//! what the consumer reads.

use std::collections::HashMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};

use super::protocol::{encode_text, write_response, ProtocolError, Request};
use crate::bridge::Bridge;
use crate::config::Config;
use crate::constants::MAX_ERROR_TEXT;
use crate::error::{status_of, STATUS_OK};
use crate::handle::Handle;
use crate::runtime::Runtime;

/// Serves control requests against a bridge.
#[derive(Debug)]
pub struct ControlWorker<R: Runtime> {
    bridge: Bridge<R>,
    config: Option<Config>,
    snapshots: HashMap<Handle, String>,
}

/// What the loop does after answering a request.
enum Next {
    Continue,
    Exit,
}

impl<R: Runtime> ControlWorker<R> {
    /// Worker over `bridge`.
    #[must_use]
    pub fn new(bridge: Bridge<R>) -> Self {
        Self {
            bridge,
            config: None,
            snapshots: HashMap::new(),
        }
    }

    /// Apply `config` to every server created through `CreateServer`.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Answer requests on `stream` until the session ends.
    ///
    /// A clean end-of-stream or `CloseServer` returns `Ok`; a short read,
    /// broken pipe, or unknown opcode returns an error.
    pub fn serve<S: Read + Write>(mut self, mut stream: S) -> Result<()> {
        log::info!("[worker] control session started");
        loop {
            let request = match Request::read_from(&mut stream) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    log::info!("[worker] consumer closed the pipe");
                    return Ok(());
                }
                Err(ProtocolError::UnknownOpcode(op)) => {
                    log::warn!("[worker] unknown opcode {op:#04x}, ending session");
                    anyhow::bail!("unknown opcode {op:#04x}");
                }
                Err(e) => return Err(e).context("read control request"),
            };

            log::debug!("[worker] <- {request:?}");
            let (response, next) = self.handle(request);
            write_response(&mut stream, &response).context("write control response")?;

            if let Next::Exit = next {
                log::info!("[worker] server closed, exiting");
                return Ok(());
            }
        }
    }

    fn handle(&mut self, request: Request) -> (Vec<u8>, Next) {
        match request {
            Request::CreateServer => {
                let server = self.bridge.new_server();
                if let Some(config) = self.config.as_ref() {
                    if let Err(e) = self.bridge.apply_config(server, config) {
                        log::warn!("[worker] applying config to {server}: {e}");
                    }
                }
                (server.as_raw().to_le_bytes().to_vec(), Next::Continue)
            }
            Request::StartServer(server) => {
                let status = status_of(&self.bridge.start(server));
                (status.to_le_bytes().to_vec(), Next::Continue)
            }
            Request::Up(server) => {
                let status = status_of(&self.bridge.up(server));
                (status.to_le_bytes().to_vec(), Next::Continue)
            }
            Request::FetchErrorMessage(server) => {
                let (status, len) = match self.bridge.errmsg(server, MAX_ERROR_TEXT + 1) {
                    Ok(text) => {
                        let len = text.len() as u32;
                        self.snapshots.insert(server, text);
                        (STATUS_OK, len)
                    }
                    Err(e) => (e.status(), 0),
                };
                let mut out = status.to_le_bytes().to_vec();
                out.extend_from_slice(&len.to_le_bytes());
                (out, Next::Continue)
            }
            Request::ReadErrorMessage(server) => {
                let text = self.snapshots.remove(&server).unwrap_or_default();
                (encode_text(&text), Next::Continue)
            }
            Request::CloseServer(server) => {
                self.snapshots.remove(&server);
                let status = status_of(&self.bridge.close(server));
                (status.to_le_bytes().to_vec(), Next::Exit)
            }
        }
    }
}
