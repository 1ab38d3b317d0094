//! Consumer side of the control protocol.
//!
//! Every call takes `&mut self` and reads the full response before
//! returning, so requests can never be pipelined. Any pipe failure or short
//! read marks the session broken; after `CloseServer` the session is closed.
//! Either way later calls fail with [`BridgeError::SessionBroken`] without
//! touching the pipe.

use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use super::protocol::{read_handle, read_len, read_status, read_text, Request};
use super::spawn::{WorkerHandle, WorkerSpawner};
use crate::error::{BridgeError, Result};
use crate::handle::Handle;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
    Broken(String),
}

/// A control session with one worker.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
    state: SessionState,
    worker: Option<WorkerHandle>,
}

impl ControlClient {
    /// Spawn a worker and open a session with it.
    pub fn spawn(spawner: &dyn WorkerSpawner) -> Result<Self> {
        let (stream, worker) = spawner
            .spawn()
            .map_err(|e| BridgeError::SessionBroken(format!("spawn worker: {e:#}")))?;
        let mut client = Self::new(stream);
        client.worker = Some(worker);
        Ok(client)
    }

    /// Session over an already-connected pipe with no worker to reap.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            state: SessionState::Open,
            worker: None,
        }
    }

    /// True until `CloseServer` completes or the pipe fails.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Create a server in the worker.
    pub fn create_server(&mut self) -> Result<Handle> {
        self.exchange(Request::CreateServer, read_handle)
    }

    /// Start `server` in the background.
    pub fn start_server(&mut self, server: Handle) -> Result<()> {
        let status = self.exchange(Request::StartServer(server), read_status)?;
        check(status, server)
    }

    /// Start `server` and wait until it is usable.
    pub fn up(&mut self, server: Handle) -> Result<()> {
        let status = self.exchange(Request::Up(server), read_status)?;
        check(status, server)
    }

    /// The worker's last error message for `server`.
    pub fn fetch_error_message(&mut self, server: Handle) -> Result<String> {
        let (status, prepared) = self.exchange(Request::FetchErrorMessage(server), |r| {
            Ok((read_status(r)?, read_len(r)?))
        })?;
        check(status, server)?;
        let text = self.exchange(Request::ReadErrorMessage(server), |r| {
            read_text(r).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        if text.len() != prepared as usize {
            log::warn!(
                "[control] {server}: error text is {} bytes, worker announced {prepared}",
                text.len()
            );
        }
        Ok(text)
    }

    /// Close `server` and end the session. The worker exits after replying.
    pub fn close_server(&mut self, server: Handle) -> Result<()> {
        let status = self.exchange(Request::CloseServer(server), read_status)?;
        self.state = SessionState::Closed;
        self.reap();
        check(status, server)
    }

    /// One request/response round trip.
    fn exchange<T>(
        &mut self,
        request: Request,
        read: impl FnOnce(&mut UnixStream) -> io::Result<T>,
    ) -> Result<T> {
        match &self.state {
            SessionState::Open => {}
            SessionState::Closed => {
                return Err(BridgeError::SessionBroken("session already closed".to_owned()))
            }
            SessionState::Broken(why) => return Err(BridgeError::SessionBroken(why.clone())),
        }

        log::debug!("[control] -> {request:?}");
        let result = self
            .stream
            .write_all(&request.encode())
            .and_then(|()| read(&mut self.stream));
        result.map_err(|e| {
            let why = format!("{request:?}: {e}");
            log::warn!("[control] session broken: {why}");
            self.state = SessionState::Broken(why.clone());
            BridgeError::SessionBroken(why)
        })
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.wait() {
                log::warn!("[control] worker exit: {e:#}");
            }
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        // End-of-stream tells the worker to exit.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.reap();
    }
}

fn check(status: i32, server: Handle) -> Result<()> {
    match BridgeError::from_status(status, server) {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::spawn::ThreadSpawner;
    use crate::runtime::LocalNet;
    use std::io::Read;
    use std::thread;

    #[test]
    fn test_create_twice_gives_distinct_handles() {
        let mut client = ControlClient::spawn(&ThreadSpawner::new(LocalNet::new())).unwrap();
        let a = client.create_server().unwrap();
        let b = client.create_server().unwrap();
        assert_ne!(a, b);
        client.close_server(a).unwrap();
    }

    #[test]
    fn test_request_after_close_is_session_broken() {
        let mut client = ControlClient::spawn(&ThreadSpawner::new(LocalNet::new())).unwrap();
        let server = client.create_server().unwrap();
        client.close_server(server).unwrap();
        assert!(!client.is_open());
        assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
        assert!(matches!(client.start_server(server), Err(BridgeError::SessionBroken(_))));
    }

    #[test]
    fn test_remote_status_is_not_session_failure() {
        let mut client = ControlClient::spawn(&ThreadSpawner::new(LocalNet::new())).unwrap();
        let server = client.create_server().unwrap();
        assert!(matches!(client.up(server), Err(BridgeError::Fatal(_))));
        assert!(client.is_open());
        assert!(client.fetch_error_message(server).unwrap().contains("needs login"));
        assert!(matches!(
            client.start_server(Handle::from_raw(1)),
            Err(BridgeError::BadHandle(_))
        ));
    }

    #[test]
    fn test_short_response_breaks_session() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let fake = thread::spawn(move || {
            let mut op = [0u8; 1];
            theirs.read_exact(&mut op).unwrap();
            // Two of the four handle bytes, then hang up.
            theirs.write_all(&[1, 0]).unwrap();
        });

        let mut client = ControlClient::new(ours);
        assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
        fake.join().unwrap();
        assert!(!client.is_open());
        assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
    }

    #[test]
    fn test_dead_worker_breaks_session() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        drop(theirs);
        let mut client = ControlClient::new(ours);
        assert!(matches!(client.create_server(), Err(BridgeError::SessionBroken(_))));
    }
}
