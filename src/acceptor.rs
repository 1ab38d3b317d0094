//! Listeners and accept: the consumer side of descriptor transfer.
//!
//! `listen` asks the runtime for a listener, creates a descriptor channel,
//! and starts a pump thread that feeds the channel. `accept` then reads one
//! descriptor off the channel and registers it as a connection handle.
//!
//! ```text
//! NodeListener::accept ──► pump thread ──send_fd──► FdReceiver
//!                                                    │ receive(blocking)
//!                                                    ▼
//!                                      Bridge::accept → conn Handle
//! ```
//!
//! # Cancellation
//!
//! A blocking `accept` has no timeout. `close_listener` from another thread
//! shuts the receive endpoint down, which makes the blocked call return
//! [`BridgeError::ConnectionReset`].
//!
//! # Concurrency
//!
//! Two threads blocking in `accept` on the same listener is not supported;
//! callers must serialize accepts per listener. Use `accept_nonblocking`
//! with `listener_fd` (or [`crate::readiness`]) to multiplex instead.

// Rust guideline compliant 2026-02

use std::io;
use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::bridge::{Bridge, ConnEntry, ListenerOf};
use crate::error::{BridgeError, Result};
use crate::fdpass::{self, is_receiver_gone, DescriptorReceiver, DescriptorSender};
use crate::handle::Handle;
use crate::runtime::{FunnelMode, Node, NodeListener, Runtime};

/// Everything a listener handle owns.
pub(crate) struct ListenerEntry<L> {
    pub(crate) server: Handle,
    pub(crate) runtime: Arc<L>,
    receiver: Box<dyn DescriptorReceiver>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Runtime> Bridge<R> {
    /// Listen on `addr` over `network`; returns a listener handle.
    pub fn listen(&self, server: Handle, network: &str, addr: &str) -> Result<Handle> {
        let listener = self.with_node(server, |node| node.listen(network, addr, None))?;
        self.register_listener(server, listener, addr)
    }

    /// Listen through funnel. With `funnel_only`, tailnet traffic is refused.
    pub fn listen_funnel(
        &self,
        server: Handle,
        network: &str,
        addr: &str,
        funnel_only: bool,
    ) -> Result<Handle> {
        let mode = if funnel_only {
            FunnelMode::FunnelOnly
        } else {
            FunnelMode::Shared
        };
        let listener = self.with_node(server, |node| node.listen(network, addr, Some(mode)))?;
        self.register_listener(server, listener, addr)
    }

    fn register_listener(
        &self,
        server: Handle,
        listener: ListenerOf<R>,
        addr: &str,
    ) -> Result<Handle> {
        let listener = Arc::new(listener);
        let (sender, receiver) = match fdpass::channel() {
            Ok(pair) => pair,
            Err(e) => {
                listener.close();
                return Err(self.fail(server, &anyhow::Error::new(e).context("descriptor channel")));
            }
        };

        let spawned = {
            let listener = Arc::clone(&listener);
            let label = format!("{server}/{addr}");
            thread::Builder::new()
                .name(format!("tsnet-pump-{server}"))
                .spawn(move || pump(&*listener, &sender, &label))
        };
        let pump = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                listener.close();
                return Err(self.fail(server, &anyhow::Error::new(e).context("spawn listener pump")));
            }
        };

        let handle = self.listeners.allocate(ListenerEntry {
            server,
            runtime: listener,
            receiver: Box::new(receiver),
            pump: Mutex::new(Some(pump)),
        });
        log::info!("[acceptor] {server}: listening on {addr} as listener {handle}");
        Ok(handle)
    }

    /// Wait for the next connection on `listener`.
    pub fn accept(&self, listener: Handle) -> Result<Handle> {
        self.take_next(listener, true)
    }

    /// Take a pending connection, or fail with `WouldBlock` right away.
    pub fn accept_nonblocking(&self, listener: Handle) -> Result<Handle> {
        self.take_next(listener, false)
    }

    fn take_next(&self, listener: Handle, blocking: bool) -> Result<Handle> {
        // The Arc keeps the receiver alive without holding the table lock.
        let entry = self.listeners.get(listener)?;
        let fd = entry
            .receiver
            .receive(blocking)
            .map_err(|e| self.note(entry.server, BridgeError::from(e)))?;
        let conn = self.conns.allocate(ConnEntry {
            server: entry.server,
            listener: Some(listener),
            fd,
        });
        log::debug!("[acceptor] listener {listener}: accepted conn {conn}");
        Ok(conn)
    }

    /// Duplicate of `listener`'s receive endpoint, for readiness polling.
    ///
    /// The endpoint turns readable when a connection is pending, or when
    /// the listener is closed.
    pub fn listener_fd(&self, listener: Handle) -> Result<OwnedFd> {
        let entry = self.listeners.get(listener)?;
        entry.receiver.as_fd().try_clone_to_owned().map_err(|e| {
            self.note(
                entry.server,
                BridgeError::Fatal(format!("dup listener {listener}: {e}")),
            )
        })
    }

    /// Stop `listener`, wake any blocked accept, and retire the handle.
    pub fn close_listener(&self, listener: Handle) -> Result<()> {
        let entry = self.listeners.close(listener)?;
        entry.runtime.close();
        entry.receiver.shutdown();
        let pump = entry
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            if pump.join().is_err() {
                log::warn!("[acceptor] listener {listener}: pump thread panicked");
            }
        }
        log::info!("[acceptor] closed listener {listener}");
        Ok(())
    }

    /// Live listener handles belonging to `server`.
    #[must_use]
    pub fn listeners_of(&self, server: Handle) -> Vec<Handle> {
        self.listeners.handles_where(|l| l.server == server)
    }
}

/// Move every connection the runtime accepts onto the channel.
///
/// Returns when the runtime listener fails or closes, or when the receiving
/// end of the channel is gone.
fn pump<L: NodeListener>(listener: &L, sender: &dyn DescriptorSender, label: &str) {
    loop {
        let conn = match listener.accept() {
            Ok(fd) => fd,
            Err(e) => {
                log::debug!("[acceptor] {label}: runtime listener done: {e:#}");
                return;
            }
        };
        if let Err(e) = sender.send_fd(conn.as_fd()) {
            report_send_failure(label, &e);
            listener.close();
            return;
        }
        // `conn` drops here; the receiver holds its own copy.
    }
}

fn report_send_failure(label: &str, err: &io::Error) {
    if is_receiver_gone(err) {
        log::debug!("[acceptor] {label}: receiver gone, stopping pump");
    } else {
        log::warn!("[acceptor] {label}: descriptor send failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LocalNet;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn pair() -> (Bridge<LocalNet>, Handle, Handle) {
        let bridge = Bridge::default();
        let mut servers = Vec::new();
        for name in ["server", "client"] {
            let s = bridge.new_server();
            bridge.set_hostname(s, name).unwrap();
            bridge.set_authkey(s, "tskey-test").unwrap();
            bridge.up(s).unwrap();
            servers.push(s);
        }
        (bridge, servers[0], servers[1])
    }

    fn accept_within(bridge: &Bridge<LocalNet>, ln: Handle) -> Handle {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match bridge.accept_nonblocking(ln) {
                Ok(conn) => return conn,
                Err(BridgeError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept_nonblocking: {e}"),
            }
        }
    }

    #[test]
    fn test_nonblocking_accept_empty_then_exactly_once() {
        let (bridge, server, client) = pair();
        let ln = bridge.listen(server, "tcp", ":8100").unwrap();

        let started = Instant::now();
        assert!(matches!(bridge.accept_nonblocking(ln), Err(BridgeError::WouldBlock)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let _dialed = bridge.dial(client, "tcp", "100.64.0.1:8100").unwrap();
        let _conn = accept_within(&bridge, ln);
        assert!(matches!(bridge.accept_nonblocking(ln), Err(BridgeError::WouldBlock)));
    }

    #[test]
    fn test_wouldblock_is_not_recorded() {
        let (bridge, server, _) = pair();
        let ln = bridge.listen(server, "tcp", ":8101").unwrap();
        assert!(bridge.accept_nonblocking(ln).is_err());
        assert_eq!(bridge.errmsg(server, 64).unwrap(), "");
    }

    #[test]
    fn test_blocking_accept_matches_dial() {
        let (bridge, server, client) = pair();
        let ln = bridge.listen(server, "tcp", ":8102").unwrap();
        let dialed = bridge.dial(client, "tcp", "100.64.0.1:8102").unwrap();
        let accepted = bridge.accept(ln).unwrap();

        let mut w = bridge.conn_stream(dialed).unwrap();
        w.write_all(b"one two three").unwrap();
        bridge.close_conn(dialed).unwrap();
        drop(w);

        let mut out = String::new();
        bridge.conn_stream(accepted).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "one two three");
    }

    #[test]
    fn test_close_listener_wakes_blocked_accept() {
        let (bridge, server, _) = pair();
        let bridge = Arc::new(bridge);
        let ln = bridge.listen(server, "tcp", ":8103").unwrap();

        let waiter = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.accept(ln))
        };
        thread::sleep(Duration::from_millis(50));
        bridge.close_listener(ln).unwrap();

        let result = waiter.join().unwrap();
        assert!(matches!(
            result,
            Err(BridgeError::ConnectionReset) | Err(BridgeError::Fatal(_))
        ));
    }

    #[test]
    fn test_closed_listener_is_bad_handle() {
        let (bridge, server, _) = pair();
        let ln = bridge.listen(server, "tcp", ":8104").unwrap();
        bridge.close_listener(ln).unwrap();
        assert!(matches!(bridge.accept(ln), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.accept_nonblocking(ln), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.close_listener(ln), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.listener_fd(ln), Err(BridgeError::BadHandle(_))));
    }

    #[test]
    fn test_listen_port_reusable_after_close() {
        let (bridge, server, _) = pair();
        let ln = bridge.listen(server, "tcp", ":8105").unwrap();
        assert!(bridge.listen(server, "tcp", ":8105").is_err());
        bridge.close_listener(ln).unwrap();
        assert!(bridge.listen(server, "tcp", ":8105").is_ok());
    }

    #[test]
    fn test_closing_server_closes_its_listeners() {
        let (bridge, server, _) = pair();
        let a = bridge.listen(server, "tcp", ":8106").unwrap();
        let b = bridge.listen(server, "tcp", ":8107").unwrap();
        assert_eq!(bridge.listeners_of(server), vec![a, b]);
        bridge.close(server).unwrap();
        assert!(bridge.listeners_of(server).is_empty());
        assert!(matches!(bridge.accept(a), Err(BridgeError::BadHandle(_))));
    }

    #[test]
    fn test_funnel_listener() {
        let (bridge, server, client) = pair();
        assert!(bridge.listen_funnel(server, "tcp", ":8108", false).is_err());
        assert!(bridge.errmsg(server, 256).unwrap().contains("funnel"));

        let shared = bridge.listen_funnel(server, "tcp", ":443", false).unwrap();
        let _d = bridge.dial(client, "tcp", "100.64.0.1:443").unwrap();
        let _c = bridge.accept(shared).unwrap();

        let _only = bridge.listen_funnel(server, "tcp", ":8443", true).unwrap();
        assert!(bridge.dial(client, "tcp", "100.64.0.1:8443").is_err());
    }
}
