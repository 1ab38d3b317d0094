//! The bridge: handle tables plus every verb a binding exposes.
//!
//! ```text
//!             ┌──────────── Bridge<R> ────────────┐
//!  new ──────►│ servers   HandleTable<Server>     │── Node (runtime)
//!  listen ───►│ listeners HandleTable<Listener>   │── pump thread ─► FdSender
//!  accept ───►│ conns     HandleTable<Conn>       │◄─ FdReceiver
//!             └───────────────────────────────────┘
//! ```
//!
//! Every server owns an [`ErrorSlot`]. Runtime failures on a server, or on a
//! listener or connection that server produced, are written there and
//! surface to the caller as [`BridgeError::Fatal`].
//!
//! The acceptor half of the surface (`listen`, `accept`, `close_listener`, ...)
//! lives in [`crate::acceptor`].

use std::fmt;
use std::net::IpAddr;
use std::os::unix::io::{AsFd, OwnedFd};
use std::path::Path;

use crate::acceptor::ListenerEntry;
use crate::config::Config;
use crate::constants::{
    CONN_HANDLE_BASE, CREDENTIAL_CSTR_LEN, CREDENTIAL_LEN, LISTENER_HANDLE_BASE,
    SERVER_HANDLE_BASE,
};
use crate::errmsg::ErrorSlot;
use crate::error::{ensure_fits, BridgeError, Result};
use crate::handle::{Handle, HandleKind, HandleTable};
use crate::runtime::{LocalNet, Node, NodeListener, NodeOption, Runtime};

/// Node type of runtime `R`.
pub(crate) type NodeOf<R> = <R as Runtime>::Node;

/// Listener type of runtime `R`.
pub(crate) type ListenerOf<R> = <NodeOf<R> as Node>::Listener;

pub(crate) struct ServerEntry<N> {
    pub(crate) node: N,
    pub(crate) errors: ErrorSlot,
}

pub(crate) struct ConnEntry {
    pub(crate) server: Handle,
    /// Listener that accepted this connection; `None` for dialed ones.
    pub(crate) listener: Option<Handle>,
    pub(crate) fd: OwnedFd,
}

/// Handle tables and verbs for one runtime.
pub struct Bridge<R: Runtime> {
    runtime: R,
    pub(crate) servers: HandleTable<ServerEntry<NodeOf<R>>>,
    pub(crate) listeners: HandleTable<ListenerEntry<ListenerOf<R>>>,
    pub(crate) conns: HandleTable<ConnEntry>,
}

impl<R: Runtime> fmt::Debug for Bridge<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("servers", &self.servers)
            .field("listeners", &self.listeners)
            .field("conns", &self.conns)
            .finish_non_exhaustive()
    }
}

impl Default for Bridge<LocalNet> {
    fn default() -> Self {
        Self::with_runtime(LocalNet::new())
    }
}

/// One loopback credential: exactly 32 bytes of token text.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential([u8; CREDENTIAL_LEN]);

impl Credential {
    /// Wrap a token; fails unless it is exactly [`CREDENTIAL_LEN`] bytes.
    pub fn new(token: &str) -> Result<Self> {
        let bytes: [u8; CREDENTIAL_LEN] = token.as_bytes().try_into().map_err(|_| {
            BridgeError::Fatal(format!(
                "loopback credential is {} bytes, expected {CREDENTIAL_LEN}",
                token.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// The raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CREDENTIAL_LEN] {
        &self.0
    }

    /// Token as text. Tokens are ASCII, so this is lossless.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    /// NUL-terminated form for callers that need a C string.
    #[must_use]
    pub fn to_cstr_bytes(&self) -> [u8; CREDENTIAL_CSTR_LEN] {
        let mut out = [0u8; CREDENTIAL_CSTR_LEN];
        out[..CREDENTIAL_LEN].copy_from_slice(&self.0);
        out
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Loopback surface of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loopback {
    /// `host:port` of the bound local surface.
    pub addr: String,
    /// Proxy password.
    pub proxy_cred: Credential,
    /// Bearer credential for the local administrative API.
    pub local_api_cred: Credential,
}

impl<R: Runtime> Bridge<R> {
    /// Create a bridge driving `runtime`. No servers exist yet.
    #[must_use]
    pub fn with_runtime(runtime: R) -> Self {
        Self {
            runtime,
            servers: HandleTable::new(HandleKind::Server, SERVER_HANDLE_BASE),
            listeners: HandleTable::new(HandleKind::Listener, LISTENER_HANDLE_BASE),
            conns: HandleTable::new(HandleKind::Conn, CONN_HANDLE_BASE),
        }
    }

    /// The runtime this bridge drives.
    #[must_use]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Record `err` on `server`'s error slot and turn it into `Fatal`.
    ///
    /// A server that is already gone has nowhere to store the text; the
    /// error still reaches the caller.
    pub(crate) fn fail(&self, server: Handle, err: &anyhow::Error) -> BridgeError {
        let message = format!("{err:#}");
        match self.servers.get(server) {
            Ok(entry) => entry.errors.record(message.clone()),
            Err(_) => log::debug!("[bridge] {server} gone, dropping error: {message}"),
        }
        BridgeError::Fatal(message)
    }

    /// Record a bridge-level error (reset, fatal receive) on `server`.
    pub(crate) fn note(&self, server: Handle, err: BridgeError) -> BridgeError {
        if matches!(err, BridgeError::Fatal(_) | BridgeError::ConnectionReset) {
            if let Ok(entry) = self.servers.get(server) {
                entry.errors.record(err.to_string());
            }
        }
        err
    }

    /// Run a runtime call against `server`'s node, recording any failure.
    pub(crate) fn with_node<T>(
        &self,
        server: Handle,
        op: impl FnOnce(&NodeOf<R>) -> anyhow::Result<T>,
    ) -> Result<T> {
        let entry = self.servers.get(server)?;
        op(&entry.node).map_err(|e| self.fail(server, &e))
    }

    // ─── Server lifecycle ──────────────────────────────────────────────────

    /// Create a server (runtime node) and return its handle.
    pub fn new_server(&self) -> Handle {
        let handle = self.servers.allocate(ServerEntry {
            node: self.runtime.new_node(),
            errors: ErrorSlot::new(),
        });
        log::debug!("[bridge] created server {handle}");
        handle
    }

    /// Start the server in the background.
    pub fn start(&self, server: Handle) -> Result<()> {
        self.with_node(server, Node::start)
    }

    /// Start the server and wait until it is usable.
    pub fn up(&self, server: Handle) -> Result<()> {
        self.with_node(server, Node::up)
    }

    /// Shut the server down and retire its handle.
    ///
    /// Listeners the server produced are closed too. Connections already
    /// handed out stay open; they belong to the caller.
    pub fn close(&self, server: Handle) -> Result<()> {
        let entry = self.servers.close(server)?;
        for listener in self.listeners.handles_where(|l| l.server == server) {
            if let Err(e) = self.close_listener(listener) {
                log::debug!("[bridge] closing listener {listener} of {server}: {e}");
            }
        }
        log::info!("[bridge] closing server {server}");
        entry
            .node
            .close()
            .map_err(|e| BridgeError::Fatal(format!("{e:#}")))
    }

    // ─── Options ───────────────────────────────────────────────────────────

    fn configure(&self, server: Handle, option: NodeOption) -> Result<()> {
        log::debug!("[bridge] {server}: set {option}");
        self.with_node(server, move |node| node.configure(option))
    }

    /// Set the state directory.
    pub fn set_dir(&self, server: Handle, dir: impl AsRef<Path>) -> Result<()> {
        self.configure(server, NodeOption::Dir(dir.as_ref().to_path_buf()))
    }

    /// Set the tailnet hostname.
    pub fn set_hostname(&self, server: Handle, hostname: &str) -> Result<()> {
        self.configure(server, NodeOption::Hostname(hostname.to_owned()))
    }

    /// Set the auth key.
    pub fn set_authkey(&self, server: Handle, authkey: &str) -> Result<()> {
        self.configure(server, NodeOption::AuthKey(authkey.to_owned()))
    }

    /// Set the coordination server URL.
    pub fn set_control_url(&self, server: Handle, url: &str) -> Result<()> {
        self.configure(server, NodeOption::ControlUrl(url.to_owned()))
    }

    /// Mark the server ephemeral.
    pub fn set_ephemeral(&self, server: Handle, ephemeral: bool) -> Result<()> {
        self.configure(server, NodeOption::Ephemeral(ephemeral))
    }

    /// Send node log lines to `fd`, or discard them with `None`.
    pub fn set_logfd(&self, server: Handle, fd: Option<OwnedFd>) -> Result<()> {
        self.configure(server, NodeOption::LogFd(fd))
    }

    /// Push every field set in `config` through the option verbs.
    ///
    /// Must run before the server starts.
    pub fn apply_config(&self, server: Handle, config: &Config) -> Result<()> {
        if let Some(dir) = config.state_dir.as_ref() {
            self.set_dir(server, dir)?;
        }
        if let Some(hostname) = config.hostname.as_deref() {
            self.set_hostname(server, hostname)?;
        }
        if let Some(authkey) = config.authkey.as_deref() {
            self.set_authkey(server, authkey)?;
        }
        if let Some(url) = config.control_url.as_deref() {
            self.set_control_url(server, url)?;
        }
        if config.ephemeral {
            self.set_ephemeral(server, true)?;
        }
        Ok(())
    }

    // ─── Connections ───────────────────────────────────────────────────────

    /// Dial `addr` over `network` from `server`; returns a connection handle.
    pub fn dial(&self, server: Handle, network: &str, addr: &str) -> Result<Handle> {
        let fd = self.with_node(server, |node| node.dial(network, addr))?;
        let conn = self.conns.allocate(ConnEntry {
            server,
            listener: None,
            fd,
        });
        log::debug!("[bridge] {server}: dialed {network} {addr} as conn {conn}");
        Ok(conn)
    }

    /// Read/write access to a connection through a duplicated descriptor.
    ///
    /// The handle stays live; closing the returned socket does not close it.
    pub fn conn_stream(&self, conn: Handle) -> Result<socket2::Socket> {
        let entry = self.conns.get(conn)?;
        let dup = entry
            .fd
            .try_clone()
            .map_err(|e| self.note(entry.server, BridgeError::Fatal(format!("dup conn {conn}: {e}"))))?;
        Ok(socket2::Socket::from(dup))
    }

    /// Retire `conn` and hand its descriptor to the caller.
    pub fn take_conn(&self, conn: Handle) -> Result<OwnedFd> {
        let entry = self.conns.close(conn)?;
        match std::sync::Arc::try_unwrap(entry) {
            Ok(entry) => Ok(entry.fd),
            // Another thread is mid-call on this conn; give the caller its own copy.
            Err(shared) => shared.fd.try_clone().map_err(|e| {
                self.note(shared.server, BridgeError::Fatal(format!("dup conn {conn}: {e}")))
            }),
        }
    }

    /// Close a connection handle and its descriptor.
    pub fn close_conn(&self, conn: Handle) -> Result<()> {
        self.conns.close(conn).map(drop)
    }

    /// Tailnet address of the peer on `conn`, which `listener` accepted.
    ///
    /// The text plus a NUL terminator must fit in `capacity` bytes.
    pub fn getremoteaddr(&self, listener: Handle, conn: Handle, capacity: usize) -> Result<String> {
        let entry = self.listeners.get(listener)?;
        let conn_entry = self.conns.get(conn)?;
        if conn_entry.listener != Some(listener) {
            return Err(self.note(
                entry.server,
                BridgeError::Fatal(format!("conn {conn} was not accepted by listener {listener}")),
            ));
        }
        let addr = entry
            .runtime
            .remote_addr(conn_entry.fd.as_fd())
            .map_err(|e| self.fail(entry.server, &e))?;
        let text = addr.ip().to_string();
        ensure_fits(&text, capacity)?;
        Ok(text)
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    /// The server's addresses, comma-separated.
    pub fn getips(&self, server: Handle, capacity: usize) -> Result<String> {
        let ips = self.with_node(server, Node::ips)?;
        let text = join(&ips);
        ensure_fits(&text, capacity)?;
        Ok(text)
    }

    /// Domains the server can get certificates for, comma-separated.
    pub fn cert_domains(&self, server: Handle, capacity: usize) -> Result<String> {
        let domains = self.with_node(server, Node::cert_domains)?;
        let text = domains.join(",");
        ensure_fits(&text, capacity)?;
        Ok(text)
    }

    /// Bind the loopback surface and return its address and credentials.
    ///
    /// `addr_capacity` bounds the address text plus NUL; credentials always
    /// need [`CREDENTIAL_CSTR_LEN`] bytes in their C form.
    pub fn loopback(&self, server: Handle, addr_capacity: usize) -> Result<Loopback> {
        let info = self.with_node(server, Node::loopback)?;
        ensure_fits(&info.addr, addr_capacity)?;
        let creds = Credential::new(&info.proxy_cred)
            .and_then(|p| Ok((p, Credential::new(&info.local_api_cred)?)))
            .map_err(|e| self.note(server, e))?;
        Ok(Loopback {
            addr: info.addr,
            proxy_cred: creds.0,
            local_api_cred: creds.1,
        })
    }

    // ─── Error messages ────────────────────────────────────────────────────

    /// Last error recorded on `server`, cut to fit `capacity` bytes with NUL.
    pub fn errmsg(&self, server: Handle, capacity: usize) -> Result<String> {
        self.servers.get(server)?.errors.fetch(capacity)
    }

    /// C-style copy of the last error into `buf`, always NUL-terminated.
    ///
    /// Returns `0`, `EBADF` for an unknown server, or `ERANGE` when the text
    /// was truncated or `buf` is empty.
    pub fn errmsg_into(&self, server: Handle, buf: &mut [u8]) -> i32 {
        match self.servers.get(server) {
            Ok(entry) => entry.errors.copy_into(buf),
            Err(e) => e.status(),
        }
    }

    /// Live server handles.
    #[must_use]
    pub fn servers(&self) -> Vec<Handle> {
        self.servers.handles_where(|_| true)
    }
}

impl<R: Runtime> Drop for Bridge<R> {
    fn drop(&mut self) {
        // Pump threads block in the runtime until their listener closes.
        for listener in self.listeners.handles_where(|_| true) {
            if let Err(e) = self.close_listener(listener) {
                log::debug!("[bridge] dropping listener {listener}: {e}");
            }
        }
    }
}

fn join(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn running(bridge: &Bridge<LocalNet>, hostname: &str) -> Handle {
        let s = bridge.new_server();
        bridge.set_hostname(s, hostname).unwrap();
        bridge.set_authkey(s, "tskey-test").unwrap();
        bridge.up(s).unwrap();
        s
    }

    #[test]
    fn test_servers_get_distinct_handles() {
        let bridge = Bridge::default();
        let a = bridge.new_server();
        let b = bridge.new_server();
        assert_ne!(a, b);
        assert_eq!(a.as_raw(), SERVER_HANDLE_BASE);
        assert_eq!(bridge.servers(), vec![a, b]);
    }

    #[test]
    fn test_close_then_every_verb_is_bad_handle() {
        let bridge = Bridge::default();
        let s = running(&bridge, "gone");
        bridge.close(s).unwrap();

        assert!(matches!(bridge.close(s), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.start(s), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.set_hostname(s, "x"), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.dial(s, "tcp", "100.64.0.1:80"), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.getips(s, 64), Err(BridgeError::BadHandle(_))));
        assert!(matches!(bridge.errmsg(s, 64), Err(BridgeError::BadHandle(_))));
        assert_eq!(bridge.errmsg_into(s, &mut [0u8; 8]), libc::EBADF);
    }

    #[test]
    fn test_runtime_failure_lands_in_errmsg() {
        let bridge = Bridge::default();
        let s = bridge.new_server();
        let err = bridge.up(s).unwrap_err();
        assert!(matches!(err, BridgeError::Fatal(_)));
        assert_eq!(err.status(), -1);
        assert!(bridge.errmsg(s, 256).unwrap().contains("needs login"));
    }

    #[test]
    fn test_option_after_start_is_recorded() {
        let bridge = Bridge::default();
        let s = bridge.new_server();
        bridge.start(s).unwrap();
        assert!(bridge.set_dir(s, "/tmp/late").is_err());
        assert!(bridge.errmsg(s, 256).unwrap().contains("dir"));
    }

    #[test]
    fn test_getips_capacity() {
        let bridge = Bridge::default();
        let s = running(&bridge, "ips");
        let ips = bridge.getips(s, 128).unwrap();
        assert_eq!(ips, "100.64.0.1,fd7a:115c:a1e0::1");
        match bridge.getips(s, ips.len()) {
            Err(BridgeError::InsufficientBuffer { needed, capacity }) => {
                assert_eq!(needed, ips.len() + 1);
                assert_eq!(capacity, ips.len());
            }
            other => panic!("expected InsufficientBuffer, got {other:?}"),
        }
    }

    #[test]
    fn test_cert_domains() {
        let bridge = Bridge::with_runtime(LocalNet::with_suffix("tail.ts.net"));
        let s = running(&bridge, "box");
        assert_eq!(bridge.cert_domains(s, 64).unwrap(), "box.tail.ts.net");
        assert!(matches!(
            bridge.cert_domains(s, 4),
            Err(BridgeError::InsufficientBuffer { .. })
        ));
    }

    #[test]
    fn test_loopback_credentials() {
        let bridge = Bridge::default();
        let s = running(&bridge, "lb");
        let lb = bridge.loopback(s, 64).unwrap();
        assert!(lb.addr.starts_with("127.0.0.1:"));
        assert_eq!(lb.proxy_cred.as_bytes().len(), CREDENTIAL_LEN);
        let c = lb.local_api_cred.to_cstr_bytes();
        assert_eq!(c.len(), CREDENTIAL_CSTR_LEN);
        assert_eq!(c[CREDENTIAL_LEN], 0);
        assert_eq!(&c[..CREDENTIAL_LEN], lb.local_api_cred.as_str().as_bytes());
        assert!(matches!(bridge.loopback(s, 4), Err(BridgeError::InsufficientBuffer { .. })));
    }

    #[test]
    fn test_credential_rejects_wrong_length() {
        assert!(Credential::new("short").is_err());
        assert!(Credential::new(&"a".repeat(CREDENTIAL_LEN)).is_ok());
        assert_eq!(format!("{:?}", Credential::new(&"a".repeat(32)).unwrap()), "Credential(<redacted>)");
    }

    #[test]
    fn test_apply_config_pushes_options() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::default();
        let s = bridge.new_server();
        let config = Config {
            state_dir: Some(dir.path().join("state")),
            hostname: Some("configured".into()),
            authkey: Some("tskey-cfg".into()),
            control_url: None,
            ephemeral: false,
        };
        bridge.apply_config(s, &config).unwrap();
        bridge.up(s).unwrap();
        assert!(dir.path().join("state").join("tailscaled.state").exists());
        assert_eq!(bridge.cert_domains(s, 128).unwrap(), "configured.bridge.ts.net");
    }

    #[test]
    fn test_dial_conn_stream_and_close() {
        let bridge = Bridge::default();
        let server = running(&bridge, "server");
        let client = running(&bridge, "client");
        let ln = bridge.listen(server, "tcp", ":7001").unwrap();

        let conn = bridge.dial(client, "tcp", "100.64.0.1:7001").unwrap();
        let accepted = bridge.accept(ln).unwrap();

        bridge.conn_stream(conn).unwrap().write_all(b"abc").unwrap();
        bridge.close_conn(conn).unwrap();
        assert!(matches!(bridge.close_conn(conn), Err(BridgeError::BadHandle(_))));

        let mut got = Vec::new();
        std::fs::File::from(bridge.take_conn(accepted).unwrap())
            .read_to_end(&mut got)
            .unwrap();
        assert_eq!(got, b"abc");
        assert!(matches!(bridge.take_conn(accepted), Err(BridgeError::BadHandle(_))));
    }

    #[test]
    fn test_getremoteaddr_reports_dialer() {
        let bridge = Bridge::default();
        let server = running(&bridge, "server");
        let client = running(&bridge, "client");
        let ln = bridge.listen(server, "tcp", ":7002").unwrap();
        let _conn = bridge.dial(client, "tcp", "100.64.0.1:7002").unwrap();
        let accepted = bridge.accept(ln).unwrap();

        assert_eq!(bridge.getremoteaddr(ln, accepted, 64).unwrap(), "100.64.0.2");
        assert!(matches!(
            bridge.getremoteaddr(ln, accepted, 3),
            Err(BridgeError::InsufficientBuffer { .. })
        ));
    }

    #[test]
    fn test_dial_failure_records_on_server() {
        let bridge = Bridge::default();
        let client = running(&bridge, "client");
        assert!(bridge.dial(client, "tcp", "100.64.0.50:1").is_err());
        assert!(bridge.errmsg(client, 256).unwrap().starts_with("dial tcp 100.64.0.50:1"));
    }
}
