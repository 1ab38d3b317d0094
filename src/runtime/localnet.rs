//! In-process tailnet.
//!
//! `LocalNet` stands in for a real tailnet inside one process: nodes created
//! from the same `LocalNet` (or clones of it) can reach each other. Each
//! started node gets a CGNAT-range IPv4 address and a ULA IPv6 address; each
//! tailnet listener is backed by a loopback TCP listener, and dials to a
//! tailnet address connect to that backing listener.
//!
//! ```text
//! node A: dial("tcp", "100.64.0.2:8081")
//!            │ registry lookup (100.64.0.2:8081 → 127.0.0.1:54012)
//!            ▼
//! node B: listen("tcp", ":8081") ── backing TcpListener 127.0.0.1:54012
//! ```
//!
//! The registry also remembers which loopback socket belongs to which dialer
//! so a listener can report the peer's tailnet address.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{FunnelMode, LoopbackInfo, Node, NodeListener, NodeOption, Runtime};
use crate::constants::CREDENTIAL_LEN;

/// Ports on which funnel listeners are allowed.
const FUNNEL_PORTS: [u16; 3] = [443, 8443, 10000];

/// Default MagicDNS suffix for certificate domains.
const DEFAULT_SUFFIX: &str = "bridge.ts.net";

/// Hostname used when none was configured.
const DEFAULT_HOSTNAME: &str = "tsnet-bridge";

/// State file written under the node's directory after a successful `up`.
const STATE_FILE: &str = "tailscaled.state";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Registry ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Route {
    backing: SocketAddr,
    funnel_only: bool,
}

#[derive(Debug, Default)]
struct Registry {
    next_host: u32,
    /// Tailnet listen address → backing loopback address.
    routes: HashMap<SocketAddr, Route>,
    /// Dialer's loopback socket address → dialer's tailnet address.
    dialers: HashMap<SocketAddr, SocketAddr>,
    /// MagicDNS: hostname → IPv4.
    names: HashMap<String, Ipv4Addr>,
}

impl Registry {
    fn allocate_host(&mut self) -> u32 {
        self.next_host += 1;
        self.next_host
    }

    fn resolve(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        self.names.get(host).copied().map(IpAddr::V4)
    }

    fn forget_node(&mut self, ips: &[IpAddr], hostname: &str) {
        self.routes.retain(|addr, _| !ips.contains(&addr.ip()));
        self.dialers.retain(|_, tailnet| !ips.contains(&tailnet.ip()));
        if let Some(ip) = self.names.get(hostname) {
            if ips.contains(&IpAddr::V4(*ip)) {
                self.names.remove(hostname);
            }
        }
    }
}

fn tailnet_v4(host: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(Ipv4Addr::new(100, 64, 0, 0)) + host)
}

fn tailnet_v6(host: u32) -> Ipv6Addr {
    let base = u128::from(Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 0));
    Ipv6Addr::from(base + u128::from(host))
}

// ─── Runtime ───────────────────────────────────────────────────────────────

/// A shared in-process tailnet. Clones share the same address space.
#[derive(Debug, Clone)]
pub struct LocalNet {
    registry: Arc<Mutex<Registry>>,
    suffix: Arc<str>,
}

impl Default for LocalNet {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNet {
    /// Create an empty tailnet.
    #[must_use]
    pub fn new() -> Self {
        Self::with_suffix(DEFAULT_SUFFIX)
    }

    /// Create an empty tailnet whose certificate domains end in `suffix`.
    #[must_use]
    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            suffix: Arc::from(suffix),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }
}

impl Runtime for LocalNet {
    type Node = LocalNode;

    fn new_node(&self) -> LocalNode {
        LocalNode {
            net: self.clone(),
            state: Mutex::new(NodeState::default()),
        }
    }
}

// ─── Node ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    New,
    Running,
    Closed,
}

#[derive(Debug, Default)]
struct Settings {
    dir: Option<PathBuf>,
    hostname: Option<String>,
    authkey: Option<String>,
    control_url: Option<String>,
    ephemeral: bool,
}

#[derive(Debug, Default)]
struct NodeState {
    settings: Settings,
    log: Option<fs::File>,
    phase: Phase,
    ip4: Option<Ipv4Addr>,
    ip6: Option<Ipv6Addr>,
    online: bool,
    listeners: Vec<Arc<ListenerShared>>,
    loopback: Option<(TcpListener, LoopbackInfo)>,
}

impl NodeState {
    fn hostname(&self) -> &str {
        self.settings.hostname.as_deref().unwrap_or(DEFAULT_HOSTNAME)
    }

    fn logf(&mut self, line: &str) {
        log::debug!("[localnet] {} {line}", self.hostname());
        if let Some(out) = self.log.as_mut() {
            let _ = writeln!(out, "{line}");
        }
    }

    fn ips(&self) -> Vec<IpAddr> {
        let mut ips = Vec::with_capacity(2);
        if let Some(ip) = self.ip4 {
            ips.push(IpAddr::V4(ip));
        }
        if let Some(ip) = self.ip6 {
            ips.push(IpAddr::V6(ip));
        }
        ips
    }
}

/// Persisted after `up` so a later node in the same directory skips login.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    hostname: String,
    ip4: Ipv4Addr,
}

/// A node on a [`LocalNet`].
#[derive(Debug)]
pub struct LocalNode {
    net: LocalNet,
    state: Mutex<NodeState>,
}

impl LocalNode {
    fn state(&self) -> MutexGuard<'_, NodeState> {
        lock(&self.state)
    }

    /// Start under an already-held state lock.
    fn start_locked(&self, state: &mut NodeState) -> Result<()> {
        match state.phase {
            Phase::Running => return Ok(()),
            Phase::Closed => bail!("server closed"),
            Phase::New => {}
        }

        if let Some(url) = state.settings.control_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("invalid control URL {url:?}: expected http:// or https://");
            }
        }
        if let Some(dir) = state.settings.dir.as_ref() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create state dir {}", dir.display()))?;
        }

        let hostname = state.hostname().to_owned();
        let host = {
            let mut registry = self.net.registry();
            let host = registry.allocate_host();
            registry.names.insert(hostname, tailnet_v4(host));
            host
        };
        state.ip4 = Some(tailnet_v4(host));
        state.ip6 = Some(tailnet_v6(host));
        state.phase = Phase::Running;
        let line = format!("started as {}", tailnet_v4(host));
        state.logf(&line);
        Ok(())
    }

    fn running<'a>(&self, state: &'a mut NodeState) -> Result<&'a mut NodeState> {
        self.start_locked(state)?;
        Ok(state)
    }
}

fn check_network(network: &str) -> Result<()> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => bail!("unsupported network {other:?}"),
    }
}

fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("address {addr:?}: missing port");
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse::<u16>()
        .with_context(|| format!("address {addr:?}: invalid port"))?;
    Ok((host, port))
}

impl Node for LocalNode {
    type Listener = LocalListener;

    fn configure(&self, option: NodeOption) -> Result<()> {
        let mut state = self.state();
        if state.phase != Phase::New {
            bail!("{option} must be set before the server starts");
        }
        match option {
            NodeOption::Dir(dir) => state.settings.dir = Some(dir),
            NodeOption::Hostname(name) => state.settings.hostname = Some(name),
            NodeOption::AuthKey(key) => state.settings.authkey = Some(key),
            NodeOption::ControlUrl(url) => state.settings.control_url = Some(url),
            NodeOption::Ephemeral(e) => state.settings.ephemeral = e,
            NodeOption::LogFd(fd) => state.log = fd.map(fs::File::from),
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state();
        self.start_locked(&mut state)
    }

    fn up(&self) -> Result<()> {
        let mut state = self.state();
        let state = self.running(&mut state)?;
        if state.online {
            return Ok(());
        }

        let state_file = state.settings.dir.as_ref().map(|d| d.join(STATE_FILE));
        let has_state = state_file.as_ref().is_some_and(|p| p.exists());
        if state.settings.authkey.is_none() && !has_state {
            bail!("node needs login: no auth key configured and no saved state");
        }

        if let (Some(path), false) = (state_file, state.settings.ephemeral) {
            let persisted = PersistedState {
                hostname: state.hostname().to_owned(),
                ip4: state.ip4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            };
            let json = serde_json::to_vec_pretty(&persisted).context("encode node state")?;
            fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        }

        state.online = true;
        state.logf("up");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.phase == Phase::Closed {
            bail!("server already closed");
        }
        state.phase = Phase::Closed;
        state.online = false;
        for listener in state.listeners.drain(..) {
            listener.close();
        }
        state.loopback = None;
        let ips = state.ips();
        let hostname = state.hostname().to_owned();
        self.net.registry().forget_node(&ips, &hostname);
        state.logf("closed");
        Ok(())
    }

    fn dial(&self, network: &str, addr: &str) -> Result<OwnedFd> {
        check_network(network)?;
        let mut state = self.state();
        let state = self.running(&mut state)?;

        let (host, port) = split_host_port(addr)?;
        let (target, route) = {
            let registry = self.net.registry();
            let Some(ip) = registry.resolve(host) else {
                bail!("dial {network} {addr}: no such host {host:?}");
            };
            let target = SocketAddr::new(ip, port);
            let Some(route) = registry.routes.get(&target).copied() else {
                bail!("dial {network} {addr}: connection refused");
            };
            (target, route)
        };
        if route.funnel_only {
            bail!("dial {network} {addr}: listener only accepts funnel traffic");
        }

        let stream = TcpStream::connect(route.backing)
            .with_context(|| format!("dial {network} {addr}"))?;
        let local = stream.local_addr().context("dialer local address")?;
        let source_ip = match target.ip() {
            IpAddr::V4(_) => state.ip4.map(IpAddr::V4),
            IpAddr::V6(_) => state.ip6.map(IpAddr::V6),
        };
        if let Some(ip) = source_ip {
            self.net
                .registry()
                .dialers
                .insert(local, SocketAddr::new(ip, local.port()));
        }
        state.logf(&format!("dialed {target}"));
        Ok(OwnedFd::from(stream))
    }

    fn listen(
        &self,
        network: &str,
        addr: &str,
        funnel: Option<FunnelMode>,
    ) -> Result<LocalListener> {
        check_network(network)?;
        let mut state = self.state();
        let state = self.running(&mut state)?;

        let (host, port) = split_host_port(addr)?;
        if funnel.is_some() && !FUNNEL_PORTS.contains(&port) {
            bail!("funnel not available on port {port}; use 443, 8443, or 10000");
        }

        let own = state.ips();
        let ips = if host.is_empty() {
            own
        } else {
            let ip = match host.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) if host == state.hostname() => own.first().copied(),
                Err(_) => bail!("listen {network} {addr}: unknown host {host:?}"),
            };
            match ip {
                Some(ip) if own.contains(&ip) => vec![ip],
                _ => bail!("listen {network} {addr}: {host} is not this node's address"),
            }
        };

        let backing_listener =
            TcpListener::bind("127.0.0.1:0").context("bind loopback backing listener")?;
        let backing = backing_listener.local_addr().context("backing listener address")?;
        let port = if port == 0 { backing.port() } else { port };
        let tailnet: Vec<SocketAddr> = ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect();

        {
            let mut registry = self.net.registry();
            if let Some(taken) = tailnet.iter().find(|a| registry.routes.contains_key(a)) {
                bail!("listen {network} {taken}: address already in use");
            }
            let route = Route {
                backing,
                funnel_only: funnel == Some(FunnelMode::FunnelOnly),
            };
            for a in &tailnet {
                registry.routes.insert(*a, route);
            }
        }

        let shared = Arc::new(ListenerShared {
            inner: backing_listener,
            backing,
            tailnet,
            closed: AtomicBool::new(false),
            net: self.net.clone(),
        });
        state
            .listeners
            .retain(|l| !l.closed.load(Ordering::SeqCst));
        state.listeners.push(Arc::clone(&shared));
        state.logf(&format!("listening on {addr} (port {port})"));
        Ok(LocalListener { shared })
    }

    fn ips(&self) -> Result<Vec<IpAddr>> {
        let state = self.state();
        if state.phase != Phase::Running {
            bail!("server is not running");
        }
        Ok(state.ips())
    }

    fn loopback(&self) -> Result<LoopbackInfo> {
        let mut state = self.state();
        let state = self.running(&mut state)?;
        if let Some((_, info)) = state.loopback.as_ref() {
            return Ok(info.clone());
        }
        let listener = TcpListener::bind("127.0.0.1:0").context("bind loopback surface")?;
        let addr = listener.local_addr().context("loopback address")?;
        let info = LoopbackInfo {
            addr: addr.to_string(),
            proxy_cred: random_credential(),
            local_api_cred: random_credential(),
        };
        state.loopback = Some((listener, info.clone()));
        state.logf(&format!("loopback on {addr}"));
        Ok(info)
    }

    fn cert_domains(&self) -> Result<Vec<String>> {
        let state = self.state();
        if state.phase != Phase::Running {
            bail!("server is not running");
        }
        Ok(vec![format!("{}.{}", state.hostname(), self.net.suffix)])
    }
}

fn random_credential() -> String {
    rand::rng()
        .sample_iter(&rand::distr::Alphanumeric)
        .take(CREDENTIAL_LEN)
        .map(char::from)
        .collect()
}

// ─── Listener ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ListenerShared {
    inner: TcpListener,
    backing: SocketAddr,
    tailnet: Vec<SocketAddr>,
    closed: AtomicBool,
    net: LocalNet,
}

impl ListenerShared {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut registry = self.net.registry();
            for a in &self.tailnet {
                registry.routes.remove(a);
            }
        }
        // Wake a thread blocked in accept(); it sees `closed` and bails.
        let _ = TcpStream::connect(self.backing);
    }
}

/// A tailnet listener on a [`LocalNode`].
#[derive(Debug)]
pub struct LocalListener {
    shared: Arc<ListenerShared>,
}

impl LocalListener {
    /// Tailnet addresses this listener is registered under.
    #[must_use]
    pub fn tailnet_addrs(&self) -> &[SocketAddr] {
        &self.shared.tailnet
    }
}

impl NodeListener for LocalListener {
    fn accept(&self) -> Result<OwnedFd> {
        if self.shared.closed.load(Ordering::SeqCst) {
            bail!("listener closed");
        }
        let (stream, _) = self.shared.inner.accept().context("accept")?;
        if self.shared.closed.load(Ordering::SeqCst) {
            bail!("listener closed");
        }
        Ok(OwnedFd::from(stream))
    }

    fn remote_addr(&self, conn: BorrowedFd<'_>) -> Result<SocketAddr> {
        let peer = socket2::SockRef::from(&conn)
            .peer_addr()
            .context("peer address")?
            .as_socket()
            .context("peer is not an IP socket")?;
        Ok(self
            .shared
            .net
            .registry()
            .dialers
            .get(&peer)
            .copied()
            .unwrap_or(peer))
    }

    fn close(&self) {
        self.shared.close();
    }
}
