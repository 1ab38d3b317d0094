//! The network runtime the bridge drives.
//!
//! The runtime is an opaque collaborator: connection setup, membership, and
//! addressing all happen behind these traits. The bridge only creates nodes,
//! pushes options, sequences lifecycle calls, and moves the descriptors the
//! runtime produces.
//!
//! [`LocalNet`] is the in-process implementation shipped with the crate.

pub mod localnet;

pub use localnet::{LocalListener, LocalNet, LocalNode};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{BorrowedFd, OwnedFd};
use std::path::PathBuf;

use anyhow::Result;

/// Option pushed to a node before it starts.
#[derive(Debug)]
pub enum NodeOption {
    /// State directory.
    Dir(PathBuf),
    /// Hostname on the tailnet.
    Hostname(String),
    /// Auth key used to join without interactive login.
    AuthKey(String),
    /// Coordination server URL.
    ControlUrl(String),
    /// Remove the node from the tailnet when it goes away.
    Ephemeral(bool),
    /// Destination for node log lines; `None` discards them.
    LogFd(Option<OwnedFd>),
}

impl NodeOption {
    /// Short name used in log lines and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dir(_) => "dir",
            Self::Hostname(_) => "hostname",
            Self::AuthKey(_) => "authkey",
            Self::ControlUrl(_) => "control_url",
            Self::Ephemeral(_) => "ephemeral",
            Self::LogFd(_) => "logfd",
        }
    }
}

impl fmt::Display for NodeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a funnel listener treats traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunnelMode {
    /// Accept from both the public internet and the tailnet.
    Shared,
    /// Accept only funnel (public internet) traffic.
    FunnelOnly,
}

/// Loopback address and credentials as reported by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    /// `host:port` of the local proxy surface.
    pub addr: String,
    /// Proxy password.
    pub proxy_cred: String,
    /// Bearer credential for the local administrative API.
    pub local_api_cred: String,
}

/// Factory for nodes.
pub trait Runtime: Send + Sync + 'static {
    /// Node type this runtime produces.
    type Node: Node;

    /// Create an unconfigured, unstarted node.
    fn new_node(&self) -> Self::Node;
}

/// One runtime instance (a tailnet node).
pub trait Node: Send + Sync + 'static {
    /// Listener type this node produces.
    type Listener: NodeListener;

    /// Apply an option. Fails once the node has started.
    fn configure(&self, option: NodeOption) -> Result<()>;

    /// Start the node. Idempotent while running.
    fn start(&self) -> Result<()>;

    /// Start and wait until the node is usable on the tailnet.
    fn up(&self) -> Result<()>;

    /// Shut the node down and release its listeners.
    fn close(&self) -> Result<()>;

    /// Open a connection; the returned descriptor is a connected stream.
    fn dial(&self, network: &str, addr: &str) -> Result<OwnedFd>;

    /// Listen on a tailnet address, optionally through funnel.
    fn listen(&self, network: &str, addr: &str, funnel: Option<FunnelMode>)
        -> Result<Self::Listener>;

    /// Addresses assigned to this node.
    fn ips(&self) -> Result<Vec<IpAddr>>;

    /// Bind the loopback surface and return its address and credentials.
    fn loopback(&self) -> Result<LoopbackInfo>;

    /// Domains this node can obtain certificates for.
    fn cert_domains(&self) -> Result<Vec<String>>;
}

/// Runtime-side listener feeding a descriptor channel.
pub trait NodeListener: Send + Sync + 'static {
    /// Block until the next inbound connection.
    fn accept(&self) -> Result<OwnedFd>;

    /// Tailnet address of the peer on a connection this listener produced.
    fn remote_addr(&self, conn: BorrowedFd<'_>) -> Result<SocketAddr>;

    /// Stop listening; a blocked [`NodeListener::accept`] must return.
    fn close(&self);
}
