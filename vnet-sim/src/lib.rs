#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Kernel plumbing for the `vnet` emulation engine.
//!
//! Everything that touches the host kernel goes through the [`Backend`] trait: creating and
//! deleting network namespaces, veth pairs and bridges, assigning addresses, installing routes,
//! writing per-namespace sysctls, programming `tc` flower filters and running processes inside a
//! namespace.
//!
//! Two backends are provided:
//!
//! - [`IpBackend`] drives the real kernel through `ip`, `tc` and `sysctl`, optionally through
//!   `sudo`.
//! - [`MemoryBackend`] keeps an in-memory model of the same objects. It counts every call,
//!   supports failure injection and answers process execution through a pluggable responder.

use std::{fmt::Debug, io, net::IpAddr, time::Duration};

use ipnet::IpNet;

pub mod command;
pub mod ip;
pub mod memory;
pub mod sysctl;
pub mod tc;
pub mod test_util;

pub use command::{ExitCode, Output, Runner};
pub use ip::{IpBackend, IpOptions};
pub use memory::{MemoryBackend, Op};
pub use tc::{FilterAction, FilterMatch, PortFilter};

/// Maximum length of a Linux network device name (`IFNAMSIZ - 1`).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("namespace already exists: {0}")]
    NamespaceExists(String),
    #[error("device {device} not found in namespace {namespace}")]
    DeviceNotFound { namespace: String, device: String },
    #[error("device {device} already exists in namespace {namespace}")]
    DeviceExists { namespace: String, device: String },
    #[error("route to {destination} already exists in namespace {namespace}")]
    RouteExists { namespace: String, destination: IpNet },
    #[error("injected failure on {op} (call #{call})")]
    Injected { op: Op, call: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A network device living inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint<'a> {
    pub namespace: &'a str,
    pub device: &'a str,
}

impl<'a> Endpoint<'a> {
    #[inline]
    pub fn new(namespace: &'a str, device: &'a str) -> Self {
        Self { namespace, device }
    }
}

/// A kernel route entry, as handed to [`Backend::add_route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRoute<'a> {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub device: Option<&'a str>,
}

/// The set of kernel operations the engine relies on.
///
/// Implementations must be safe to share between threads: command execution for independent
/// namespaces may happen concurrently, while every other call is issued by a single writer.
pub trait Backend: Send + Sync + Debug {
    /// Create a network namespace named `name`.
    fn add_namespace(&self, name: &str) -> Result<()>;

    /// Delete the network namespace `name`, together with every device inside it.
    fn del_namespace(&self, name: &str) -> Result<()>;

    /// Create a veth pair with one end in each namespace and bring both ends up.
    ///
    /// The pair is created atomically: if any step fails, nothing is left behind.
    fn add_veth(&self, a: Endpoint<'_>, b: Endpoint<'_>) -> Result<()>;

    /// Delete a link device. For veth devices, the peer is removed by the kernel as well.
    fn del_link(&self, end: Endpoint<'_>) -> Result<()>;

    /// Create a bridge device inside `namespace` and bring it up.
    fn add_bridge(&self, namespace: &str, bridge: &str) -> Result<()>;

    /// Enslave `port` to `bridge`, which must live in the same namespace.
    fn attach_to_bridge(&self, port: Endpoint<'_>, bridge: &str) -> Result<()>;

    /// Bring a device up.
    fn set_link_up(&self, end: Endpoint<'_>) -> Result<()>;

    /// Replace every address on a device with `address`.
    fn replace_address(&self, end: Endpoint<'_>, address: IpNet) -> Result<()>;

    /// Install a route inside `namespace`.
    fn add_route(&self, namespace: &str, route: KernelRoute<'_>) -> Result<()>;

    /// Write a sysctl `key` (dotted form, e.g. `net.ipv4.ip_forward`) inside `namespace`.
    fn write_sysctl(&self, namespace: &str, key: &str, value: &str) -> Result<()>;

    /// Remove every ingress filter from a device.
    fn clear_filters(&self, port: Endpoint<'_>) -> Result<()>;

    /// Append an ingress filter to a device.
    fn add_filter(&self, port: Endpoint<'_>, filter: &PortFilter) -> Result<()>;

    /// Run `command_line` through `sh -c` inside `namespace`, waiting at most `timeout`.
    ///
    /// A non-zero exit status or an elapsed timeout is reported through [`Output::exit`], not
    /// as an error.
    fn exec(&self, namespace: &str, command_line: &str, timeout: Duration) -> Result<Output>;
}
