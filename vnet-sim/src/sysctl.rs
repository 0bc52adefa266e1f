//! Network sysctl parameters used by the engine.
//!
//! These parameters are **per-namespace**: writing `net.ipv4.ip_forward` inside a node's namespace
//! turns that node into a router without touching the host. Backends receive the dotted key form
//! (see [`SysctlParam::key`]) and apply it inside the target namespace.
//!
//! ```
//! use vnet_sim::sysctl::{Ip, Protocol, SysctlParam};
//!
//! assert_eq!(Ip::Forwarding.key(Protocol::V4), "net.ipv4.ip_forward");
//! assert_eq!(Ip::Forwarding.path(Protocol::V6), "/proc/sys/net/ipv6/conf/all/forwarding");
//! ```

/// Root of the sysctl tree in procfs.
const PROC_SYS: &str = "/proc/sys/";

/// IP protocol version for sysctl paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    /// IPv4 (`/proc/sys/net/ipv4/...`)
    #[default]
    V4,
    /// IPv6 (`/proc/sys/net/ipv6/...`)
    V6,
}

/// Trait for sysctl parameters that can be read/written.
pub trait SysctlParam {
    /// Returns the full path to the sysctl file for the given protocol.
    fn path(&self, protocol: Protocol) -> &'static str;

    /// Returns the dotted key accepted by `sysctl -w`.
    fn key(&self, protocol: Protocol) -> String {
        let path = self.path(protocol);
        path.strip_prefix(PROC_SYS).unwrap_or(path).replace('/', ".")
    }
}

/// General IP sysctl parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ip {
    /// Enable IP forwarding (0/1).
    ///
    /// - IPv4: `/proc/sys/net/ipv4/ip_forward`
    /// - IPv6: `/proc/sys/net/ipv6/conf/all/forwarding`
    ///
    /// Default: 0 (disabled)
    Forwarding,
}

impl SysctlParam for Ip {
    fn path(&self, protocol: Protocol) -> &'static str {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "/proc/sys/net/ipv4/ip_forward",
            (Self::Forwarding, Protocol::V6) => "/proc/sys/net/ipv6/conf/all/forwarding",
        }
    }
}

/// Render a boolean the way procfs expects it.
#[inline]
pub fn flag(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}
