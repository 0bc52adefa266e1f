#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Virtual network emulation on top of Linux network namespaces.
//!
//! A [`Network`] owns a set of nodes (hosts, routers and switches), each living in its own
//! network namespace, and the veth links between them. On top of that it programs static
//! routes, per-switch flow tables and runs commands inside the namespaces.
//!
//! Most callers describe the whole network up front with a [`TopologySpec`] and let a
//! [`Topology`] build it, run their probes and tear it down:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use vnet::{EngineConfig, NextHop, NodeSpec, Probe, RouteSpec, Topology, TopologySpec};
//!
//! let spec = TopologySpec::new()
//!     .node(NodeSpec::host("h1"))
//!     .node(NodeSpec::router("r1").forwarding(true))
//!     .link("h1", "r1")
//!     .address("h1", 0, "10.0.0.1/24".parse()?)
//!     .address("r1", 0, "10.0.0.3/24".parse()?)
//!     .route("h1", RouteSpec::new("0.0.0.0/0".parse()?, NextHop::Via("10.0.0.3".parse()?)));
//!
//! let config = EngineConfig::default();
//! let mut topology = Topology::build(&spec, Arc::new(config.ip_backend()), config)?;
//! let results = topology.probe_all(&[Probe::ping("h1", "10.0.0.3".parse()?)])?;
//! assert!(results[0].success());
//!
//! topology.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Every kernel call goes through a [`Backend`]. [`IpBackend`] drives the host kernel and needs
//! root (or passwordless `sudo`); [`MemoryBackend`] models the same objects in memory.

use std::fmt;

mod config;
mod exec;
mod flow;
mod link;
mod network;
mod node;
mod route;
mod topology;

pub use config::EngineConfig;
pub use exec::{Probe, ProbeResult};
pub use link::{IfaceId, Interface, Link, LinkId};
pub use network::Network;
pub use node::{Node, NodeId, NodeKind, NodeState};
pub use route::{NextHop, RouteEntry};
pub use topology::{AddressSpec, NodeSpec, RouteSpec, Topology, TopologySpec, TopologyState};

pub use vnet_flow::{Action, Decision, FlowMatch, FlowRule, MacAddr, PacketFields, PortNo};
pub use vnet_sim::{Backend, ExitCode, IpBackend, IpOptions, MemoryBackend, Output};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("name already in use: {0}")]
    DuplicateName(String),
    #[error("route to {destination} already exists on {node}")]
    ConflictingRoute { node: String, destination: ipnet::IpNet },
    #[error("next hop {next_hop} is not reachable from {node}")]
    InvalidNextHop { node: String, next_hop: NextHop },
    #[error("{node} is a {kind} and does not support {operation}")]
    UnsupportedKind { node: String, kind: NodeKind, operation: &'static str },
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid flow: {0}")]
    InvalidFlow(#[from] vnet_flow::Error),
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("link not found: {0}")]
    LinkNotFound(LinkId),
    #[error("interface not found: {0}")]
    InterfaceNotFound(IfaceId),
    #[error("node {0} has been stopped")]
    NodeStopped(String),
    #[error("node {0} is not running")]
    NodeNotRunning(String),
    #[error("backend error: {0}")]
    Backend(#[from] vnet_sim::Error),
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The request contradicts the network being built. Retrying won't help.
    Configuration,
    /// The request refers to a resource that doesn't exist or isn't in the right state.
    Resource,
    /// A kernel operation failed.
    Backend,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => f.write_str("configuration"),
            Self::Resource => f.write_str("resource"),
            Self::Backend => f.write_str("backend"),
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DuplicateName(_)
            | Self::ConflictingRoute { .. }
            | Self::InvalidNextHop { .. }
            | Self::UnsupportedKind { .. }
            | Self::InvalidName { .. }
            | Self::InvalidLink(_)
            | Self::InvalidAddress(_)
            | Self::InvalidFlow(_)
            | Self::InvalidTopology(_) => ErrorClass::Configuration,
            Self::NodeNotFound(_)
            | Self::LinkNotFound(_)
            | Self::InterfaceNotFound(_)
            | Self::NodeStopped(_)
            | Self::NodeNotRunning(_) => ErrorClass::Resource,
            Self::Backend(_) => ErrorClass::Backend,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified() {
        assert_eq!(Error::DuplicateName("h1".into()).class(), ErrorClass::Configuration);
        assert_eq!(
            Error::InvalidFlow(vnet_flow::Error::ReservedPriority).class(),
            ErrorClass::Configuration
        );
        assert_eq!(Error::NodeNotRunning("h1".into()).class(), ErrorClass::Resource);
        assert_eq!(
            Error::Backend(vnet_sim::Error::NamespaceNotFound("x".into())).class(),
            ErrorClass::Backend
        );
        assert_eq!(ErrorClass::Resource.to_string(), "resource");
    }
}
