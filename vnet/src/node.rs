use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, warn};
use vnet_flow::FlowTable;
use vnet_sim::{
    sysctl::{self, Ip, Protocol, SysctlParam},
    Endpoint, MAX_DEVICE_NAME_LEN,
};

use crate::{link::Interface, route::RouteTable, Error, Network, Result};

/// Longest node name whose first interface device (`{name}-eth0`) still fits in `IFNAMSIZ`.
const MAX_NODE_NAME_LEN: usize = MAX_DEVICE_NAME_LEN - "-eth0".len();

/// Handle to a node of a [`Network`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Router,
    Switch,
}

impl NodeKind {
    /// Whether IP forwarding can be toggled on this kind of node.
    pub fn supports_forwarding(self) -> bool {
        matches!(self, Self::Host | Self::Router)
    }

    /// Whether this kind of node carries a flow table.
    pub fn supports_flow_table(self) -> bool {
        matches!(self, Self::Switch)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Router => f.write_str("router"),
            Self::Switch => f.write_str("switch"),
        }
    }
}

/// Lifecycle of a node. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// The namespace exists; links and addresses can be added.
    Created,
    /// Loopback is up and commands can run.
    Started,
    /// The namespace has been deleted.
    Stopped,
}

/// A host, router or switch, isolated in its own network namespace.
///
/// Interfaces are never removed: when a link goes away its interfaces stay behind, detached, so
/// that indices keep matching creation order.
#[derive(Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) namespace: String,
    pub(crate) state: NodeState,
    pub(crate) forwarding: bool,
    pub(crate) interfaces: Vec<Interface>,
    pub(crate) routes: RouteTable,
    pub(crate) flows: Option<FlowTable>,
}

impl Node {
    fn new(id: NodeId, name: String, kind: NodeKind, namespace: String) -> Self {
        Self {
            id,
            name,
            kind,
            namespace,
            state: NodeState::Created,
            forwarding: false,
            interfaces: Vec::new(),
            routes: RouteTable::default(),
            flows: kind.supports_flow_table().then(FlowTable::new),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding
    }

    /// Every interface ever created on this node, in creation order.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// The flow table, for switches.
    pub fn flows(&self) -> Option<&FlowTable> {
        self.flows.as_ref()
    }

    /// Name of the bridge device backing a switch.
    pub(crate) fn bridge_name(&self) -> String {
        format!("{}-br", self.name)
    }

    /// Device name of the interface at `index`. Switch ports are numbered from 1, so their
    /// devices are too: `s1-eth1` is port 1.
    pub(crate) fn device_name(&self, index: usize) -> String {
        match self.kind {
            NodeKind::Switch => format!("{}-eth{}", self.name, index + 1),
            NodeKind::Host | NodeKind::Router => format!("{}-eth{index}", self.name),
        }
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.state == NodeState::Stopped {
            return Err(Error::NodeStopped(self.name.clone()));
        }
        Ok(())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| Err(Error::InvalidName { name: name.to_string(), reason });

    if name.is_empty() {
        return invalid("empty");
    }
    if name.len() > MAX_NODE_NAME_LEN {
        return invalid("longer than 10 bytes");
    }
    if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return invalid("only ASCII letters, digits, `-` and `_` are allowed");
    }
    Ok(())
}

impl Network {
    /// Creates a node in its own namespace. Switches also get a bridge device.
    pub fn create_node(&mut self, name: &str, kind: NodeKind) -> Result<NodeId> {
        validate_name(name)?;
        if self.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let id = NodeId(self.nodes.len());
        let namespace = self.config.namespace_name(name);
        let node = Node::new(id, name.to_string(), kind, namespace);

        let _span = debug_span!("create_node", name, %kind, namespace = %node.namespace).entered();

        self.backend.add_namespace(&node.namespace)?;
        if kind.supports_flow_table() {
            if let Err(e) = self.backend.add_bridge(&node.namespace, &node.bridge_name()) {
                if let Err(e) = self.backend.del_namespace(&node.namespace) {
                    warn!(?e, "failed to remove namespace of half-created switch");
                }
                return Err(e.into());
            }
        }

        debug!(%id, "created node");
        self.names.insert(node.name.clone(), id);
        self.nodes.push(node);
        Ok(id)
    }

    /// Brings the loopback device up and marks the node as started. Starting a started node does
    /// nothing.
    pub fn start_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        match node.state {
            NodeState::Started => return Ok(()),
            NodeState::Stopped => return Err(Error::NodeStopped(node.name.clone())),
            NodeState::Created => {}
        }

        self.backend.set_link_up(Endpoint::new(&node.namespace, "lo"))?;
        debug!(name = %node.name, "started node");

        self.node_mut(id)?.state = NodeState::Started;
        Ok(())
    }

    /// Deletes the node's namespace. Links still attached to the node are detached from the
    /// model; the kernel removes their devices together with the namespace.
    ///
    /// Destroying a stopped node does nothing.
    pub fn destroy_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if node.state == NodeState::Stopped {
            return Ok(());
        }

        let namespace = node.namespace.clone();
        let _span = debug_span!("destroy_node", name = %node.name, %namespace).entered();

        let incident: Vec<_> =
            self.links().filter(|link| link.touches(id)).map(|link| link.id()).collect();
        let mut neighbours = Vec::new();
        for link in incident {
            if let Some(link) = self.detach_link(link) {
                neighbours.push(link.other(id).node);
            }
        }

        let mut result = self.backend.del_namespace(&namespace).map_err(Error::from);

        let node = self.node_mut(id)?;
        node.state = NodeState::Stopped;
        node.forwarding = false;

        // Neighbouring switches may still redirect or mirror to the removed ports.
        for neighbour in neighbours {
            if let Err(e) = self.sync_flows(neighbour) {
                result = result.and(Err(e));
            }
        }

        debug!("destroyed node");
        result
    }

    /// Turns IP forwarding on or off inside the node's namespace.
    pub fn set_forwarding(&mut self, id: NodeId, enabled: bool) -> Result<()> {
        let node = self.node(id)?;
        if !node.kind.supports_forwarding() {
            return Err(Error::UnsupportedKind {
                node: node.name.clone(),
                kind: node.kind,
                operation: "ip forwarding",
            });
        }
        node.ensure_alive()?;

        let key = Ip::Forwarding.key(Protocol::V4);
        self.backend.write_sysctl(&node.namespace, &key, sysctl::flag(enabled))?;
        debug!(name = %node.name, enabled, "set ip forwarding");

        self.node_mut(id)?.forwarding = enabled;
        Ok(())
    }
}
