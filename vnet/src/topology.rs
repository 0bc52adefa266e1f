use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use vnet_flow::FlowRule;
use vnet_sim::Backend;

use crate::{
    EngineConfig, Error, IfaceId, Network, NextHop, NodeId, NodeKind, Probe, ProbeResult, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    /// Enable IP forwarding. Only valid on hosts and routers.
    #[serde(default)]
    pub forwarding: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self { name: name.into(), kind, forwarding: false }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Host)
    }

    pub fn router(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Router)
    }

    pub fn switch(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Switch)
    }

    pub fn forwarding(mut self, enabled: bool) -> Self {
        self.forwarding = enabled;
        self
    }
}

/// Address of the `iface`-th interface of `node`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    pub node: String,
    pub iface: usize,
    pub address: IpNet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub dest: IpNet,
    pub via: NextHop,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface: Option<usize>,
}

impl RouteSpec {
    pub fn new(dest: IpNet, via: NextHop) -> Self {
        Self { dest, via, iface: None }
    }

    pub fn iface(mut self, index: usize) -> Self {
        self.iface = Some(index);
        self
    }
}

/// Declarative description of a network.
///
/// In JSON:
///
/// ```json
/// {
///   "nodes": [
///     { "name": "h1", "kind": "host" },
///     { "name": "r1", "kind": "router", "forwarding": true }
///   ],
///   "links": [["h1", "r1"]],
///   "addresses": [
///     { "node": "h1", "iface": 0, "address": "10.0.0.1/24" },
///     { "node": "r1", "iface": 0, "address": "10.0.0.3/24" }
///   ],
///   "routes": { "h1": [{ "dest": "0.0.0.0/0", "via": "10.0.0.3" }] },
///   "flows": {}
/// }
/// ```
///
/// Flows are `ovs-ofctl` rule strings keyed by switch name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<(String, String)>,
    pub addresses: Vec<AddressSpec>,
    pub routes: BTreeMap<String, Vec<RouteSpec>>,
    pub flows: BTreeMap<String, Vec<String>>,
}

impl TopologySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidTopology(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidTopology(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidTopology(e.to_string()))
    }

    pub fn node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn link(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.links.push((a.into(), b.into()));
        self
    }

    pub fn address(mut self, node: impl Into<String>, iface: usize, address: IpNet) -> Self {
        self.addresses.push(AddressSpec { node: node.into(), iface, address });
        self
    }

    pub fn route(mut self, node: impl Into<String>, route: RouteSpec) -> Self {
        self.routes.entry(node.into()).or_default().push(route);
        self
    }

    pub fn flow(mut self, switch: impl Into<String>, rule: impl Into<String>) -> Self {
        self.flows.entry(switch.into()).or_default().push(rule.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyState {
    Building,
    Running,
    Stopped,
    /// Building failed and everything created so far has been torn down.
    Failed,
}

/// A [`Network`] built from a [`TopologySpec`], torn down on [`Topology::stop`] or drop.
#[derive(Debug)]
pub struct Topology {
    network: Network,
    state: TopologyState,
}

impl Topology {
    /// An empty topology, ready for [`Topology::apply`].
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        Self { network: Network::new(backend, config), state: TopologyState::Building }
    }

    /// Builds `spec` and returns the running topology.
    pub fn build(
        spec: &TopologySpec,
        backend: Arc<dyn Backend>,
        config: EngineConfig,
    ) -> Result<Self> {
        let mut topology = Self::new(backend, config);
        topology.apply(spec)?;
        Ok(topology)
    }

    /// Creates everything `spec` describes: nodes, links, then starts the nodes and programs
    /// addresses, forwarding, routes and flows, in that order.
    ///
    /// On error, everything created so far is torn down, the topology moves to
    /// [`TopologyState::Failed`] and the error is returned.
    pub fn apply(&mut self, spec: &TopologySpec) -> Result<()> {
        if self.state != TopologyState::Building {
            return Err(Error::InvalidTopology(format!("cannot build a {:?} topology", self.state)));
        }

        let _span =
            info_span!("build", nodes = spec.nodes.len(), links = spec.links.len()).entered();

        match self.apply_phases(spec) {
            Ok(()) => {
                self.state = TopologyState::Running;
                info!("topology running");
                Ok(())
            }
            Err(e) => {
                warn!(?e, "failed to build topology, tearing down");
                self.network.teardown();
                self.state = TopologyState::Failed;
                Err(e)
            }
        }
    }

    fn apply_phases(&mut self, spec: &TopologySpec) -> Result<()> {
        let network = &mut self.network;

        for node in &spec.nodes {
            network.create_node(&node.name, node.kind)?;
        }
        debug!("nodes created");

        for (a, b) in &spec.links {
            let (a, b) = (network.node_id(a)?, network.node_id(b)?);
            network.create_link(a, b)?;
        }
        debug!("links created");

        let ids: Vec<NodeId> = network.nodes().map(|node| node.id()).collect();
        for id in ids {
            network.start_node(id)?;
        }

        for address in &spec.addresses {
            let iface = IfaceId::new(network.node_id(&address.node)?, address.iface);
            network.assign_address(iface, address.address.addr(), address.address.prefix_len())?;
        }

        for node in spec.nodes.iter().filter(|node| node.forwarding) {
            let id = network.node_id(&node.name)?;
            network.set_forwarding(id, true)?;
        }

        for (node, routes) in &spec.routes {
            let id = network.node_id(node)?;
            for route in routes {
                network.add_route(id, route.dest, route.via, route.iface)?;
            }
        }
        network.verify_routes()?;
        debug!("routes installed");

        for (switch, rules) in &spec.flows {
            let id = network.node_id(switch)?;
            let rules = rules
                .iter()
                .map(|rule| rule.parse::<FlowRule>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            network.replace_flows(id, rules)?;
        }
        debug!("flows installed");

        Ok(())
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Mutable access for changes after the build, such as installing flows by hand.
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn node(&self, name: &str) -> Result<NodeId> {
        self.network.node_id(name)
    }

    /// Runs a command inside the node called `node`.
    pub fn run(
        &self,
        node: &str,
        command_line: &str,
        timeout: Option<Duration>,
    ) -> Result<ProbeResult> {
        self.network.run(self.node(node)?, command_line, timeout)
    }

    pub fn probe(&self, probe: &Probe) -> Result<ProbeResult> {
        self.network.probe(probe)
    }

    pub fn probe_all(&self, probes: &[Probe]) -> Result<Vec<ProbeResult>> {
        self.network.probe_all(probes)
    }

    /// Tears everything down. Stopping a stopped or failed topology does nothing.
    pub fn stop(&mut self) {
        match self.state {
            TopologyState::Stopped | TopologyState::Failed => {}
            TopologyState::Building | TopologyState::Running => {
                self.network.teardown();
                self.state = TopologyState::Stopped;
                info!("topology stopped");
            }
        }
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        self.stop();
    }
}
