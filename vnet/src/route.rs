use std::{fmt, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vnet_sim::{Endpoint, KernelRoute};

use crate::{node::Node, Error, IfaceId, Network, NodeId, NodeState, Result};

/// Where a route sends matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NextHop {
    /// The destination is on-link.
    Direct,
    /// Forward through a gateway.
    Via(IpAddr),
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Via(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for NextHop {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("direct") {
            return Ok(Self::Direct);
        }
        s.parse().map(Self::Via).map_err(|_| {
            Error::InvalidAddress(format!("`{s}` is neither `direct` nor an IP address"))
        })
    }
}

impl TryFrom<String> for NextHop {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NextHop> for String {
    fn from(hop: NextHop) -> Self {
        hop.to_string()
    }
}

/// An explicit route installed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub(crate) destination: IpNet,
    pub(crate) next_hop: NextHop,
    pub(crate) iface: Option<usize>,
    pub(crate) pending: bool,
}

impl RouteEntry {
    pub fn destination(&self) -> IpNet {
        self.destination
    }

    pub fn next_hop(&self) -> NextHop {
        self.next_hop
    }

    /// Index of the output interface on the node, if the route is bound to one.
    pub fn iface(&self) -> Option<usize> {
        self.iface
    }

    /// Whether the gateway wasn't configured yet when the route was added.
    pub fn pending(&self) -> bool {
        self.pending
    }
}

/// Explicit routes of one node, in installation order.
#[derive(Debug, Clone, Default)]
pub(crate) struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub(crate) fn contains(&self, destination: IpNet) -> bool {
        self.entries.iter().any(|e| e.destination == destination)
    }

    pub(crate) fn push(&mut self, entry: RouteEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Longest-prefix match over the explicit routes and the `connected` subnets. Explicit
    /// routes win ties.
    pub(crate) fn lookup(
        &self,
        destination: IpAddr,
        connected: impl Iterator<Item = IpNet>,
    ) -> Option<NextHop> {
        let connected = connected.map(|net| (net, NextHop::Direct));
        let explicit = self.entries.iter().map(|e| (e.destination, e.next_hop));

        connected
            .chain(explicit)
            .filter(|(net, _)| net.contains(&destination))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, hop)| hop)
    }
}

impl Node {
    /// Subnets of the addressed interfaces that are still attached.
    pub(crate) fn connected_networks(&self) -> impl Iterator<Item = IpNet> + '_ {
        self.interfaces
            .iter()
            .filter(|iface| iface.is_attached())
            .filter_map(|iface| iface.address.map(|net| net.trunc()))
    }
}

impl Network {
    /// Sets the address of an interface, replacing any previous one.
    pub fn assign_address(&mut self, iface: IfaceId, ip: IpAddr, prefix_len: u8) -> Result<()> {
        let address = IpNet::new(ip, prefix_len)
            .map_err(|_| Error::InvalidAddress(format!("{ip}/{prefix_len}")))?;

        let node = self.node(iface.node)?;
        node.ensure_alive()?;
        let device = node
            .interfaces
            .get(iface.index)
            .filter(|i| i.is_attached())
            .map(|i| i.device.as_str())
            .ok_or(Error::InterfaceNotFound(iface))?;

        self.backend.replace_address(Endpoint::new(&node.namespace, device), address)?;
        debug!(%iface, device, %address, "assigned address");

        self.interface_mut(iface)?.address = Some(address);
        Ok(())
    }

    /// Whether `addr` is assigned to any attached interface of a live node.
    fn is_configured(&self, addr: IpAddr) -> bool {
        self.nodes
            .iter()
            .filter(|node| node.state != NodeState::Stopped)
            .flat_map(|node| node.interfaces.iter())
            .any(|iface| iface.is_attached() && iface.address.is_some_and(|net| net.addr() == addr))
    }

    /// Adds a static route to `destination` on `node`.
    ///
    /// A gateway must either be configured somewhere in the network, or lie inside one of the
    /// node's connected subnets; in the latter case the route is *pending* until
    /// [`Network::verify_routes`] confirms the gateway exists. A direct route without `iface`
    /// uses the first addressed interface.
    pub fn add_route(
        &mut self,
        node: NodeId,
        destination: IpNet,
        next_hop: NextHop,
        iface: Option<usize>,
    ) -> Result<()> {
        let destination = destination.trunc();
        let n = self.node(node)?;
        n.ensure_alive()?;

        if n.routes.contains(destination) || n.connected_networks().any(|net| net == destination) {
            return Err(Error::ConflictingRoute { node: n.name.clone(), destination });
        }

        let unreachable = || Error::InvalidNextHop { node: n.name.clone(), next_hop };

        let out = match iface {
            Some(index) => Some(
                n.interfaces
                    .get(index)
                    .filter(|i| i.is_attached())
                    .ok_or(Error::InterfaceNotFound(IfaceId::new(node, index)))?,
            ),
            None => None,
        };

        let (out, gateway, pending) = match next_hop {
            NextHop::Direct => {
                let out = match out {
                    Some(out) => out,
                    None => n
                        .interfaces
                        .iter()
                        .find(|i| i.is_attached() && i.address.is_some())
                        .ok_or_else(unreachable)?,
                };
                (Some(out), None, false)
            }
            NextHop::Via(addr) if self.is_configured(addr) => (out, Some(addr), false),
            NextHop::Via(addr) if n.connected_networks().any(|net| net.contains(&addr)) => {
                (out, Some(addr), true)
            }
            NextHop::Via(_) => return Err(unreachable()),
        };

        let route =
            KernelRoute { destination, gateway, device: out.map(|iface| iface.device.as_str()) };
        self.backend.add_route(&n.namespace, route)?;
        debug!(node = %n.name, %destination, %next_hop, pending, "added route");

        let entry =
            RouteEntry { destination, next_hop, iface: out.map(|iface| iface.id.index), pending };
        self.node_mut(node)?.routes.push(entry);
        Ok(())
    }

    /// Longest-prefix match of `destination` on `node`, over explicit and connected routes.
    /// `None` means the destination is unreachable.
    pub fn resolve_route(&self, node: NodeId, destination: IpAddr) -> Result<Option<NextHop>> {
        let n = self.node(node)?;
        Ok(n.routes.lookup(destination, n.connected_networks()))
    }

    /// The explicit routes of `node`, in installation order.
    pub fn routes(&self, node: NodeId) -> Result<&[RouteEntry]> {
        Ok(self.node(node)?.routes.entries())
    }

    /// Fails with [`Error::InvalidNextHop`] if a pending gateway is still not configured on any
    /// live node.
    pub fn verify_routes(&self) -> Result<()> {
        self.nodes
            .iter()
            .filter(|n| n.state != NodeState::Stopped)
            .try_for_each(|n| self.verify_node_routes(n))
    }

    /// Like [`Network::verify_routes`], restricted to the routes of one node.
    pub(crate) fn verify_node_routes(&self, node: &Node) -> Result<()> {
        let missing = node
            .routes
            .entries()
            .iter()
            .filter(|entry| entry.pending)
            .find(|entry| {
                matches!(entry.next_hop, NextHop::Via(addr) if !self.is_configured(addr))
            });

        match missing {
            Some(entry) => {
                Err(Error::InvalidNextHop { node: node.name.clone(), next_hop: entry.next_hop })
            }
            None => Ok(()),
        }
    }
}
