use std::fmt;

use ipnet::IpNet;
use tracing::{debug, debug_span, warn};
use vnet_flow::PortNo;
use vnet_sim::{Endpoint, MAX_DEVICE_NAME_LEN};

use crate::{Error, Network, NodeId, Result};

/// Handle to an interface: the node it belongs to and its 0-based creation index there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfaceId {
    pub node: NodeId,
    pub index: usize,
}

impl IfaceId {
    #[inline]
    pub fn new(node: NodeId, index: usize) -> Self {
        Self { node, index }
    }
}

impl fmt::Display for IfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/if{}", self.node, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) usize);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub(crate) id: IfaceId,
    pub(crate) device: String,
    pub(crate) port: Option<PortNo>,
    pub(crate) address: Option<IpNet>,
    pub(crate) peer: Option<IfaceId>,
    pub(crate) link: Option<LinkId>,
}

impl Interface {
    pub fn id(&self) -> IfaceId {
        self.id
    }

    /// Kernel device name, e.g. `h1-eth0`.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Flow table port number, on switches.
    pub fn port(&self) -> Option<PortNo> {
        self.port
    }

    pub fn address(&self) -> Option<IpNet> {
        self.address
    }

    /// The far end of the link, while the link is alive.
    pub fn peer(&self) -> Option<IfaceId> {
        self.peer
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }
}

/// A point-to-point link between two interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub(crate) id: LinkId,
    pub(crate) a: IfaceId,
    pub(crate) b: IfaceId,
}

impl Link {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn ends(&self) -> (IfaceId, IfaceId) {
        (self.a, self.b)
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.a.node == node || self.b.node == node
    }

    /// The end that is not on `node`. For a link that doesn't touch `node`, returns `a`.
    pub fn other(&self, node: NodeId) -> IfaceId {
        if self.a.node == node {
            self.b
        } else {
            self.a
        }
    }
}

/// Everything needed to create one side of a link.
struct Side {
    iface: IfaceId,
    namespace: String,
    device: String,
    /// Bridge and port number, on switches.
    bridge: Option<(String, PortNo)>,
}

impl Network {
    fn next_side(&self, node: NodeId) -> Result<Side> {
        let n = self.node(node)?;
        n.ensure_alive()?;

        let index = n.interfaces.len();
        let device = n.device_name(index);
        if device.len() > MAX_DEVICE_NAME_LEN {
            return Err(Error::InvalidName { name: device, reason: "device name too long" });
        }

        let bridge = match &n.flows {
            Some(_) => {
                let port = PortNo::try_from(index + 1)
                    .map_err(|_| Error::InvalidLink(format!("{} has no free port", n.name)))?;
                Some((n.bridge_name(), port))
            }
            None => None,
        };

        let namespace = n.namespace.clone();
        Ok(Side { iface: IfaceId::new(node, index), namespace, device, bridge })
    }

    /// Connects two nodes with a veth pair and returns the new interface on each side.
    ///
    /// Each interface gets the next index on its node. Switch sides join the switch's bridge and
    /// become flow table ports.
    pub fn create_link(&mut self, a: NodeId, b: NodeId) -> Result<(IfaceId, IfaceId)> {
        if a == b {
            let name = self.node(a)?.name.clone();
            return Err(Error::InvalidLink(format!("{name} cannot be linked to itself")));
        }

        let (sa, sb) = (self.next_side(a)?, self.next_side(b)?);
        let _span = debug_span!("create_link", a = %sa.device, b = %sb.device).entered();

        let end_a = Endpoint::new(&sa.namespace, &sa.device);
        let end_b = Endpoint::new(&sb.namespace, &sb.device);
        self.backend.add_veth(end_a, end_b)?;

        for (end, side) in [(end_a, &sa), (end_b, &sb)] {
            if let Some((bridge, _)) = &side.bridge {
                if let Err(e) = self.backend.attach_to_bridge(end, bridge) {
                    if let Err(e) = self.backend.del_link(end_a) {
                        warn!(?e, "failed to remove half-configured link");
                    }
                    return Err(e.into());
                }
            }
        }

        let id = LinkId(self.links.len());
        for (side, peer) in [(&sa, sb.iface), (&sb, sa.iface)] {
            let node = self.node_mut(side.iface.node)?;
            let port = side.bridge.as_ref().map(|(_, port)| *port);
            node.interfaces.push(Interface {
                id: side.iface,
                device: side.device.clone(),
                port,
                address: None,
                peer: Some(peer),
                link: Some(id),
            });
            if let (Some(flows), Some(port)) = (node.flows.as_mut(), port) {
                flows.add_port(port);
            }
        }
        self.links.push(Some(Link { id, a: sa.iface, b: sb.iface }));

        let synced = [&sa, &sb]
            .into_iter()
            .filter(|side| side.bridge.is_some())
            .try_for_each(|side| self.sync_flows(side.iface.node));
        if let Err(e) = synced {
            self.unwind_link(id, [&sa, &sb]);
            return Err(e);
        }

        debug!(%id, "created link");
        Ok((sa.iface, sb.iface))
    }

    /// Takes back a link created by [`Self::create_link`] whose filters could not be installed.
    /// Both interfaces and the link slot are dropped, so the next link reuses the same indices.
    fn unwind_link(&mut self, id: LinkId, sides: [&Side; 2]) {
        let _ = self.detach_link(id);
        self.links.truncate(id.0);
        for side in sides {
            if let Ok(node) = self.node_mut(side.iface.node) {
                node.interfaces.truncate(side.iface.index);
            }
        }

        let [first, _] = sides;
        if let Err(e) = self.backend.del_link(Endpoint::new(&first.namespace, &first.device)) {
            warn!(?e, "failed to remove half-configured link");
        }
        for side in sides.into_iter().filter(|side| side.bridge.is_some()) {
            if let Err(e) = self.sync_flows(side.iface.node) {
                warn!(?e, node = %side.iface.node, "failed to restore filters");
            }
        }
    }

    /// Destroys a link. Both interfaces stay on their nodes, detached.
    pub fn destroy_link(&mut self, id: LinkId) -> Result<()> {
        self.remove_link(id, true)
    }

    pub(crate) fn remove_link(&mut self, id: LinkId, resync: bool) -> Result<()> {
        let link = self.detach_link(id).ok_or(Error::LinkNotFound(id))?;
        let _span = debug_span!("destroy_link", %id).entered();

        // Deleting one end of a veth pair removes the other. Ends inside deleted namespaces are
        // already gone.
        let alive = [link.a, link.b].into_iter().find(|end| {
            self.node(end.node).is_ok_and(|n| n.state != crate::NodeState::Stopped)
        });
        if let Some(end) = alive {
            let node = self.node(end.node)?;
            let device = &node.interfaces[end.index].device;
            self.backend.del_link(Endpoint::new(&node.namespace, device))?;
        }

        if resync {
            for end in [link.a, link.b] {
                if self.node(end.node).is_ok_and(|n| n.flows.is_some()) {
                    self.sync_flows(end.node)?;
                }
            }
        }

        debug!("destroyed link");
        Ok(())
    }

    /// Removes a link from the model: clears both peers and drops switch ports from their flow
    /// tables.
    pub(crate) fn detach_link(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.get_mut(id.0)?.take()?;

        for end in [link.a, link.b] {
            let Some(node) = self.nodes.get_mut(end.node.0) else { continue };
            let Some(iface) = node.interfaces.get_mut(end.index) else { continue };

            iface.peer = None;
            iface.link = None;
            if let (Some(flows), Some(port)) = (node.flows.as_mut(), iface.port) {
                flows.remove_port(port);
            }
        }

        Some(link)
    }
}
