use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{info_span, warn};
use vnet_sim::Backend;

use crate::{
    link::{Interface, Link, LinkId},
    node::{Node, NodeId},
    EngineConfig, Error, IfaceId, Result,
};

/// A set of nodes and the links between them, backed by kernel namespaces.
///
/// Mutating operations take `&mut self`; [`Network::run`] and the other read-only operations take
/// `&self`, so probes against independent nodes can run concurrently from scoped threads.
///
/// Dropping the network tears it down.
#[derive(Debug)]
pub struct Network {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) config: EngineConfig,
    pub(crate) nodes: Vec<Node>,
    pub(crate) names: FxHashMap<String, NodeId>,
    /// Indexed by [`LinkId`]. Destroyed links leave an empty slot.
    pub(crate) links: Vec<Option<Link>>,
}

impl Network {
    pub fn new(backend: Arc<dyn Backend>, config: EngineConfig) -> Self {
        Self { backend, config, nodes: Vec::new(), names: FxHashMap::default(), links: Vec::new() }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.0).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Looks a node up by name.
    pub fn node_id(&self, name: &str) -> Result<NodeId> {
        self.names.get(name).copied().ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Every node ever created, in creation order. Destroyed nodes are [`Stopped`].
    ///
    /// [`Stopped`]: crate::NodeState::Stopped
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// The links currently alive, in creation order.
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().flatten()
    }

    pub fn link(&self, id: LinkId) -> Result<&Link> {
        self.links.get(id.0).and_then(Option::as_ref).ok_or(Error::LinkNotFound(id))
    }

    pub fn interface(&self, id: IfaceId) -> Result<&Interface> {
        self.node(id.node)?.interfaces.get(id.index).ok_or(Error::InterfaceNotFound(id))
    }

    pub(crate) fn interface_mut(&mut self, id: IfaceId) -> Result<&mut Interface> {
        self.node_mut(id.node)?.interfaces.get_mut(id.index).ok_or(Error::InterfaceNotFound(id))
    }

    /// Destroys every link, then every node, both in reverse creation order.
    ///
    /// Failures are logged and skipped so that everything that can be released is. Calling this
    /// again is a no-op.
    pub fn teardown(&mut self) {
        let _span = info_span!("teardown", nodes = self.nodes.len()).entered();

        for slot in (0..self.links.len()).rev() {
            let id = LinkId(slot);
            if self.links[slot].is_some() {
                if let Err(e) = self.remove_link(id, false) {
                    warn!(%id, ?e, "failed to destroy link");
                }
            }
        }

        for index in (0..self.nodes.len()).rev() {
            let id = NodeId(index);
            if let Err(e) = self.destroy_node(id) {
                warn!(name = %self.nodes[index].name, ?e, "failed to destroy node");
            }
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.teardown();
    }
}
