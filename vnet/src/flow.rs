//! Flow tables of switch nodes.
//!
//! The table of each switch is kept in a [`FlowTable`] and mirrored into the kernel as `tc`
//! flower filters on the ingress of every switch port, ahead of the bridge:
//!
//! | rule action  | filter action                                  |
//! |--------------|------------------------------------------------|
//! | `drop`       | `drop`                                         |
//! | `output:N`   | `mirred egress redirect` to the device of port N |
//! | `flood`      | `mirred egress mirror` to every other port, then `drop` |
//! | `normal`     | `pass`, leaving the packet to the bridge         |
//!
//! Filter preferences follow evaluation order, so the first matching filter is the first
//! matching rule. Packets that match nothing reach the bridge, which learns and floods like the
//! implicit normal action.

use tracing::{debug, debug_span, warn};
use vnet_flow::{Action, Decision, FlowMatch, FlowRule, FlowTable, PacketFields, PortNo, Priority};
use vnet_sim::{Endpoint, FilterAction, FilterMatch, PortFilter};

use crate::{Error, Network, NodeId, NodeState, Result};

impl Network {
    fn table(&self, switch: NodeId) -> Result<&FlowTable> {
        let node = self.node(switch)?;
        node.flows.as_ref().ok_or_else(|| Error::UnsupportedKind {
            node: node.name.clone(),
            kind: node.kind,
            operation: "flow tables",
        })
    }

    fn table_mut(&mut self, switch: NodeId) -> Result<&mut FlowTable> {
        self.table(switch)?;
        let node = self.node_mut(switch)?;
        node.ensure_alive()?;
        node.flows.as_mut().ok_or_else(|| Error::NodeNotFound(switch.to_string()))
    }

    /// Makes `table` the flow table of `switch` once its filters are in the kernel. If the sync
    /// fails, the previous table is kept and its filters are put back.
    fn commit_table(&mut self, switch: NodeId, table: FlowTable) -> Result<()> {
        let previous = std::mem::replace(self.table_mut(switch)?, table);
        let Err(e) = self.sync_flows(switch) else { return Ok(()) };

        *self.table_mut(switch)? = previous;
        if let Err(e) = self.sync_flows(switch) {
            warn!(?e, %switch, "failed to restore filters of the previous flow table");
        }
        Err(e)
    }

    /// Installs a rule on a switch, replacing the rule with the same priority and match.
    pub fn install_flow(&mut self, switch: NodeId, rule: FlowRule) -> Result<()> {
        let mut table = self.table_mut(switch)?.clone();
        table.install(rule)?;
        self.commit_table(switch, table)
    }

    /// Removes the rule with exactly this priority and match. Returns whether one was removed.
    pub fn delete_flow(
        &mut self,
        switch: NodeId,
        priority: Priority,
        matcher: &FlowMatch,
    ) -> Result<bool> {
        let mut table = self.table_mut(switch)?.clone();
        if table.remove(priority, matcher).is_none() {
            return Ok(false);
        }
        self.commit_table(switch, table)?;
        Ok(true)
    }

    /// Replaces the whole table of a switch. Nothing changes if any rule is invalid.
    pub fn replace_flows(
        &mut self,
        switch: NodeId,
        rules: impl IntoIterator<Item = FlowRule>,
    ) -> Result<()> {
        let mut table = self.table_mut(switch)?.clone();
        table.replace_all(rules)?;
        self.commit_table(switch, table)
    }

    /// Removes every explicit rule, reverting the switch to normal forwarding.
    pub fn clear_flows(&mut self, switch: NodeId) -> Result<()> {
        let mut table = self.table_mut(switch)?.clone();
        table.clear();
        self.commit_table(switch, table)
    }

    /// Turns MAC learning of the normal pipeline on or off. Turning it off forgets every learned
    /// binding, so unknown destinations flood. Only the table model is affected: the kernel
    /// bridge keeps its own forwarding database.
    pub fn set_learning(&mut self, switch: NodeId, enabled: bool) -> Result<()> {
        self.table_mut(switch)?.set_learning(enabled);
        debug!(%switch, enabled, "set mac learning");
        Ok(())
    }

    /// Rules of a switch in evaluation order.
    pub fn dump_flows(&self, switch: NodeId) -> Result<&[FlowRule]> {
        Ok(self.table(switch)?.rules())
    }

    /// Runs a packet through a switch's table, updating its learned bindings.
    pub fn evaluate(
        &mut self,
        switch: NodeId,
        ingress: PortNo,
        fields: &PacketFields,
    ) -> Result<Decision> {
        Ok(self.table_mut(switch)?.evaluate(ingress, fields))
    }

    /// Mirrors the flow table of `switch` into ingress filters on each of its ports.
    pub(crate) fn sync_flows(&self, switch: NodeId) -> Result<()> {
        let node = self.node(switch)?;
        let Some(table) = node.flows.as_ref() else { return Ok(()) };
        if node.state == NodeState::Stopped {
            return Ok(());
        }

        let _span = debug_span!("sync_flows", switch = %node.name, rules = table.len()).entered();

        let ports: Vec<(PortNo, &str)> = node
            .interfaces
            .iter()
            .filter(|iface| iface.is_attached())
            .filter_map(|iface| iface.port.map(|port| (port, iface.device.as_str())))
            .collect();

        for &(port, device) in &ports {
            let end = Endpoint::new(&node.namespace, device);
            self.backend.clear_filters(end)?;

            let rules = table
                .rules()
                .iter()
                .filter(|rule| rule.matcher.in_port.map_or(true, |p| p == port));
            for (preference, rule) in (1..=u16::MAX).zip(rules) {
                let filter = PortFilter {
                    preference,
                    matcher: filter_match(&rule.matcher),
                    action: filter_action(rule.action, port, &ports),
                };
                self.backend.add_filter(end, &filter)?;
            }
        }

        debug!(ports = ports.len(), "synced flow table");
        Ok(())
    }
}

fn filter_match(matcher: &FlowMatch) -> FilterMatch {
    FilterMatch {
        eth_src: matcher.eth_src,
        eth_dst: matcher.eth_dst,
        ip_src: matcher.ip_src,
        ip_dst: matcher.ip_dst,
        ip_proto: matcher.ip_proto,
    }
}

fn filter_action(action: Action, ingress: PortNo, ports: &[(PortNo, &str)]) -> FilterAction {
    let device = |port: PortNo| {
        ports.iter().find(|(p, _)| *p == port && port != ingress).map(|(_, dev)| dev.to_string())
    };

    match action {
        Action::Output(port) => device(port).map_or(FilterAction::Drop, FilterAction::Redirect),
        Action::Flood => {
            let others: Vec<_> = ports.iter().filter_map(|(port, _)| device(*port)).collect();
            if others.is_empty() {
                FilterAction::Drop
            } else {
                FilterAction::Mirror(others)
            }
        }
        Action::Normal => FilterAction::Pass,
        Action::Drop => FilterAction::Drop,
    }
}
