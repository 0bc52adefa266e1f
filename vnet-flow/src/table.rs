use std::collections::BTreeSet;

use pnet::util::MacAddr;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{Action, FlowMatch, FlowRule, PacketFields, PortNo, Priority, Result};

/// The forwarding decision for a single packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Drop,
    Output(PortNo),
    /// Sent out of every listed port. The ingress port is never listed.
    Flood(Vec<PortNo>),
}

impl Decision {
    /// The egress ports of this decision, in ascending order.
    pub fn ports(&self) -> Vec<PortNo> {
        match self {
            Self::Drop => Vec::new(),
            Self::Output(port) => vec![*port],
            Self::Flood(ports) => ports.clone(),
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }
}

/// The flow table of a single switch.
///
/// Rules are kept in evaluation order: descending priority, then installation order. The
/// learning table maps source MAC addresses to the port they were last seen on, and is only
/// fed by packets that reach the normal pipeline.
#[derive(Debug, Clone)]
pub struct FlowTable {
    rules: Vec<FlowRule>,
    ports: BTreeSet<PortNo>,
    learning: bool,
    learned: FxHashMap<MacAddr, PortNo>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    /// Creates an empty table with learning enabled.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            ports: BTreeSet::new(),
            learning: true,
            learned: FxHashMap::default(),
        }
    }

    pub fn with_ports(ports: impl IntoIterator<Item = PortNo>) -> Self {
        let mut table = Self::new();
        table.ports.extend(ports);
        table
    }

    pub fn learning(&self) -> bool {
        self.learning
    }

    /// Turns learning on or off. Turning it off forgets every binding.
    pub fn set_learning(&mut self, enabled: bool) {
        self.learning = enabled;
        if !enabled {
            self.learned.clear();
        }
    }

    /// Adds a port. Returns `false` if it was already present.
    pub fn add_port(&mut self, port: PortNo) -> bool {
        self.ports.insert(port)
    }

    /// Removes a port and forgets every binding learned on it. Rules referencing the port are
    /// kept; outputs to it drop until the port comes back.
    pub fn remove_port(&mut self, port: PortNo) -> bool {
        self.learned.retain(|_, bound| *bound != port);
        self.ports.remove(&port)
    }

    pub fn ports(&self) -> impl Iterator<Item = PortNo> + '_ {
        self.ports.iter().copied()
    }

    pub fn has_port(&self, port: PortNo) -> bool {
        self.ports.contains(&port)
    }

    /// Installs a rule. A rule with the same priority and match is replaced in place and
    /// returned.
    pub fn install(&mut self, rule: FlowRule) -> Result<Option<FlowRule>> {
        rule.validate()?;
        let replaced = insert(&mut self.rules, normalize(rule));
        debug!(%rule, replaced = replaced.is_some(), "installed flow");
        Ok(replaced)
    }

    /// Removes the rule with exactly this priority and match.
    pub fn remove(&mut self, priority: Priority, matcher: &FlowMatch) -> Option<FlowRule> {
        let matcher = matcher.normalized();
        let pos = self.rules.iter().position(|r| r.priority == priority && r.matcher == matcher)?;
        let rule = self.rules.remove(pos);
        debug!(%rule, "removed flow");
        Some(rule)
    }

    /// Replaces every rule with `rules`. The batch is validated first: on error the table is
    /// left untouched.
    pub fn replace_all(&mut self, rules: impl IntoIterator<Item = FlowRule>) -> Result<()> {
        let mut next = Vec::new();
        for rule in rules {
            rule.validate()?;
            insert(&mut next, normalize(rule));
        }

        debug!(count = next.len(), "replaced flow table");
        self.rules = next;
        Ok(())
    }

    /// Removes every explicit rule, leaving only the normal pipeline. Learned bindings are
    /// kept.
    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// The explicit rules, in evaluation order.
    pub fn rules(&self) -> &[FlowRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The port learned for `mac`, if any.
    pub fn learned_port(&self, mac: MacAddr) -> Option<PortNo> {
        self.learned.get(&mac).copied()
    }

    /// Decides where a packet arriving on `ingress` goes.
    pub fn evaluate(&mut self, ingress: PortNo, fields: &PacketFields) -> Decision {
        let hit = self.rules.iter().find(|r| r.matcher.matches(ingress, fields));
        trace!(ingress, rule = ?hit, "evaluating packet");

        match hit.map(|r| r.action) {
            Some(Action::Drop) => Decision::Drop,
            Some(Action::Output(port)) => self.output(ingress, port),
            Some(Action::Flood) => self.flood(ingress),
            Some(Action::Normal) | None => self.normal(ingress, fields),
        }
    }

    fn output(&self, ingress: PortNo, port: PortNo) -> Decision {
        if port == ingress || !self.ports.contains(&port) {
            Decision::Drop
        } else {
            Decision::Output(port)
        }
    }

    fn flood(&self, ingress: PortNo) -> Decision {
        let ports: Vec<_> = self.ports().filter(|p| *p != ingress).collect();
        if ports.is_empty() {
            Decision::Drop
        } else {
            Decision::Flood(ports)
        }
    }

    fn normal(&mut self, ingress: PortNo, fields: &PacketFields) -> Decision {
        if !self.learning {
            return self.flood(ingress);
        }

        if let Some(src) = fields.eth_src.filter(|mac| is_unicast(*mac)) {
            if self.ports.contains(&ingress) {
                self.learned.insert(src, ingress);
            }
        }

        match fields.eth_dst.and_then(|dst| self.learned_port(dst)) {
            Some(port) => self.output(ingress, port),
            None => self.flood(ingress),
        }
    }
}

fn normalize(mut rule: FlowRule) -> FlowRule {
    rule.matcher = rule.matcher.normalized();
    rule
}

/// Inserts `rule` after every rule of higher or equal priority, or replaces the rule with the
/// same priority and match.
fn insert(rules: &mut Vec<FlowRule>, rule: FlowRule) -> Option<FlowRule> {
    if let Some(existing) =
        rules.iter_mut().find(|r| r.priority == rule.priority && r.matcher == rule.matcher)
    {
        return Some(std::mem::replace(existing, rule));
    }

    let pos = rules.partition_point(|r| r.priority >= rule.priority);
    rules.insert(pos, rule);
    None
}

const fn is_unicast(mac: MacAddr) -> bool {
    mac.0 & 0x01 == 0
}
