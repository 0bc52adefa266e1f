use std::net::IpAddr;

use ipnet::IpNet;
use pnet::util::MacAddr;

use crate::{Error, Result};

/// A switch port number. Ports are numbered from 1.
pub type PortNo = u16;

/// Rule priority. Higher values are evaluated first.
pub type Priority = u16;

/// Priority given to rules that don't state one, matching `ovs-ofctl`.
pub const DEFAULT_PRIORITY: Priority = 32768;

/// The header fields a [`FlowMatch`] can constrain. Unset fields are wildcards.
///
/// IP prefixes are kept truncated to their network address so that two matches covering the
/// same packets compare equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: Option<PortNo>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ip_src: Option<IpNet>,
    pub ip_dst: Option<IpNet>,
    pub ip_proto: Option<u8>,
}

impl FlowMatch {
    /// A match that accepts every packet.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn in_port(mut self, port: PortNo) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn eth_src(mut self, mac: MacAddr) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn eth_dst(mut self, mac: MacAddr) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn ip_src(mut self, net: IpNet) -> Self {
        self.ip_src = Some(net.trunc());
        self
    }

    pub fn ip_dst(mut self, net: IpNet) -> Self {
        self.ip_dst = Some(net.trunc());
        self
    }

    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    /// Returns `true` if no field is constrained.
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `true` if a packet with `fields` arriving on `ingress` satisfies every set field.
    pub fn matches(&self, ingress: PortNo, fields: &PacketFields) -> bool {
        fn field<T: PartialEq>(want: Option<T>, got: Option<T>) -> bool {
            want.map_or(true, |want| got == Some(want))
        }

        fn prefix(want: Option<IpNet>, got: Option<IpAddr>) -> bool {
            want.map_or(true, |net| got.is_some_and(|addr| net.contains(&addr)))
        }

        self.in_port.map_or(true, |port| port == ingress)
            && field(self.eth_src, fields.eth_src)
            && field(self.eth_dst, fields.eth_dst)
            && prefix(self.ip_src, fields.ip_src)
            && prefix(self.ip_dst, fields.ip_dst)
            && field(self.ip_proto, fields.ip_proto)
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.ip_src = self.ip_src.map(|net| net.trunc());
        self.ip_dst = self.ip_dst.map(|net| net.trunc());
        self
    }
}

/// The header fields of a packet presented to [`FlowTable::evaluate`](crate::FlowTable::evaluate).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFields {
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ip_src: Option<IpAddr>,
    pub ip_dst: Option<IpAddr>,
    pub ip_proto: Option<u8>,
}

impl PacketFields {
    /// An Ethernet frame between two MAC addresses, without an IP header.
    pub fn ethernet(src: MacAddr, dst: MacAddr) -> Self {
        Self { eth_src: Some(src), eth_dst: Some(dst), ..Default::default() }
    }

    pub fn with_ip(mut self, src: IpAddr, dst: IpAddr, proto: u8) -> Self {
        self.ip_src = Some(src);
        self.ip_dst = Some(dst);
        self.ip_proto = Some(proto);
        self
    }
}

/// What to do with a packet that hit a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Drop,
    /// Send out of a single port. Output to the ingress port or to an unknown port drops.
    Output(PortNo),
    /// Send out of every port except the ingress one.
    Flood,
    /// Hand the packet to the learning switch.
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowRule {
    pub priority: Priority,
    pub matcher: FlowMatch,
    pub action: Action,
}

impl FlowRule {
    pub fn new(priority: Priority, matcher: FlowMatch, action: Action) -> Self {
        Self { priority, matcher, action }
    }

    /// Checks the rule can be installed: priority 0 belongs to the normal path, and port 0 does
    /// not exist.
    pub fn validate(&self) -> Result<()> {
        if self.priority == 0 {
            return Err(Error::ReservedPriority);
        }

        if self.matcher.in_port == Some(0) || self.action == Action::Output(0) {
            return Err(Error::InvalidPort);
        }

        Ok(())
    }
}
