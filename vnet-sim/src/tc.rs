//! Ingress filters on switch ports, expressed as `tc` flower filters.
//!
//! Each port device of a switch gets a `clsact` qdisc. Every [`PortFilter`] becomes one flower
//! filter on the ingress hook:
//!
//! ```text
//! tc filter add dev s1-eth2 ingress protocol all pref 1 flower action drop
//! tc filter add dev s1-eth1 ingress protocol all pref 1 flower \
//!     action mirred egress redirect dev s1-eth3
//! ```
//!
//! Lower preference values are consulted first. A packet matching no filter continues into the
//! bridge, which performs regular learning-switch forwarding.

use std::net::IpAddr;

use ipnet::IpNet;
use pnet::util::MacAddr;

/// Match fields of a flower filter. `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterMatch {
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ip_src: Option<IpNet>,
    pub ip_dst: Option<IpNet>,
    pub ip_proto: Option<u8>,
}

impl FilterMatch {
    /// The ethertype selector for the filter: IP fields require a concrete protocol.
    fn protocol(&self) -> &'static str {
        let net = self.ip_src.or(self.ip_dst);
        match net.map(|net| net.addr()) {
            Some(IpAddr::V6(_)) => "ipv6",
            Some(IpAddr::V4(_)) => "ip",
            None if self.ip_proto.is_some() => "ip",
            None => "all",
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        if let Some(mac) = self.eth_src {
            args.extend(["src_mac".to_string(), mac.to_string()]);
        }
        if let Some(mac) = self.eth_dst {
            args.extend(["dst_mac".to_string(), mac.to_string()]);
        }
        if let Some(proto) = self.ip_proto {
            args.extend(["ip_proto".to_string(), ip_proto_name(proto)]);
        }
        if let Some(net) = self.ip_src {
            args.extend(["src_ip".to_string(), net.trunc().to_string()]);
        }
        if let Some(net) = self.ip_dst {
            args.extend(["dst_ip".to_string(), net.trunc().to_string()]);
        }
    }
}

/// What a matching filter does with the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Discard the packet.
    Drop,
    /// Hand the packet to the bridge.
    Pass,
    /// Send the packet out of the given device, bypassing the bridge.
    Redirect(String),
    /// Send a copy out of each device, then discard the original.
    Mirror(Vec<String>),
}

impl FilterAction {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Self::Drop => args.extend(["action".to_string(), "drop".to_string()]),
            Self::Pass => args.extend(["action".to_string(), "pass".to_string()]),
            Self::Redirect(dev) => {
                args.extend(["action", "mirred", "egress", "redirect", "dev"].map(String::from));
                args.push(dev.clone());
            }
            Self::Mirror(devs) => {
                for dev in devs {
                    args.extend(["action", "mirred", "egress", "mirror", "dev"].map(String::from));
                    args.push(dev.clone());
                }
                args.extend(["action".to_string(), "drop".to_string()]);
            }
        }
    }
}

/// A single ingress filter on a port device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFilter {
    /// `tc` preference. Lower values are evaluated first.
    pub preference: u16,
    pub matcher: FilterMatch,
    pub action: FilterAction,
}

impl PortFilter {
    /// Build the `tc filter add` arguments (without the leading `tc`) installing this filter on
    /// `device`.
    pub fn to_args(&self, device: &str) -> Vec<String> {
        let mut args: Vec<String> =
            ["filter", "add", "dev", device, "ingress", "protocol", self.matcher.protocol(), "pref"]
                .map(String::from)
                .to_vec();
        args.push(self.preference.to_string());
        args.push("flower".to_string());
        self.matcher.push_args(&mut args);
        self.action.push_args(&mut args);
        args
    }
}

fn ip_proto_name(proto: u8) -> String {
    match proto {
        1 => "icmp".to_string(),
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        58 => "icmpv6".to_string(),
        132 => "sctp".to_string(),
        other => format!("0x{other:02x}"),
    }
}
