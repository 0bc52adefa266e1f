//! `ovs-ofctl` text form of flow rules.
//!
//! Supported fields: `priority`, `table` (0 only), `in_port`, `dl_src`/`eth_src`,
//! `dl_dst`/`eth_dst`, `nw_src`/`ip_src`, `nw_dst`/`ip_dst`, `nw_proto`/`ip_proto`, and the
//! protocol shorthands `ip`, `icmp`, `tcp`, `udp`. Exactly one action is supported in
//! `actions=` (or `action=`): `drop`, `output:N` (or a bare port number), `flood`, `normal`.

use std::{fmt, net::IpAddr, str::FromStr};

use ipnet::IpNet;
use pnet::util::MacAddr;

use crate::{Action, Error, FlowMatch, FlowRule, PortNo, Priority, DEFAULT_PRIORITY};

const ICMP: u8 = 1;
const TCP: u8 = 6;
const UDP: u8 = 17;

impl FromStr for FlowRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Everything after `actions=` belongs to the action list, which may contain commas.
        let (fields, actions) = split_actions(s).ok_or(Error::MissingActions)?;

        let mut priority = None;
        let mut matcher = FlowMatch::any();

        for token in fields.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (token, ""),
            };

            match key {
                "priority" => set(&mut priority, key, parse_num::<Priority>(key, value)?)?,
                "table" => {
                    if parse_num::<u8>(key, value)? != 0 {
                        return Err(invalid(key, value));
                    }
                }
                "in_port" => set(&mut matcher.in_port, key, parse_num::<PortNo>(key, value)?)?,
                "dl_src" | "eth_src" => set(&mut matcher.eth_src, key, parse_mac(key, value)?)?,
                "dl_dst" | "eth_dst" => set(&mut matcher.eth_dst, key, parse_mac(key, value)?)?,
                "nw_src" | "ip_src" => set(&mut matcher.ip_src, key, parse_net(key, value)?)?,
                "nw_dst" | "ip_dst" => set(&mut matcher.ip_dst, key, parse_net(key, value)?)?,
                "nw_proto" | "ip_proto" => {
                    set(&mut matcher.ip_proto, key, parse_num::<u8>(key, value)?)?
                }
                "ip" if value.is_empty() => {}
                "icmp" if value.is_empty() => set(&mut matcher.ip_proto, key, ICMP)?,
                "tcp" if value.is_empty() => set(&mut matcher.ip_proto, key, TCP)?,
                "udp" if value.is_empty() => set(&mut matcher.ip_proto, key, UDP)?,
                _ => return Err(Error::UnknownField(key.to_owned())),
            }
        }

        let rule = FlowRule {
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            matcher: matcher.normalized(),
            action: parse_action(actions)?,
        };
        rule.validate()?;

        Ok(rule)
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={}", self.priority)?;
        if !self.matcher.is_wildcard() {
            write!(f, ",{}", self.matcher)?;
        }
        write!(f, ",actions={}", self.action)
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut fields = Vec::with_capacity(6);
        if let Some(port) = self.in_port {
            fields.push(format!("in_port={port}"));
        }
        if let Some(mac) = self.eth_src {
            fields.push(format!("dl_src={mac}"));
        }
        if let Some(mac) = self.eth_dst {
            fields.push(format!("dl_dst={mac}"));
        }
        if let Some(net) = self.ip_src {
            fields.push(format!("nw_src={net}"));
        }
        if let Some(net) = self.ip_dst {
            fields.push(format!("nw_dst={net}"));
        }
        if let Some(proto) = self.ip_proto {
            fields.push(format!("nw_proto={proto}"));
        }

        f.write_str(&fields.join(","))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Output(port) => write!(f, "output:{port}"),
            Self::Flood => f.write_str("flood"),
            Self::Normal => f.write_str("normal"),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_action(s)
    }
}

fn split_actions(s: &str) -> Option<(&str, &str)> {
    for key in ["actions=", "action="] {
        if let Some(start) = s.find(key) {
            let fields = s[..start].trim_end().trim_end_matches(',');
            return Some((fields, &s[start + key.len()..]));
        }
    }
    None
}

fn parse_action(s: &str) -> Result<Action, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::MissingActions);
    }
    if s.contains(',') {
        return Err(Error::UnsupportedAction(s.to_owned()));
    }

    let lower = s.to_ascii_lowercase();
    let action = match lower.as_str() {
        "drop" => Action::Drop,
        "flood" | "all" => Action::Flood,
        "normal" => Action::Normal,
        other => {
            let port = other.strip_prefix("output:").unwrap_or(other);
            let port = port.parse::<PortNo>().map_err(|_| Error::UnsupportedAction(s.to_owned()))?;
            Action::Output(port)
        }
    };

    Ok(action)
}

fn set<T>(slot: &mut Option<T>, key: &str, value: T) -> Result<(), Error> {
    if slot.is_some() {
        return Err(Error::DuplicateField(key.to_owned()));
    }
    *slot = Some(value);
    Ok(())
}

fn invalid(field: &str, value: &str) -> Error {
    Error::InvalidValue { field: field.to_owned(), value: value.to_owned() }
}

fn parse_num<T: FromStr>(field: &str, value: &str) -> Result<T, Error> {
    value.parse().map_err(|_| invalid(field, value))
}

fn parse_mac(field: &str, value: &str) -> Result<MacAddr, Error> {
    value.parse().map_err(|_| invalid(field, value))
}

fn parse_net(field: &str, value: &str) -> Result<IpNet, Error> {
    if value.contains('/') {
        value.parse::<IpNet>().map(|net| net.trunc()).map_err(|_| invalid(field, value))
    } else {
        value.parse::<IpAddr>().map(IpNet::from).map_err(|_| invalid(field, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lab_rules() {
        let drop: FlowRule = "priority=100,in_port=2,actions=drop".parse().unwrap();
        assert_eq!(drop, FlowRule::new(100, FlowMatch::any().in_port(2), Action::Drop));

        let out: FlowRule = "priority=100,in_port=1,actions=output:3".parse().unwrap();
        assert_eq!(out.action, Action::Output(3));

        let normal: FlowRule = "action=normal".parse().unwrap();
        assert_eq!(normal, FlowRule::new(DEFAULT_PRIORITY, FlowMatch::any(), Action::Normal));
    }

    #[test]
    fn parses_l2_and_l3_fields() {
        let rule: FlowRule =
            "priority=7, dl_src=02:00:00:00:00:01, nw_dst=10.0.0.9/24, icmp, actions=flood"
                .parse()
                .unwrap();

        assert_eq!(rule.priority, 7);
        assert_eq!(rule.matcher.eth_src, Some(MacAddr::new(2, 0, 0, 0, 0, 1)));
        assert_eq!(rule.matcher.ip_dst, Some("10.0.0.0/24".parse().unwrap()));
        assert_eq!(rule.matcher.ip_proto, Some(ICMP));
        assert_eq!(rule.action, Action::Flood);

        let host: FlowRule = "nw_src=10.0.0.1,actions=2".parse().unwrap();
        assert_eq!(host.matcher.ip_src, Some("10.0.0.1/32".parse().unwrap()));
        assert_eq!(host.action, Action::Output(2));
    }

    #[test]
    fn display_is_parseable() {
        let rule = FlowRule::new(
            300,
            FlowMatch::any()
                .in_port(1)
                .eth_dst(MacAddr::new(2, 0, 0, 0, 0, 2))
                .ip_src("192.168.1.0/24".parse().unwrap())
                .ip_proto(TCP),
            Action::Output(4),
        );

        let text = rule.to_string();
        assert_eq!(
            text,
            "priority=300,in_port=1,dl_dst=02:00:00:00:00:02,nw_src=192.168.1.0/24,nw_proto=6,\
             actions=output:4"
        );
        assert_eq!(text.parse::<FlowRule>().unwrap(), rule);
        assert_eq!(
            FlowRule::new(5, FlowMatch::any(), Action::Drop).to_string(),
            "priority=5,actions=drop"
        );
    }

    #[test]
    fn rejects_bad_rules() {
        assert_eq!("priority=1,in_port=2".parse::<FlowRule>(), Err(Error::MissingActions));
        assert_eq!("actions=".parse::<FlowRule>(), Err(Error::MissingActions));
        assert_eq!("priority=0,actions=drop".parse::<FlowRule>(), Err(Error::ReservedPriority));
        assert_eq!("in_port=0,actions=drop".parse::<FlowRule>(), Err(Error::InvalidPort));
        assert_eq!(
            "vlan_tci=0,actions=drop".parse::<FlowRule>(),
            Err(Error::UnknownField("vlan_tci".into()))
        );
        assert_eq!(
            "in_port=1,in_port=2,actions=drop".parse::<FlowRule>(),
            Err(Error::DuplicateField("in_port".into()))
        );
        assert!(matches!(
            "dl_src=zz,actions=drop".parse::<FlowRule>(),
            Err(Error::InvalidValue { .. })
        ));
        assert!(matches!(
            "actions=output:1,output:2".parse::<FlowRule>(),
            Err(Error::UnsupportedAction(_))
        ));
        assert!(matches!(
            "table=1,actions=drop".parse::<FlowRule>(),
            Err(Error::InvalidValue { .. })
        ));
    }
}
