use std::{net::IpAddr, sync::Arc};

use vnet::{
    EngineConfig, ExitCode, MemoryBackend, NextHop, NodeSpec, Output, RouteSpec, TopologySpec,
};

pub(crate) fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// H1 (10.0.0.1/24) -- R1 (10.0.0.3/24), with R1 forwarding and H1 defaulting through R1.
pub(crate) fn router_lab() -> TopologySpec {
    TopologySpec::new()
        .node(NodeSpec::host("h1"))
        .node(NodeSpec::router("r1").forwarding(true))
        .link("h1", "r1")
        .address("h1", 0, "10.0.0.1/24".parse().unwrap())
        .address("r1", 0, "10.0.0.3/24".parse().unwrap())
        .route("h1", RouteSpec::new("0.0.0.0/0".parse().unwrap(), NextHop::Via(ip("10.0.0.3"))))
}

/// Three hosts on switch s1, host h{n} on port n, with port 2 blocked.
pub(crate) fn switch_lab() -> TopologySpec {
    TopologySpec::new()
        .node(NodeSpec::switch("s1"))
        .node(NodeSpec::host("h1"))
        .node(NodeSpec::host("h2"))
        .node(NodeSpec::host("h3"))
        .link("s1", "h1")
        .link("s1", "h2")
        .link("s1", "h3")
        .address("h1", 0, "10.0.0.1/24".parse().unwrap())
        .address("h2", 0, "10.0.0.2/24".parse().unwrap())
        .address("h3", 0, "10.0.0.3/24".parse().unwrap())
        .flow("s1", "priority=100,in_port=2,actions=drop")
}

/// A memory backend whose pings succeed when `reachable(namespace, target)` says so.
pub(crate) fn pinging(
    reachable: impl Fn(&str, &str) -> bool + Send + Sync + 'static,
) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new().with_responder(move |namespace, command| {
        let Some(target) = command.strip_prefix("ping -c 1 -W 1 ") else {
            return Output::empty();
        };
        if reachable(namespace, target) {
            Output::new(ExitCode::Code(0), format!("64 bytes from {target}: icmp_seq=1"), "")
        } else {
            Output::new(ExitCode::Code(1), "1 packets transmitted, 0 received", "")
        }
    }))
}

pub(crate) fn config() -> EngineConfig {
    EngineConfig::default().with_namespace_prefix("it")
}
