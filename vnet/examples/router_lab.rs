//! Two routers and three hosts with static routes. Pings across the routers and writes the
//! output to `result1.txt`.
//!
//! ```text
//! h1 --- r1 --- r2 --- h3
//!        |
//!        h2
//! ```
//!
//! Needs root: `sudo -E cargo run --example router_lab`.

use std::{fmt::Write as _, sync::Arc};

use vnet::{EngineConfig, NextHop, NodeSpec, Probe, RouteSpec, Topology, TopologySpec};

fn via(dest: &str, gateway: &str) -> RouteSpec {
    RouteSpec::new(dest.parse().unwrap(), NextHop::Via(gateway.parse().unwrap()))
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // Link order fixes interface numbering: r1-eth0 to h1, r1-eth1 to r2, r1-eth2 to h2.
    let spec = TopologySpec::new()
        .node(NodeSpec::host("h1"))
        .node(NodeSpec::host("h2"))
        .node(NodeSpec::host("h3"))
        .node(NodeSpec::router("r1").forwarding(true))
        .node(NodeSpec::router("r2").forwarding(true))
        .link("h1", "r1")
        .link("r1", "r2")
        .link("r2", "h3")
        .link("r1", "h2")
        .address("h1", 0, "10.0.0.1/24".parse().unwrap())
        .address("h2", 0, "10.0.3.2/24".parse().unwrap())
        .address("h3", 0, "10.0.2.2/24".parse().unwrap())
        .address("r1", 0, "10.0.0.3/24".parse().unwrap())
        .address("r1", 1, "10.0.1.1/24".parse().unwrap())
        .address("r1", 2, "10.0.3.4/24".parse().unwrap())
        .address("r2", 0, "10.0.1.2/24".parse().unwrap())
        .address("r2", 1, "10.0.2.1/24".parse().unwrap())
        .route("h1", via("0.0.0.0/0", "10.0.0.3"))
        .route("h2", via("0.0.0.0/0", "10.0.3.4"))
        .route("h3", via("0.0.0.0/0", "10.0.2.1"))
        .route("r1", via("10.0.2.0/24", "10.0.1.2"))
        .route("r2", via("10.0.0.0/24", "10.0.1.1"))
        .route("r2", via("10.0.3.0/24", "10.0.1.1"));

    let config = EngineConfig::default().with_namespace_prefix("lab1");
    let mut topology = Topology::build(&spec, Arc::new(config.ip_backend()), config).unwrap();

    let probes = [
        Probe::ping("h1", "10.0.2.2".parse().unwrap()),
        Probe::ping("h2", "10.0.2.2".parse().unwrap()),
        Probe::ping("h3", "10.0.0.1".parse().unwrap()),
        Probe::ping("h3", "10.0.3.2".parse().unwrap()),
    ];

    let mut report = String::new();
    for result in topology.probe_all(&probes).unwrap() {
        println!("Running on {}: {}", result.source(), result.command_line());
        let target = result.target().map(|ip| ip.to_string()).unwrap_or_default();
        writeln!(report, "From {} to {target}:", result.source()).unwrap();
        report.push_str(result.stdout());
        writeln!(report, "\n{}", "-".repeat(60)).unwrap();
    }

    std::fs::write("result1.txt", report).unwrap();
    println!("Ping results written to result1.txt");

    topology.stop();
}
