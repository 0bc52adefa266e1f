//! Two switches and three hosts. Pings once with learning switches, then replaces the flow table
//! of s1 so that port 2 is cut off and ports 1 and 3 are wired to each other, and pings again.
//! Results go to `result2.txt`.
//!
//! ```text
//! h1 --- s1 --- s2 --- h3
//!        |
//!        h2
//! ```
//!
//! Needs root: `sudo -E cargo run --example openflow_lab`.

use std::{fmt::Write as _, sync::Arc};

use vnet::{EngineConfig, FlowRule, NodeSpec, Probe, Topology, TopologySpec};

fn ping_round(topology: &Topology, title: &str, report: &mut String) {
    let probes = [
        Probe::ping("h1", "10.0.0.3".parse().unwrap()),
        Probe::ping("h2", "10.0.0.3".parse().unwrap()),
    ];

    writeln!(report, "{}\n{title}\n{}\n", "=".repeat(60), "=".repeat(60)).unwrap();
    for result in topology.probe_all(&probes).unwrap() {
        let outcome = if result.success() { "ok" } else { "lost" };
        println!("{title}: {} -> {outcome}", result.source());
        writeln!(report, "From {} to h3:", result.source()).unwrap();
        report.push_str(result.stdout());
        writeln!(report, "\n{}", "-".repeat(60)).unwrap();
    }
}

fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    // s1 ports: 1 = h1, 2 = h2, 3 = s2. s2 ports: 1 = s1, 2 = h3.
    let spec = TopologySpec::new()
        .node(NodeSpec::host("h1"))
        .node(NodeSpec::host("h2"))
        .node(NodeSpec::host("h3"))
        .node(NodeSpec::switch("s1"))
        .node(NodeSpec::switch("s2"))
        .link("h1", "s1")
        .link("h2", "s1")
        .link("s1", "s2")
        .link("s2", "h3")
        .address("h1", 0, "10.0.0.1/24".parse().unwrap())
        .address("h2", 0, "10.0.0.2/24".parse().unwrap())
        .address("h3", 0, "10.0.0.3/24".parse().unwrap())
        .flow("s1", "action=normal")
        .flow("s2", "action=normal");

    let config = EngineConfig::default().with_namespace_prefix("lab2");
    let mut topology = Topology::build(&spec, Arc::new(config.ip_backend()), config).unwrap();

    let mut report = String::new();
    ping_round(&topology, "Learning switches", &mut report);

    let s1 = topology.node("s1").unwrap();
    let rules: Vec<FlowRule> = [
        "priority=100,in_port=2,actions=drop",
        "priority=100,in_port=1,actions=output:3",
        "priority=100,in_port=3,actions=output:1",
    ]
    .into_iter()
    .map(|rule| rule.parse().unwrap())
    .collect();
    topology.network_mut().replace_flows(s1, rules).unwrap();

    writeln!(report, "\nFlow table of s1:").unwrap();
    for rule in topology.network().dump_flows(s1).unwrap() {
        writeln!(report, "  {rule}").unwrap();
    }
    report.push('\n');
    ping_round(&topology, "Custom flow rules", &mut report);

    std::fs::write("result2.txt", report).unwrap();
    println!("Ping results written to result2.txt");

    topology.stop();
}
