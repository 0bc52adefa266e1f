//! Tests against the real kernel. They need the `ip` tool and root or passwordless `sudo`, and
//! are skipped otherwise.

use std::{sync::Arc, thread, time::Duration};

use vnet::{EngineConfig, ExitCode, NextHop, Probe, RouteSpec, Topology, TopologySpec};
use vnet_sim::test_util::{check_privileges, unique_name};

use crate::common::{ip, router_lab, switch_lab};

fn kernel_config() -> EngineConfig {
    EngineConfig::default().with_namespace_prefix(unique_name("vit"))
}

fn build(spec: &TopologySpec) -> Topology {
    let config = kernel_config();
    Topology::build(spec, Arc::new(config.ip_backend()), config).unwrap()
}

#[test]
fn router_lab_ping() {
    if !check_privileges() {
        eprintln!("Skipping: insufficient privileges");
        return;
    }
    let _ = tracing_subscriber::fmt::try_init();

    let spec = router_lab()
        .node(vnet::NodeSpec::host("h2"))
        .link("r1", "h2")
        .address("r1", 1, "10.0.1.3/24".parse().unwrap())
        .address("h2", 0, "10.0.1.2/24".parse().unwrap())
        .route("h2", RouteSpec::new("0.0.0.0/0".parse().unwrap(), NextHop::Via(ip("10.0.1.3"))));
    let mut topology = build(&spec);

    let results = topology
        .probe_all(&[
            Probe::ping("h1", ip("10.0.0.3")),
            Probe::ping("h1", ip("10.0.1.2")),
            Probe::ping("h2", ip("10.0.0.1")),
        ])
        .unwrap();
    for result in &results {
        assert!(
            result.success(),
            "{:?} -> {:?} failed:\n{}",
            result.source(),
            result.target(),
            result.stdout()
        );
    }

    // Without forwarding on r1, h1 can no longer reach h2.
    let r1 = topology.node("r1").unwrap();
    topology.network_mut().set_forwarding(r1, false).unwrap();
    let result = topology.probe(&Probe::ping("h1", ip("10.0.1.2"))).unwrap();
    assert!(!result.success());

    topology.stop();
}

#[test]
fn switch_lab_drop_rule() {
    if !check_privileges() {
        eprintln!("Skipping: insufficient privileges");
        return;
    }
    let _ = tracing_subscriber::fmt::try_init();

    let topology = build(&switch_lab());

    let results = topology
        .probe_all(&[
            Probe::ping("h1", ip("10.0.0.3")),
            Probe::ping("h1", ip("10.0.0.2")),
            Probe::ping("h2", ip("10.0.0.3")),
        ])
        .unwrap();

    assert!(results[0].success(), "h1 -> h3 failed:\n{}", results[0].stdout());
    assert!(!results[1].success());
    assert!(!results[2].success());
}

#[test]
fn command_timeout_kills_the_process() {
    if !check_privileges() {
        eprintln!("Skipping: insufficient privileges");
        return;
    }

    let config = kernel_config();
    let backend = Arc::new(config.ip_backend());
    let mut topology = Topology::build(&router_lab(), backend.clone(), config).unwrap();
    let command_line = "echo started; sleep 30 & sleep 30; echo finished";
    let result = topology.run("h1", command_line, Some(Duration::from_millis(500))).unwrap();

    assert_eq!(result.exit(), ExitCode::Timeout);
    assert_eq!(result.stdout().trim(), "started");

    // Neither the shell nor its background job may outlive the deadline.
    let h1 = topology.node("h1").unwrap();
    let namespace = topology.network().node(h1).unwrap().namespace().to_string();
    let mut pids = backend.namespace_pids(&namespace).unwrap();
    for _ in 0..20 {
        if pids.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
        pids = backend.namespace_pids(&namespace).unwrap();
    }
    assert!(pids.is_empty(), "processes left in {namespace}: {pids:?}");

    topology.stop();
}
