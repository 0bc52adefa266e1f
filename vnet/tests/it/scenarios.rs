use std::sync::Arc;

use vnet::{
    Action, Decision, FlowMatch, FlowRule, MacAddr, MemoryBackend, NextHop, PacketFields, Probe,
    Topology, TopologyState,
};

use crate::common::{config, ip, pinging, router_lab, switch_lab};

#[test]
fn host_pings_router() {
    let _ = tracing_subscriber::fmt::try_init();

    let backend = pinging(|namespace, target| namespace == "it-h1" && target == "10.0.0.3");
    let topology = Topology::build(&router_lab(), backend.clone(), config()).unwrap();
    assert_eq!(topology.state(), TopologyState::Running);

    let results = topology.probe_all(&[Probe::ping("h1", ip("10.0.0.3"))]).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].success(), "{}", results[0].stdout());
    assert_eq!(results[0].source(), "h1");
    assert_eq!(results[0].target(), Some(ip("10.0.0.3")));

    let h1 = backend.namespace("it-h1").unwrap();
    assert_eq!(h1.devices["h1-eth0"].addresses, ["10.0.0.1/24".parse::<ipnet::IpNet>().unwrap()]);
    assert_eq!(h1.routes[0].gateway, Some(ip("10.0.0.3")));
    let r1 = backend.namespace("it-r1").unwrap();
    assert_eq!(r1.sysctls["net.ipv4.ip_forward"], "1");

    let network = topology.network();
    let h1 = topology.node("h1").unwrap();
    assert_eq!(
        network.resolve_route(h1, ip("192.168.1.1")).unwrap(),
        Some(NextHop::Via(ip("10.0.0.3")))
    );
}

#[test]
fn unreachable_target_is_a_failed_result() {
    let backend = pinging(|_, _| false);
    let topology = Topology::build(&router_lab(), backend, config()).unwrap();

    let result = topology.probe(&Probe::ping("h1", ip("10.0.0.9"))).unwrap();
    assert!(!result.success());
    assert_eq!(result.exit(), vnet::ExitCode::Code(1));
}

#[test]
fn switch_rule_drops_port_two() {
    let _ = tracing_subscriber::fmt::try_init();

    let backend = Arc::new(MemoryBackend::new());
    let mut topology = Topology::build(&switch_lab(), backend.clone(), config()).unwrap();
    let s1 = topology.node("s1").unwrap();
    let network = topology.network_mut();

    let samples = [
        PacketFields::default(),
        PacketFields::ethernet(MacAddr::new(2, 0, 0, 0, 0, 2), MacAddr::broadcast()),
        PacketFields::ethernet(MacAddr::new(2, 0, 0, 0, 0, 2), MacAddr::new(2, 0, 0, 0, 0, 1))
            .with_ip(ip("10.0.0.2"), ip("10.0.0.1"), 1),
    ];
    for fields in &samples {
        assert_eq!(network.evaluate(s1, 2, fields).unwrap(), Decision::Drop);
    }
    assert_eq!(
        network.evaluate(s1, 1, &PacketFields::default()).unwrap(),
        Decision::Flood(vec![2, 3])
    );

    let kernel = backend.namespace("it-s1").unwrap();
    let port2 = &kernel.devices["s1-eth2"];
    assert_eq!(port2.filters.len(), 1);
    assert_eq!(port2.filters[0].action, vnet_sim::FilterAction::Drop);
}

#[test]
fn manual_flows_after_start() {
    let backend = Arc::new(MemoryBackend::new());
    let mut topology = Topology::build(&switch_lab(), backend, config()).unwrap();
    let s1 = topology.node("s1").unwrap();
    let network = topology.network_mut();

    // h1 talks to h3 only.
    network.install_flow(s1, "priority=200,in_port=1,actions=output:3".parse().unwrap()).unwrap();
    network.install_flow(s1, "priority=200,in_port=3,actions=output:1".parse().unwrap()).unwrap();

    assert_eq!(network.evaluate(s1, 1, &PacketFields::default()).unwrap(), Decision::Output(3));
    assert_eq!(network.evaluate(s1, 3, &PacketFields::default()).unwrap(), Decision::Output(1));

    let dumped: Vec<String> =
        network.dump_flows(s1).unwrap().iter().map(|r| r.to_string()).collect();
    assert_eq!(
        dumped,
        [
            "priority=200,in_port=1,actions=output:3",
            "priority=200,in_port=3,actions=output:1",
            "priority=100,in_port=2,actions=drop",
        ]
    );

    network.clear_flows(s1).unwrap();
    assert_eq!(
        network.evaluate(s1, 2, &PacketFields::default()).unwrap(),
        Decision::Flood(vec![1, 3])
    );
}

#[test]
fn learning_through_the_normal_action() {
    let backend = Arc::new(MemoryBackend::new());
    let spec = switch_lab();
    let mut topology = Topology::build(&spec, backend, config()).unwrap();
    let s1 = topology.node("s1").unwrap();
    let network = topology.network_mut();

    let h1 = MacAddr::new(2, 0, 0, 0, 0, 1);
    let h3 = MacAddr::new(2, 0, 0, 0, 0, 3);

    network.install_flow(s1, FlowRule::new(1, FlowMatch::any(), Action::Normal)).unwrap();
    assert_eq!(
        network.evaluate(s1, 1, &PacketFields::ethernet(h1, h3)).unwrap(),
        Decision::Flood(vec![2, 3])
    );
    let (to_h1, to_h3) = (PacketFields::ethernet(h3, h1), PacketFields::ethernet(h1, h3));
    assert_eq!(network.evaluate(s1, 3, &to_h1).unwrap(), Decision::Output(1));
    assert_eq!(network.evaluate(s1, 1, &to_h3).unwrap(), Decision::Output(3));

    let table = network.node(s1).unwrap().flows().unwrap();
    assert_eq!(table.learned_port(h3), Some(3));
}
