use std::sync::Arc;

use vnet::{
    Error, ErrorClass, MemoryBackend, Network, NextHop, NodeKind, NodeSpec, NodeState, RouteSpec,
    Topology, TopologySpec, TopologyState,
};
use vnet_sim::Op;

use crate::common::{config, ip, router_lab};

fn three_links() -> TopologySpec {
    TopologySpec::new()
        .node(NodeSpec::host("h1"))
        .node(NodeSpec::router("r1"))
        .node(NodeSpec::host("h2"))
        .node(NodeSpec::host("h3"))
        .link("h1", "r1")
        .link("r1", "h2")
        .link("r1", "h3")
}

#[test]
fn failure_mid_build_releases_everything() {
    let _ = tracing_subscriber::fmt::try_init();

    let backend = Arc::new(MemoryBackend::new());
    backend.fail_on(Op::AddVeth, 3);

    let mut topology = Topology::new(backend.clone(), config());
    let err = topology.apply(&three_links()).unwrap_err();

    assert!(matches!(err, Error::Backend(vnet_sim::Error::Injected { op: Op::AddVeth, call: 3 })));
    assert_eq!(err.class(), ErrorClass::Backend);
    assert_eq!(topology.state(), TopologyState::Failed);
    assert!(backend.namespaces().is_empty());
    assert_eq!(backend.veth_pairs(), 0);
    assert_eq!(topology.network().links().count(), 0);
    assert!(topology.network().nodes().all(|node| node.state() == NodeState::Stopped));

    // A failed topology can't be reused, and stopping it does nothing.
    assert!(matches!(topology.apply(&three_links()), Err(Error::InvalidTopology(_))));
    let deleted = backend.calls(Op::DelNamespace);
    topology.stop();
    drop(topology);
    assert_eq!(backend.calls(Op::DelNamespace), deleted);
}

#[test]
fn configuration_error_tears_down() {
    let backend = Arc::new(MemoryBackend::new());
    let spec = router_lab().route(
        "r1",
        RouteSpec::new("10.7.0.0/16".parse().unwrap(), NextHop::Via(ip("172.16.0.1"))),
    );

    let err = Topology::build(&spec, backend.clone(), config()).unwrap_err();
    assert!(matches!(err, Error::InvalidNextHop { ref node, .. } if node == "r1"));
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(backend.namespaces().is_empty());
}

#[test]
fn pending_gateway_fails_verification() {
    let backend = Arc::new(MemoryBackend::new());
    // 10.0.0.200 is on h1's subnet but never configured.
    let spec = router_lab().route(
        "h1",
        RouteSpec::new("10.8.0.0/16".parse().unwrap(), NextHop::Via(ip("10.0.0.200"))),
    );

    let err = Topology::build(&spec, backend.clone(), config()).unwrap_err();
    assert!(matches!(err, Error::InvalidNextHop { .. }));
    assert!(backend.namespaces().is_empty());
}

#[test]
fn unknown_node_in_spec() {
    let backend = Arc::new(MemoryBackend::new());
    let spec = router_lab().link("h1", "nowhere");

    let err = Topology::build(&spec, backend.clone(), config()).unwrap_err();
    assert!(matches!(err, Error::NodeNotFound(ref name) if name == "nowhere"));
    assert_eq!(err.class(), ErrorClass::Resource);
    assert!(backend.namespaces().is_empty());
}

#[test]
fn invalid_flow_string_fails_build() {
    let backend = Arc::new(MemoryBackend::new());
    let spec = crate::common::switch_lab().flow("s1", "priority=0,actions=drop");

    let err = Topology::build(&spec, backend.clone(), config()).unwrap_err();
    assert!(matches!(err, Error::InvalidFlow(vnet_flow::Error::ReservedPriority)));
    assert!(backend.namespaces().is_empty());
}

#[test]
fn stop_twice_is_harmless() {
    let backend = Arc::new(MemoryBackend::new());
    let mut topology = Topology::build(&three_links(), backend.clone(), config()).unwrap();
    assert_eq!(backend.namespaces().len(), 4);

    topology.stop();
    assert_eq!(topology.state(), TopologyState::Stopped);
    let links = backend.calls(Op::DelLink);
    let namespaces = backend.calls(Op::DelNamespace);
    assert_eq!(links, 3);
    assert_eq!(namespaces, 4);

    topology.stop();
    drop(topology);
    assert_eq!(backend.calls(Op::DelLink), links);
    assert_eq!(backend.calls(Op::DelNamespace), namespaces);
    assert!(backend.namespaces().is_empty());
}

#[test]
fn drop_tears_down() {
    let backend = Arc::new(MemoryBackend::new());
    {
        let _topology = Topology::build(&router_lab(), backend.clone(), config()).unwrap();
        assert_eq!(backend.namespaces(), ["it-h1", "it-r1"]);
    }
    assert!(backend.namespaces().is_empty());
}

#[test]
fn teardown_survives_kernel_errors() {
    let backend = Arc::new(MemoryBackend::new());
    let mut topology = Topology::build(&three_links(), backend.clone(), config()).unwrap();

    backend.fail_on(Op::DelLink, 1);
    backend.fail_on(Op::DelNamespace, 2);
    topology.stop();

    assert_eq!(topology.state(), TopologyState::Stopped);
    assert_eq!(backend.calls(Op::DelLink), 3);
    assert_eq!(backend.calls(Op::DelNamespace), 4);
    // Only the namespace whose deletion failed is left behind.
    assert_eq!(backend.namespaces().len(), 1);
}

#[test]
fn interfaces_match_incident_links() {
    let backend = Arc::new(MemoryBackend::new());
    let mut network = Network::new(backend.clone(), config());

    let names = ["a", "b", "c", "d", "e"];
    let ids: Vec<_> =
        names.iter().map(|name| network.create_node(name, NodeKind::Router).unwrap()).collect();

    let mut expected = vec![Vec::new(); ids.len()];
    for (i, j) in [(0, 1), (1, 2), (0, 2), (3, 0), (4, 1), (2, 4), (1, 3)] {
        let (x, y) = network.create_link(ids[i], ids[j]).unwrap();
        expected[i].push(x);
        expected[j].push(y);
    }

    for (id, ifaces) in ids.iter().zip(&expected) {
        let node = network.node(*id).unwrap();
        assert_eq!(node.interfaces().len(), ifaces.len());
        for (index, iface) in ifaces.iter().enumerate() {
            assert_eq!(iface.index, index);
            assert_eq!(node.interfaces()[index].id(), *iface);
            assert_eq!(node.interfaces()[index].device(), format!("{}-eth{index}", node.name()));
        }
    }
    assert_eq!(backend.veth_pairs(), 7);
    assert_eq!(network.links().count(), 7);

    network.teardown();
    assert!(backend.namespaces().is_empty());
}

#[test]
fn routes_resolve_by_longest_prefix() {
    let backend = Arc::new(MemoryBackend::new());
    let mut topology = Topology::build(&router_lab(), backend, config()).unwrap();
    let h1 = topology.node("h1").unwrap();
    let network = topology.network_mut();

    let gateway = NextHop::Via(ip("10.0.0.3"));
    network.add_route(h1, "10.0.0.0/16".parse().unwrap(), gateway, None).unwrap();
    network.add_route(h1, "10.1.0.0/24".parse().unwrap(), NextHop::Direct, Some(0)).unwrap();

    assert_eq!(network.resolve_route(h1, ip("10.0.0.5")).unwrap(), Some(NextHop::Direct));
    assert_eq!(network.resolve_route(h1, ip("10.0.9.5")).unwrap(), Some(gateway));
    assert_eq!(network.resolve_route(h1, ip("10.1.0.5")).unwrap(), Some(NextHop::Direct));

    let routes: Vec<_> = network.routes(h1).unwrap().iter().map(|r| r.destination()).collect();
    let expected: Vec<ipnet::IpNet> = ["0.0.0.0/0", "10.0.0.0/16", "10.1.0.0/24"]
        .iter()
        .map(|net| net.parse().unwrap())
        .collect();
    assert_eq!(routes, expected);

    let err = network
        .add_route(h1, "10.0.0.0/16".parse().unwrap(), NextHop::Via(ip("10.0.0.3")), None)
        .unwrap_err();
    assert!(matches!(err, Error::ConflictingRoute { .. }));
    assert_eq!(network.routes(h1).unwrap().len(), 3);
}
