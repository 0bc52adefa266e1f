use std::{collections::BTreeMap, sync::Arc, thread, time::Duration};

use parking_lot::Mutex;
use vnet::{ExitCode, MemoryBackend, Output, Probe, Topology};

use crate::common::{config, ip, switch_lab};

#[test]
fn probes_from_scoped_threads() {
    let _ = tracing_subscriber::fmt::try_init();

    let seen = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));
    let record = seen.clone();
    let backend = Arc::new(MemoryBackend::new().with_responder(move |namespace, _| {
        // Give the other threads a chance to interleave.
        thread::sleep(Duration::from_millis(5));
        *record.lock().entry(namespace.to_string()).or_default() += 1;
        Output::new(ExitCode::Code(0), "ok", "")
    }));

    let topology = Topology::build(&switch_lab(), backend, config()).unwrap();

    let results = thread::scope(|scope| {
        let handles: Vec<_> = ["h1", "h2", "h3"]
            .into_iter()
            .map(|source| {
                let topology = &topology;
                scope.spawn(move || {
                    let probes: Vec<_> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
                        .into_iter()
                        .map(|target| Probe::ping(source, ip(target)))
                        .collect();
                    topology.probe_all(&probes).unwrap()
                })
            })
            .collect();

        handles.into_iter().map(|handle| handle.join().unwrap()).collect::<Vec<_>>()
    });

    assert_eq!(results.len(), 3);
    for (results, source) in results.iter().zip(["h1", "h2", "h3"]) {
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|result| result.success() && result.source() == source));
        // Each thread keeps its own order.
        let targets: Vec<_> = results.iter().filter_map(|result| result.target()).collect();
        assert_eq!(targets, [ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")]);
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert!(seen.values().all(|count| *count == 3));
}
