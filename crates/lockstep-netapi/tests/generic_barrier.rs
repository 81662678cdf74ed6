//! Generic barriers across a two-node in-process cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lockstep_barrier::ClientSetId;
use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult};
use lockstep_core::{ClusterConfig, CommResult, LocalNetwork, NodeId, TimeData};
use lockstep_netapi::NetApi;
use lockstep_node::{ClusterDataSource, ClusterNodeController};

const CONFIG: &str = r#"
[cluster]
primary = "node_a"

[[cluster.nodes]]
id = "node_a"
host = "10.0.0.1"

[[cluster.nodes]]
id = "node_b"
host = "10.0.0.2"

[network]
connection_retry_count = 3
connection_retry_delay = "10ms"
game_start_timeout = "10s"

[failover]
enabled = true
backup_candidates = ["node_b"]
"#;

struct Clock;

impl ClusterDataSource for Clock {
    fn time_data(&self) -> TimeData {
        TimeData::default()
    }
}

fn start() -> (Vec<Arc<ClusterNodeController>>, Vec<Arc<NetApi>>) {
    let net = LocalNetwork::new();
    let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
    let nodes: Vec<Arc<ClusterNodeController>> = ["node_a", "node_b"]
        .into_iter()
        .map(|id| {
            Arc::new(ClusterNodeController::new(config.clone(), id, Arc::new(net.clone()), Arc::new(Clock)).unwrap())
        })
        .collect();

    let handles: Vec<_> = nodes
        .iter()
        .cloned()
        .map(|node| thread::spawn(move || node.start().unwrap()))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let apis = nodes.iter().map(|node| Arc::new(NetApi::attach(node))).collect();
    (nodes, apis)
}

fn main_on_both() -> BTreeMap<NodeId, Vec<String>> {
    BTreeMap::from([
        ("node_a".to_string(), vec!["main".to_string()]),
        ("node_b".to_string(), vec!["main".to_string()]),
    ])
}

/// Sync "main" on node_a, check it is still held, then sync node_b.
fn sync_both(nodes: &[Arc<ClusterNodeController>], apis: &[Arc<NetApi>], sets: &[ClientSetId]) {
    let first = {
        let (api, set) = (apis[0].clone(), sets[0]);
        thread::spawn(move || api.generic_barrier().sync_on_barrier(set, "phase", "main"))
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!first.is_finished(), "node_a passed the barrier alone");
    let before = nodes[0].generic_barriers().progress()["phase"];

    assert_eq!(apis[1].generic_barrier().sync_on_barrier(sets[1], "phase", "main"), Ok(()));
    assert_eq!(first.join().unwrap(), Ok(()));
    assert_eq!(nodes[0].generic_barriers().progress()["phase"], before + 1);
}

#[test]
fn shared_caller_id_waits_for_every_node() {
    let (nodes, apis) = start();
    let sets: Vec<ClientSetId> = apis
        .iter()
        .map(|api| api.generic_barrier().acquire_client_set().unwrap())
        .collect();

    let created = apis[0]
        .generic_barrier()
        .create_barrier(sets[0], "phase", &main_on_both(), Duration::from_secs(5))
        .unwrap();
    assert_eq!(created, BarrierCreateResult::CreatedSuccessfully);
    assert_eq!(nodes[0].generic_barriers().barrier("phase").unwrap().expected_callers().len(), 2);

    sync_both(&nodes, &apis, &sets);
    sync_both(&nodes, &apis, &sets);

    for node in &nodes {
        node.shutdown();
    }
}

#[test]
fn released_barrier_can_be_created_again() {
    let (nodes, apis) = start();
    let sets: Vec<ClientSetId> = apis
        .iter()
        .map(|api| api.generic_barrier().acquire_client_set().unwrap())
        .collect();
    let generic = apis[0].generic_barrier();

    assert_eq!(
        generic.create_barrier(sets[0], "phase", &main_on_both(), Duration::from_secs(5)),
        Ok(BarrierCreateResult::CreatedSuccessfully)
    );
    sync_both(&nodes, &apis, &sets);

    assert_eq!(generic.release_barrier(sets[0], "phase"), Ok(BarrierControlResult::Ok));
    for node in &nodes {
        assert!(!node.generic_barriers().is_available("phase"));
    }
    assert_eq!(generic.is_barrier_available(sets[0], "phase"), Ok(false));

    assert_eq!(
        generic.create_barrier(sets[0], "phase", &main_on_both(), Duration::from_secs(5)),
        Ok(BarrierCreateResult::CreatedSuccessfully)
    );
    sync_both(&nodes, &apis, &sets);
    assert_eq!(nodes[0].generic_barriers().progress()["phase"], 1);

    // An unregistered caller is refused outright.
    assert_eq!(
        apis[1].generic_barrier().sync_on_barrier(sets[1], "phase", "overlay"),
        Err(CommResult::NotAllowed)
    );

    for node in &nodes {
        node.shutdown();
    }
}
