//! Primary failure in a three-node in-process cluster.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use lockstep_core::{ClusterConfig, CommResult, LocalNetwork, ThreadRole, TimeData};
use lockstep_failover::FatalReason;
use lockstep_netapi::NetApi;
use lockstep_node::{ClusterDataSource, ClusterNodeController, ClusterOps};

const CONFIG: &str = r#"
[cluster]
primary = "node_a"

[[cluster.nodes]]
id = "node_a"
host = "10.0.0.1"

[[cluster.nodes]]
id = "node_b"
host = "10.0.0.2"

[[cluster.nodes]]
id = "node_c"
host = "10.0.0.3"

[network]
connection_retry_count = 3
connection_retry_delay = "10ms"
frame_start_timeout = "5s"
frame_end_timeout = "5s"
game_start_timeout = "10s"

[failover]
enabled = true
backup_candidates = ["node_b", "node_c"]
"#;

struct Clock(f64);

impl ClusterDataSource for Clock {
    fn time_data(&self) -> TimeData {
        TimeData {
            delta_time: 1.0 / 60.0,
            game_time: self.0,
            frame_time: None,
        }
    }
}

struct Cluster {
    net: LocalNetwork,
    nodes: Vec<Arc<ClusterNodeController>>,
    apis: Vec<Arc<NetApi>>,
}

impl Cluster {
    fn start(config: &str) -> Self {
        let net = LocalNetwork::new();
        let config = ClusterConfig::from_toml_str(config).unwrap();
        let nodes: Vec<Arc<ClusterNodeController>> = [("node_a", 1.0), ("node_b", 2.0), ("node_c", 3.0)]
            .into_iter()
            .map(|(id, game_time)| {
                Arc::new(
                    ClusterNodeController::new(config.clone(), id, Arc::new(net.clone()), Arc::new(Clock(game_time)))
                        .unwrap(),
                )
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
        Self { net, nodes, apis }
    }

    /// Run one frame on the given nodes and return the time each saw.
    fn frame(&self, which: &[usize], game_start: bool) -> Vec<Result<TimeData, CommResult>> {
        let handles: Vec<_> = which
            .iter()
            .map(|&i| {
                let api = self.apis[i].clone();
                thread::spawn(move || -> Result<TimeData, CommResult> {
                    let sync = api.cluster_sync();
                    if game_start {
                        sync.wait_for_game_start(ThreadRole::Game)?;
                    }
                    sync.wait_for_frame_start(ThreadRole::Game)?;
                    let time = sync.get_time_data(ThreadRole::Game)?;
                    sync.wait_for_frame_end(ThreadRole::Game)?;
                    Ok(time)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn kill(&self, index: usize) {
        let node = &self.nodes[index];
        self.net.kill(node.local_id());
        node.shutdown();
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

#[test]
fn backup_takes_over_after_primary_failure() {
    let cluster = Cluster::start(CONFIG);

    for result in cluster.frame(&[0, 1, 2], true) {
        assert_eq!(result.unwrap().game_time, 1.0);
    }

    cluster.kill(0);

    for result in cluster.frame(&[1, 2], false) {
        assert_eq!(result.unwrap().game_time, 2.0);
    }

    for i in [1, 2] {
        let controller = cluster.apis[i].controller().unwrap();
        assert_eq!(controller.primary(), "node_b");
        assert!(!controller.is_terminated());
        assert_eq!(controller.settings().backup_candidates, vec!["node_b", "node_c"]);
    }
    assert!(cluster.nodes[1].is_primary());
    assert!(cluster.nodes[1].external_servers_bound());

    // Frames keep flowing through the new primary.
    for result in cluster.frame(&[1, 2], false) {
        assert_eq!(result.unwrap().game_time, 2.0);
    }

    cluster.shutdown();
}

#[test]
fn events_reach_the_new_primary() {
    let cluster = Cluster::start(CONFIG);
    cluster.frame(&[0, 1, 2], true);
    cluster.kill(0);

    let event = lockstep_core::ClusterEventJson {
        category: "show".into(),
        event_type: "cue".into(),
        name: "after-failover".into(),
        ..Default::default()
    };
    cluster.apis[2].events().emit_cluster_event_json(&event).unwrap();

    let handles: Vec<_> = [1, 2]
        .into_iter()
        .map(|i| {
            let api = cluster.apis[i].clone();
            thread::spawn(move || {
                let sync = api.cluster_sync();
                sync.wait_for_frame_start(ThreadRole::Game).unwrap();
                let events = sync.get_events_data(ThreadRole::Game).unwrap();
                sync.wait_for_frame_end(ThreadRole::Game).unwrap();
                events
            })
        })
        .collect();

    for handle in handles {
        let events = handle.join().unwrap();
        assert_eq!(events.json.len(), 1);
        assert_eq!(events.json[0].name, "after-failover");
    }

    cluster.shutdown();
}

#[test]
fn critical_primary_failure_is_fatal() {
    let config = CONFIG.replace(
        "backup_candidates = [\"node_b\", \"node_c\"]",
        "backup_candidates = [\"node_b\", \"node_c\"]\ncritical_nodes = [\"node_a\"]",
    );
    let cluster = Cluster::start(&config);
    cluster.frame(&[0, 1, 2], true);

    let fired = Arc::new(AtomicUsize::new(0));
    for i in [1, 2] {
        let counter = fired.clone();
        cluster.apis[i]
            .controller()
            .unwrap()
            .on_fatal(Arc::new(move |_reason: &FatalReason| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
    }

    cluster.kill(0);

    for result in cluster.frame(&[1, 2], false) {
        assert_eq!(result.unwrap_err(), CommResult::InternalError);
    }
    for i in [1, 2] {
        let controller = cluster.apis[i].controller().unwrap();
        assert_eq!(controller.fatal_reason(), Some(FatalReason::CriticalNodeFailed("node_a".into())));
    }
    assert_eq!(fired.load(Ordering::SeqCst), 2);

    cluster.shutdown();
}
