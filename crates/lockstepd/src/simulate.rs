//! In-process cluster simulation.
//!
//! Every configured node runs in this process over a `LocalNetwork`,
//! each with a game thread and a rendering thread driving the NetAPI the
//! way an application would. One node can be killed at a chosen frame to
//! exercise failover end to end.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, anyhow, ensure};
use serde::Serialize;
use tracing::{debug, info, warn};

use lockstep_core::{ClusterConfig, LocalNetwork, NodeId, SyncGroup, ThreadRole, TimeData};
use lockstep_netapi::NetApi;
use lockstep_node::{ClusterDataSource, ClusterNodeController, ClusterOps};

#[derive(Debug, Clone)]
pub struct KillPlan {
    pub node_id: NodeId,
    /// Frame at whose start the node dies.
    pub at_frame: u64,
}

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub frames: u64,
    pub kill: Option<KillPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub frames_completed: u64,
    pub failed_calls: u64,
    pub last_game_time: f64,
    pub primary: NodeId,
    pub killed: bool,
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames: u64,
    pub nodes: Vec<NodeReport>,
}

impl SimulationReport {
    /// First surviving node that hit a fatal failover condition.
    pub fn fatal(&self) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| !n.killed && n.fatal.is_some())
    }
}

/// Ticks once per frame-start release on the node hosting it.
#[derive(Default)]
struct SimClock {
    frames: AtomicU64,
}

impl ClusterDataSource for SimClock {
    fn time_data(&self) -> TimeData {
        let frame = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
        TimeData {
            delta_time: 1.0 / 60.0,
            game_time: frame as f64 / 60.0,
            frame_time: None,
        }
    }

    fn objects(&self, group: SyncGroup) -> HashMap<String, String> {
        HashMap::from([(
            "frame".to_string(),
            format!("{}:{}", group.as_str(), self.frames.load(Ordering::SeqCst)),
        )])
    }
}

#[derive(Debug, Default)]
struct GameStats {
    frames_completed: u64,
    failed_calls: u64,
    last_game_time: f64,
    killed: bool,
}

pub struct Simulation {
    net: LocalNetwork,
    nodes: Vec<Arc<ClusterNodeController>>,
    options: SimulateOptions,
}

impl Simulation {
    pub fn new(config: ClusterConfig, options: SimulateOptions) -> anyhow::Result<Self> {
        config.validate()?;
        ensure!(options.frames > 0, "at least one frame is required");
        if let Some(kill) = &options.kill {
            ensure!(
                config.node(&kill.node_id).is_some(),
                "cannot kill unknown node {}",
                kill.node_id
            );
            ensure!(
                (1..=options.frames).contains(&kill.at_frame),
                "kill frame {} outside 1..={}",
                kill.at_frame,
                options.frames
            );
        }

        let net = LocalNetwork::new();
        let mut nodes = Vec::new();
        for id in config.node_ids() {
            let node = ClusterNodeController::new(
                config.clone(),
                &id,
                Arc::new(net.clone()),
                Arc::new(SimClock::default()),
            )
            .with_context(|| format!("creating node {id}"))?;
            nodes.push(Arc::new(node));
        }

        Ok(Self { net, nodes, options })
    }

    /// Exit flags of every simulated node. Setting them stops the run.
    pub fn exit_flags(&self) -> Vec<Arc<AtomicBool>> {
        self.nodes.iter().map(|n| n.exit_flag()).collect()
    }

    pub fn run(self) -> anyhow::Result<SimulationReport> {
        let starts: Vec<JoinHandle<_>> = self
            .nodes
            .iter()
            .cloned()
            .map(|node| thread::spawn(move || node.start()))
            .collect();
        for (node, handle) in self.nodes.iter().zip(starts) {
            handle
                .join()
                .map_err(|_| anyhow!("bootstrap of {} panicked", node.local_id()))?
                .with_context(|| format!("bootstrapping {}", node.local_id()))?;
        }
        info!(nodes = self.nodes.len(), frames = self.options.frames, "cluster up, simulating");

        let apis: Vec<Arc<NetApi>> = self.nodes.iter().map(|n| Arc::new(NetApi::attach(n))).collect();

        let mut workers = Vec::new();
        for (node, api) in self.nodes.iter().zip(&apis) {
            let kill_at = self
                .options
                .kill
                .as_ref()
                .filter(|k| &k.node_id == node.local_id())
                .map(|k| k.at_frame);

            let game = {
                let (net, node, api) = (self.net.clone(), node.clone(), api.clone());
                let frames = self.options.frames;
                thread::Builder::new()
                    .name(format!("game-{}", node.local_id()))
                    .spawn(move || game_loop(&net, &node, &api, frames, kill_at))?
            };
            let render = {
                let (node, api) = (node.clone(), api.clone());
                let frames = self.options.frames;
                thread::Builder::new()
                    .name(format!("render-{}", node.local_id()))
                    .spawn(move || render_loop(&node, &api, frames))?
            };
            workers.push((game, render));
        }

        let mut reports = Vec::new();
        for ((node, api), (game, render)) in self.nodes.iter().zip(&apis).zip(workers) {
            let stats = game
                .join()
                .map_err(|_| anyhow!("game thread of {} panicked", node.local_id()))?;
            let render_failures = render
                .join()
                .map_err(|_| anyhow!("render thread of {} panicked", node.local_id()))?;

            let controller = api.controller();
            reports.push(NodeReport {
                node_id: node.local_id().clone(),
                frames_completed: stats.frames_completed,
                failed_calls: stats.failed_calls + render_failures,
                last_game_time: stats.last_game_time,
                primary: controller.as_ref().map_or_else(|| node.primary(), |c| c.primary()),
                killed: stats.killed,
                fatal: controller.and_then(|c| c.fatal_reason()).map(|r| r.to_string()),
            });
        }

        for node in &self.nodes {
            node.shutdown();
        }

        Ok(SimulationReport {
            frames: self.options.frames,
            nodes: reports,
        })
    }
}

fn game_loop(
    net: &LocalNetwork,
    node: &ClusterNodeController,
    api: &NetApi,
    frames: u64,
    kill_at: Option<u64>,
) -> GameStats {
    let mut stats = GameStats::default();
    let sync = api.cluster_sync();

    if let Err(result) = sync.wait_for_game_start(ThreadRole::Game) {
        warn!(node_id = %node.local_id(), ?result, "game start failed");
        stats.failed_calls += 1;
        return stats;
    }

    for frame in 1..=frames {
        if kill_at == Some(frame) {
            info!(node_id = %node.local_id(), frame, "killing node");
            net.kill(node.local_id());
            node.shutdown();
            stats.killed = true;
            break;
        }
        if node.is_exiting() {
            break;
        }

        match run_frame(api) {
            Ok(time) => {
                stats.frames_completed += 1;
                stats.last_game_time = time.game_time;
                debug!(node_id = %node.local_id(), frame, game_time = time.game_time, "frame done");
            }
            Err(failures) => {
                stats.failed_calls += failures;
                if api.controller().is_some_and(|c| c.is_terminated()) {
                    break;
                }
            }
        }
    }
    stats
}

/// One frame of game-thread traffic. Returns the number of failed calls
/// on error.
fn run_frame(api: &NetApi) -> Result<TimeData, u64> {
    let sync = api.cluster_sync();
    let mut failures = 0;

    if let Err(result) = sync.wait_for_frame_start(ThreadRole::Game) {
        debug!(?result, "frame start failed");
        failures += 1;
    }
    let time = sync.get_time_data(ThreadRole::Game);
    let events = sync.get_events_data(ThreadRole::Game);
    let objects = SyncGroup::ALL
        .iter()
        .filter(|&&group| sync.get_objects_data(ThreadRole::Game, group).is_err())
        .count() as u64;
    if events.is_err() {
        failures += 1;
    }
    failures += objects;
    if let Err(result) = sync.wait_for_frame_end(ThreadRole::Game) {
        debug!(?result, "frame end failed");
        failures += 1;
    }

    match time {
        Ok(time) if failures == 0 => Ok(time),
        Ok(_) => Err(failures),
        Err(_) => Err(failures + 1),
    }
}

fn render_loop(node: &ClusterNodeController, api: &NetApi, frames: u64) -> u64 {
    let render = api.render_sync();
    let mut failures = 0;
    for _ in 0..frames {
        if node.is_exiting() {
            break;
        }
        match render.synchronize_on_barrier(ThreadRole::Rendering) {
            Ok(()) => {}
            Err(result) => {
                debug!(node_id = %node.local_id(), ?result, "render present failed");
                failures += 1;
                if api.controller().is_some_and(|c| c.is_terminated()) {
                    break;
                }
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

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
game_start_timeout = "10s"

[failover]
enabled = true
backup_candidates = ["node_b", "node_c"]
"#;

    fn options(frames: u64, kill: Option<(&str, u64)>) -> SimulateOptions {
        SimulateOptions {
            frames,
            kill: kill.map(|(node_id, at_frame)| KillPlan {
                node_id: node_id.to_string(),
                at_frame,
            }),
        }
    }

    #[test]
    fn healthy_cluster_runs_every_frame() {
        let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
        let report = Simulation::new(config, options(5, None)).unwrap().run().unwrap();

        assert_eq!(report.nodes.len(), 3);
        for node in &report.nodes {
            assert_eq!(node.frames_completed, 5);
            assert_eq!(node.failed_calls, 0);
            assert_eq!(node.primary, "node_a");
            assert_eq!(node.last_game_time, 5.0 / 60.0);
        }
        assert!(report.fatal().is_none());
    }

    #[test]
    fn survivors_continue_after_primary_dies() {
        let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
        let report = Simulation::new(config, options(4, Some(("node_a", 2))))
            .unwrap()
            .run()
            .unwrap();

        let a = &report.nodes[0];
        assert!(a.killed);
        assert_eq!(a.frames_completed, 1);

        for survivor in &report.nodes[1..] {
            assert!(!survivor.killed);
            assert_eq!(survivor.frames_completed, 4);
            assert_eq!(survivor.primary, "node_b");
            assert!(survivor.fatal.is_none());
        }
        assert!(report.fatal().is_none());
    }

    #[test]
    fn rejects_bad_kill_plans() {
        let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
        assert!(Simulation::new(config.clone(), options(3, Some(("node_x", 1)))).is_err());
        assert!(Simulation::new(config.clone(), options(3, Some(("node_b", 4)))).is_err());
        assert!(Simulation::new(config, options(0, None)).is_err());
    }
}
