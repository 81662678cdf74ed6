//! lockstepd — the lockstep daemon.
//!
//! - `check` validates a cluster config and prints the node table
//! - `simulate` runs every configured node in-process and drives frames
//!   through the NetAPI, optionally killing one node mid-run
//!
//! # Usage
//!
//! ```text
//! lockstepd check --config cluster.toml
//! lockstepd simulate --config cluster.toml --frames 600 --kill node_a --kill-at 120
//! ```

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use lockstep_core::ClusterConfig;

use crate::simulate::{KillPlan, SimulateOptions, Simulation};

#[derive(Parser)]
#[command(name = "lockstepd", about = "lockstep cluster daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a cluster config and print its node table.
    Check {
        #[arg(long)]
        config: PathBuf,
    },

    /// Run every configured node in this process.
    Simulate {
        #[arg(long)]
        config: PathBuf,

        /// Frames to run on every node.
        #[arg(long, default_value = "300")]
        frames: u64,

        /// Node to kill during the run.
        #[arg(long, requires = "kill_at")]
        kill: Option<String>,

        /// Frame at which `--kill` takes effect.
        #[arg(long, requires = "kill")]
        kill_at: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Check { config } => run_check(&config),
        Command::Simulate {
            config,
            frames,
            kill,
            kill_at,
        } => {
            let kill = kill.zip(kill_at).map(|(node_id, at_frame)| KillPlan { node_id, at_frame });
            run_simulate(&config, SimulateOptions { frames, kill }).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,lockstepd=debug,lockstep=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    ClusterConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn run_check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    print!("{}", node_table(&config));
    info!(path = %path.display(), nodes = config.cluster.nodes.len(), "config valid");
    Ok(())
}

fn node_table(config: &ClusterConfig) -> String {
    let settings = config.failover_settings();
    let mut out = format!("{:<16} {:<20} {:<10} {:<8} {}\n", "NODE", "HOST", "ROLE", "BACKUP", "CRITICAL");
    for node in &config.cluster.nodes {
        let role = if node.id == config.cluster.primary {
            "primary"
        } else {
            "secondary"
        };
        let backup = settings
            .backup_candidates
            .iter()
            .position(|c| c == &node.id)
            .map_or_else(|| "-".to_string(), |rank| (rank + 1).to_string());
        let critical = if settings.is_critical(&node.id) { "yes" } else { "no" };
        out.push_str(&format!(
            "{:<16} {:<20} {:<10} {:<8} {}\n",
            node.id, node.host, role, backup, critical
        ));
    }
    out.push_str(&format!(
        "failover: {}\n",
        if settings.enabled { "enabled" } else { "disabled" }
    ));
    out
}

async fn run_simulate(path: &Path, options: SimulateOptions) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let simulation = Simulation::new(config, options)?;
    let exit_flags = simulation.exit_flags();

    let mut task = tokio::task::spawn_blocking(move || simulation.run());

    let report = tokio::select! {
        joined = &mut task => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, stopping simulation");
            for flag in &exit_flags {
                flag.store(true, Ordering::SeqCst);
            }
            task.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(node) = report.fatal() {
        error!(node_id = %node.node_id, reason = ?node.fatal, "cluster terminated");
        anyhow::bail!(
            "failover terminated on {}: {}",
            node.node_id,
            node.fatal.as_deref().unwrap_or("unknown")
        );
    }
    info!(frames = report.frames, "simulation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn check_reads_and_tabulates_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[cluster]
primary = "node_a"

[[cluster.nodes]]
id = "node_a"
host = "10.0.0.1"

[[cluster.nodes]]
id = "node_b"
host = "10.0.0.2"

[failover]
enabled = true
critical_nodes = ["node_a"]
backup_candidates = ["node_b"]
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let table = node_table(&config);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[1].starts_with("node_a"));
        assert!(lines[1].contains("primary"));
        assert!(lines[1].ends_with("yes"));
        assert!(lines[2].contains("secondary"));
        assert!(lines[2].contains(" 1 "));
        assert_eq!(lines[3], "failover: enabled");
    }

    #[test]
    fn check_rejects_missing_file() {
        assert!(load_config(Path::new("/nonexistent/cluster.toml")).is_err());
    }
}
