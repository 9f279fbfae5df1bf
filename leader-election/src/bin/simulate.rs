use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use leader_election::{
    BullyConfig, Cluster, Command as LogCommand, NodeId, Protocol, RaftConfig, RingConfig, Role,
};

#[derive(Parser)]
#[command(author, version, about = "Run a leader election over in-process nodes")]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct RunArgs {
    /// Node ids, in ring order
    #[arg(long, value_delimiter = ',', default_values_t = [0, 1, 2, 3, 7, 9], global = true)]
    ids: Vec<NodeId>,

    /// Nodes marked dead before the election starts
    #[arg(long, value_delimiter = ',', default_values_t = [9], global = true)]
    dead: Vec<NodeId>,

    /// How long to let the nodes run before printing their view
    #[arg(long, default_value_t = 1500, global = true)]
    wait_ms: u64,

    /// Print node statuses as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Chang-Roberts election on a ring
    Ring {
        /// Initiator (defaults to the first live node)
        #[arg(long)]
        from: Option<NodeId>,

        /// Have the winner collect and sum every node's data
        #[arg(long)]
        collect: bool,
    },
    /// Bully election on a full mesh
    Bully {
        /// Initiator (defaults to the first live node)
        #[arg(long)]
        from: Option<NodeId>,

        /// Elect once and stop monitoring the leader
        #[arg(long)]
        one_shot: bool,
    },
    /// Raft election followed by a few replicated writes
    Raft {
        /// Number of commands proposed through the leader
        #[arg(long, default_value_t = 3)]
        proposals: usize,

        /// Seed for election timer jitter
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let run = cli.run;
    for id in &run.dead {
        ensure!(run.ids.contains(id), "dead node {id} is not in --ids");
    }

    match cli.command {
        Command::Ring { from, collect } => run_ring(&run, from, collect).await,
        Command::Bully { from, one_shot } => run_bully(&run, from, one_shot).await,
        Command::Raft { proposals, seed } => run_raft(&run, proposals, seed).await,
    }
}

impl RunArgs {
    fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    fn initiator(&self, from: Option<NodeId>) -> Result<NodeId> {
        let id = match from {
            Some(id) => id,
            None => self
                .ids
                .iter()
                .copied()
                .find(|id| !self.dead.contains(id))
                .context("every node is dead")?,
        };
        ensure!(!self.dead.contains(&id), "initiator {id} is marked dead");
        Ok(id)
    }
}

fn kill_dead<P: Protocol>(cluster: &Cluster<P>, dead: &[NodeId]) -> Result<()> {
    for &id in dead {
        cluster.set_alive(id, false)?;
        info!(node = id, "marked dead");
    }
    Ok(())
}

fn print_statuses<S>(statuses: &BTreeMap<NodeId, S>, json: bool) -> Result<()>
where
    S: Serialize + Debug,
{
    if json {
        let out = serde_json::to_string_pretty(statuses).context("failed to encode statuses")?;
        println!("{out}");
    } else {
        for status in statuses.values() {
            println!("{status:?}");
        }
    }
    Ok(())
}

async fn run_ring(run: &RunArgs, from: Option<NodeId>, collect: bool) -> Result<()> {
    let cluster = Cluster::ring(run.ids.clone(), RingConfig::default())?;
    kill_dead(&cluster, &run.dead)?;

    let initiator = run.initiator(from)?;
    cluster.node(initiator)?.start_election()?;
    tokio::time::sleep(run.wait()).await;

    let leader = cluster.node(initiator)?.status().leader;
    match leader {
        Some(leader) => {
            println!("ring elected node {leader}");
            if collect {
                let report = cluster.node(leader)?.collect().await?;
                println!(
                    "leader {} counted {} users ({} replies, missing {:?})",
                    report.leader,
                    report.total,
                    report.replies.len(),
                    report.missing
                );
            }
        }
        None => warn!("no leader after {:?}", run.wait()),
    }

    print_statuses(&cluster.statuses(), run.json)?;
    cluster.shutdown().await;
    Ok(())
}

async fn run_bully(run: &RunArgs, from: Option<NodeId>, one_shot: bool) -> Result<()> {
    let mut config = BullyConfig::default();
    if one_shot {
        config.leader_timeout = None;
    }
    let cluster = Cluster::bully(run.ids.clone(), config)?;
    kill_dead(&cluster, &run.dead)?;

    let initiator = run.initiator(from)?;
    cluster.node(initiator)?.start_election()?;
    tokio::time::sleep(run.wait()).await;

    match cluster.node(initiator)?.status().leader {
        Some(leader) => println!("bully elected node {leader}"),
        None => warn!("no leader after {:?}", run.wait()),
    }

    print_statuses(&cluster.statuses(), run.json)?;
    cluster.shutdown().await;
    Ok(())
}

async fn run_raft(run: &RunArgs, proposals: usize, seed: Option<u64>) -> Result<()> {
    let config = RaftConfig {
        seed,
        ..RaftConfig::default()
    };
    let cluster = Cluster::raft(run.ids.clone(), config)?;
    kill_dead(&cluster, &run.dead)?;
    tokio::time::sleep(run.wait()).await;

    let leader = cluster
        .nodes()
        .filter(|node| node.is_alive())
        .map(|node| node.status())
        .filter(|status| status.role == Role::Leader)
        .max_by_key(|status| status.term);

    match leader {
        Some(status) => {
            println!("raft elected node {} in term {}", status.id, status.term);
            let handle = cluster.node(status.id)?;
            for i in 0..proposals {
                let index = handle
                    .propose(LogCommand::put(format!("key-{i}"), format!("value-{i}")))
                    .await?;
                info!(index, "proposed");
            }
            // Let followers pick up the commit index from the next heartbeats.
            tokio::time::sleep(run.wait() / 2).await;
        }
        None => warn!("no leader after {:?}", run.wait()),
    }

    print_statuses(&cluster.statuses(), run.json)?;
    cluster.shutdown().await;
    Ok(())
}
