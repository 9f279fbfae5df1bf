//! Bully election: the highest live identifier always wins.
//!
//! A node that suspects the leader is gone challenges every strictly higher
//! peer. A live higher peer answers and escalates with its own election. A
//! node that hears no answer within `answer_timeout` is the highest live
//! node and announces itself with `Coordinator`. A node that was answered
//! waits `coordinator_timeout` for that announcement before trying again.
//!
//! With `leader_timeout` set, leaders repeat `Coordinator` every
//! `heartbeat_interval` and followers re-run the election when it goes quiet.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BullyConfig;
use crate::error::Result;
use crate::message::{Body, Message, Outgoing};
use crate::runtime::{Cluster, NodeHandle, Protocol};
use crate::timer::{earliest, Ticker};
use crate::topology::Topology;
use crate::types::NodeId;

pub enum BullyControl {
    StartElection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BullyPhase {
    Idle,
    /// Challenged the higher peers, waiting for an answer.
    Electing,
    /// A higher peer answered, waiting for its announcement.
    AwaitingCoordinator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BullyStatus {
    pub id: NodeId,
    pub leader: Option<NodeId>,
    pub phase: BullyPhase,
    pub elections_started: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    Electing { until: Instant },
    AwaitingCoordinator { until: Instant },
}

pub struct BullyNode {
    id: NodeId,
    higher: Vec<NodeId>,
    leader: Option<NodeId>,
    phase: Phase,
    answer_timeout: Duration,
    coordinator_timeout: Duration,
    heartbeat: Ticker,
    leader_timeout: Option<Duration>,
    leader_deadline: Option<Instant>,
    elections_started: u64,
}

impl BullyNode {
    pub fn new(id: NodeId, topology: &Topology, config: &BullyConfig, now: Instant) -> Self {
        let higher = topology.others(id).filter(|&peer| peer > id).collect();
        Self {
            id,
            higher,
            leader: None,
            phase: Phase::Idle,
            answer_timeout: config.answer_timeout,
            coordinator_timeout: config.coordinator_timeout,
            heartbeat: Ticker::new(config.heartbeat_interval),
            leader_timeout: config.leader_timeout,
            leader_deadline: config.leader_timeout.map(|t| now + t),
            elections_started: 0,
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    fn start_election(&mut self, now: Instant) -> Vec<Outgoing> {
        self.elections_started += 1;
        if self.higher.is_empty() {
            return self.become_leader(now);
        }

        debug!(node = self.id, higher = ?self.higher, "challenging higher peers");
        self.phase = Phase::Electing {
            until: now + self.answer_timeout,
        };
        self.higher
            .iter()
            .map(|&peer| Outgoing::Send(Message::new(self.id, peer, 0, Body::Challenge)))
            .collect()
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Outgoing> {
        info!(node = self.id, "no higher node answered, elected leader");
        self.leader = Some(self.id);
        self.phase = Phase::Idle;
        self.leader_deadline = None;
        if self.leader_timeout.is_some() {
            self.heartbeat.start(now);
        }
        vec![self.announce()]
    }

    fn announce(&self) -> Outgoing {
        Outgoing::Broadcast(Message::new(
            self.id,
            self.id,
            0,
            Body::Coordinator { leader: self.id },
        ))
    }

    fn on_challenge(&mut self, from: NodeId, now: Instant) -> Vec<Outgoing> {
        if from > self.id {
            warn!(node = self.id, from, "challenge from a higher node ignored");
            return Vec::new();
        }
        let mut out = vec![Outgoing::Send(Message::new(self.id, from, 0, Body::Answer))];
        if self.is_idle() {
            out.extend(self.start_election(now));
        }
        out
    }

    fn on_answer(&mut self, from: NodeId, now: Instant) {
        if let Phase::Electing { .. } = self.phase {
            debug!(node = self.id, from, "answered, deferring to higher node");
            self.phase = Phase::AwaitingCoordinator {
                until: now + self.coordinator_timeout,
            };
        }
    }

    fn on_coordinator(&mut self, leader: NodeId, now: Instant) -> Vec<Outgoing> {
        if leader < self.id {
            debug!(node = self.id, leader, "lower node claimed leadership, taking over");
            return if self.is_idle() {
                self.start_election(now)
            } else {
                Vec::new()
            };
        }
        if self.leader != Some(leader) {
            info!(node = self.id, leader, "accepted leader");
        }
        self.leader = Some(leader);
        self.phase = Phase::Idle;
        if leader != self.id {
            self.heartbeat.stop();
            self.leader_deadline = self.leader_timeout.map(|t| now + t);
        }
        Vec::new()
    }
}

impl Protocol for BullyNode {
    type Control = BullyControl;
    type Status = BullyStatus;

    const NAME: &'static str = "bully";

    fn id(&self) -> NodeId {
        self.id
    }

    fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<Outgoing> {
        match msg.body {
            Body::Challenge => self.on_challenge(msg.from, now),
            Body::Answer => {
                self.on_answer(msg.from, now);
                Vec::new()
            }
            Body::Coordinator { leader } => self.on_coordinator(leader, now),
            other => {
                warn!(
                    node = self.id,
                    kind = other.kind(),
                    from = msg.from,
                    "unexpected message for bully node"
                );
                Vec::new()
            }
        }
    }

    fn handle_control(
        &mut self,
        control: BullyControl,
        now: Instant,
        alive: bool,
    ) -> Vec<Outgoing> {
        match control {
            BullyControl::StartElection if alive => {
                info!(node = self.id, "starting bully election");
                self.start_election(now)
            }
            BullyControl::StartElection => {
                warn!(node = self.id, "dead node cannot start an election");
                Vec::new()
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let phase = match self.phase {
            Phase::Idle => None,
            Phase::Electing { until } | Phase::AwaitingCoordinator { until } => Some(until),
        };
        earliest([phase, self.heartbeat.deadline(), self.leader_deadline])
    }

    fn handle_deadline(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();

        match self.phase {
            Phase::Electing { until } if now >= until => out.extend(self.become_leader(now)),
            Phase::AwaitingCoordinator { until } if now >= until => {
                debug!(node = self.id, "no coordinator arrived, restarting election");
                self.phase = Phase::Idle;
                out.extend(self.start_election(now));
            }
            _ => {}
        }

        if self.heartbeat.due(now) {
            self.heartbeat.start(now);
            out.push(self.announce());
        }

        if let (Some(deadline), Some(timeout)) = (self.leader_deadline, self.leader_timeout) {
            if now >= deadline {
                self.leader_deadline = Some(now + timeout);
                if self.is_idle() && self.leader != Some(self.id) {
                    info!(
                        node = self.id,
                        leader = ?self.leader,
                        "leader silent, starting election"
                    );
                    out.extend(self.start_election(now));
                }
            }
        }

        out
    }

    fn defer_deadlines(&mut self, now: Instant) {
        self.phase = Phase::Idle;
        if self.heartbeat.is_running() {
            self.heartbeat.start(now);
        }
        if let Some(timeout) = self.leader_timeout {
            if self.leader_deadline.is_some() {
                self.leader_deadline = Some(now + timeout);
            }
        }
    }

    fn status(&self) -> BullyStatus {
        let phase = match self.phase {
            Phase::Idle => BullyPhase::Idle,
            Phase::Electing { .. } => BullyPhase::Electing,
            Phase::AwaitingCoordinator { .. } => BullyPhase::AwaitingCoordinator,
        };
        BullyStatus {
            id: self.id,
            leader: self.leader,
            phase,
            elections_started: self.elections_started,
        }
    }
}

impl Cluster<BullyNode> {
    /// Wires `ids` into a full mesh and starts every node.
    pub fn bully(ids: Vec<NodeId>, config: BullyConfig) -> Result<Self> {
        let topology = Topology::mesh(ids)?;
        let capacity = config.mailbox.capacity;
        Ok(Cluster::spawn(topology, capacity, |id, topology| {
            BullyNode::new(id, topology, &config, Instant::now())
        }))
    }
}

impl NodeHandle<BullyNode> {
    pub fn start_election(&self) -> Result<()> {
        self.request(BullyControl::StartElection)
    }
}
