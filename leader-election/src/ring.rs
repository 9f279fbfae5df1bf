//! Chang-Roberts leader election over a directed ring.
//!
//! An initiator sends an `Election` token carrying its own id to its
//! successor. Every live node forwards the larger of the carried id and its
//! own. The node that sees its own id come back has the highest live id: it
//! becomes leader and broadcasts `Coordinator`. Dead nodes are skipped by the
//! transport; a token already sitting in a dead node's mailbox is passed on
//! untouched.
//!
//! The elected leader can also run a data collection round: it asks every
//! member for its local user count and sums the answers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::message::{Body, Message, Outgoing};
use crate::runtime::{Cluster, NodeHandle, Protocol};
use crate::topology::Topology;
use crate::types::NodeId;

pub enum RingControl {
    StartElection,
    Collect {
        respond_to: oneshot::Sender<Result<CollectReport>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RingState {
    Idle,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingStatus {
    pub id: NodeId,
    pub leader: Option<NodeId>,
    pub state: RingState,
    /// Token hops the last won election took. Only set on the winner.
    pub election_hops: Option<u32>,
    pub data: u64,
}

/// Result of a leader's data collection round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectReport {
    pub leader: NodeId,
    /// Sum of the leader's own data and every reply.
    pub total: u64,
    pub replies: BTreeMap<NodeId, u64>,
    /// Members that did not answer before the collection window closed.
    pub missing: Vec<NodeId>,
}

struct Collection {
    expected: BTreeSet<NodeId>,
    replies: BTreeMap<NodeId, u64>,
    deadline: Instant,
    respond_to: oneshot::Sender<Result<CollectReport>>,
}

pub struct RingNode {
    id: NodeId,
    successor: NodeId,
    members: Vec<NodeId>,
    leader: Option<NodeId>,
    state: RingState,
    election_hops: Option<u32>,
    data: u64,
    collect_timeout: Duration,
    collection: Option<Collection>,
}

impl RingNode {
    pub fn new(id: NodeId, topology: &Topology, config: &RingConfig) -> Self {
        let data = config
            .initial_data
            .unwrap_or_else(|| rand::thread_rng().gen_range(50..100));
        Self {
            id,
            successor: topology.successor(id).unwrap_or(id),
            members: topology.members().to_vec(),
            leader: None,
            state: RingState::Idle,
            election_hops: None,
            data,
            collect_timeout: config.collect_timeout,
            collection: None,
        }
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    /// A token that has travelled this far is circulating a candidate that
    /// died mid-election and can never come back to its owner.
    fn hop_limit(&self) -> u32 {
        2 * self.members.len() as u32 + 1
    }

    fn token(&self, candidate: NodeId, initiator: NodeId, hops: u32) -> Outgoing {
        Outgoing::Forward(Message::new(
            self.id,
            self.successor,
            0,
            Body::Election {
                candidate,
                initiator,
                hops,
            },
        ))
    }

    fn start_election(&mut self) -> Vec<Outgoing> {
        info!(node = self.id, "starting ring election");
        self.state = RingState::Participant;
        vec![self.token(self.id, self.id, 1)]
    }

    fn on_election(&mut self, candidate: NodeId, initiator: NodeId, hops: u32) -> Vec<Outgoing> {
        if candidate == self.id {
            info!(node = self.id, hops, "own id returned, elected leader");
            self.leader = Some(self.id);
            self.state = RingState::Idle;
            self.election_hops = Some(hops);
            let announce = Message::new(self.id, self.id, 0, Body::Coordinator { leader: self.id });
            return vec![Outgoing::Broadcast(announce)];
        }
        if hops >= self.hop_limit() {
            warn!(node = self.id, candidate, hops, "election token exceeded hop limit, dropping");
            return Vec::new();
        }

        self.state = RingState::Participant;
        let carried = candidate.max(self.id);
        debug!(node = self.id, candidate, carried, hops, "forwarding election token");
        vec![self.token(carried, initiator, hops + 1)]
    }

    fn on_coordinator(&mut self, leader: NodeId) {
        info!(node = self.id, leader, "accepted leader");
        self.leader = Some(leader);
        self.state = RingState::Idle;
        if leader != self.id {
            self.election_hops = None;
        }
    }

    fn start_collection(
        &mut self,
        respond_to: oneshot::Sender<Result<CollectReport>>,
        now: Instant,
    ) -> Vec<Outgoing> {
        if self.leader != Some(self.id) {
            let _ = respond_to.send(Err(Error::NotLeader {
                leader: self.leader,
            }));
            return Vec::new();
        }
        if self.collection.is_some() {
            debug!(node = self.id, "collection already running, closing it early");
            self.finish_collection();
        }

        let expected: BTreeSet<NodeId> =
            self.members.iter().copied().filter(|&m| m != self.id).collect();
        info!(node = self.id, expected = expected.len(), "starting data collection");
        let empty = expected.is_empty();
        self.collection = Some(Collection {
            expected,
            replies: BTreeMap::new(),
            deadline: now + self.collect_timeout,
            respond_to,
        });
        if empty {
            self.finish_collection();
            return Vec::new();
        }
        vec![Outgoing::Broadcast(Message::new(self.id, self.id, 0, Body::Collect))]
    }

    fn on_collect_reply(&mut self, from: NodeId, data: u64) {
        let Some(collection) = self.collection.as_mut() else {
            debug!(node = self.id, from, "late collect reply ignored");
            return;
        };
        if !collection.expected.contains(&from) {
            return;
        }
        collection.replies.insert(from, data);
        if collection.replies.len() == collection.expected.len() {
            self.finish_collection();
        }
    }

    fn finish_collection(&mut self) {
        let Some(collection) = self.collection.take() else {
            return;
        };
        let total = self.data + collection.replies.values().sum::<u64>();
        let missing: Vec<NodeId> = collection
            .expected
            .iter()
            .copied()
            .filter(|id| !collection.replies.contains_key(id))
            .collect();
        if !missing.is_empty() {
            warn!(node = self.id, ?missing, "collection window closed without every reply");
        }
        info!(node = self.id, total, "collection finished");
        let _ = collection.respond_to.send(Ok(CollectReport {
            leader: self.id,
            total,
            replies: collection.replies,
            missing,
        }));
    }
}

impl Protocol for RingNode {
    type Control = RingControl;
    type Status = RingStatus;

    const NAME: &'static str = "ring";

    fn id(&self) -> NodeId {
        self.id
    }

    fn handle_message(&mut self, msg: Message, _now: Instant) -> Vec<Outgoing> {
        match msg.body {
            Body::Election {
                candidate,
                initiator,
                hops,
            } => self.on_election(candidate, initiator, hops),
            Body::Coordinator { leader } => {
                self.on_coordinator(leader);
                Vec::new()
            }
            Body::Collect => {
                let body = Body::CollectReply { data: self.data };
                vec![Outgoing::Send(Message::new(self.id, msg.from, 0, body))]
            }
            Body::CollectReply { data } => {
                self.on_collect_reply(msg.from, data);
                Vec::new()
            }
            other => {
                warn!(
                    node = self.id,
                    kind = other.kind(),
                    from = msg.from,
                    "unexpected message for ring node"
                );
                Vec::new()
            }
        }
    }

    fn handle_control(&mut self, control: RingControl, now: Instant, alive: bool) -> Vec<Outgoing> {
        match control {
            RingControl::StartElection if alive => self.start_election(),
            RingControl::StartElection => {
                warn!(node = self.id, "dead node cannot start an election");
                Vec::new()
            }
            RingControl::Collect { respond_to } if alive => self.start_collection(respond_to, now),
            RingControl::Collect { respond_to } => {
                let _ = respond_to.send(Err(Error::NodeStopped(self.id)));
                Vec::new()
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.collection.as_ref().map(|c| c.deadline)
    }

    fn handle_deadline(&mut self, now: Instant) -> Vec<Outgoing> {
        if self.collection.as_ref().is_some_and(|c| now >= c.deadline) {
            self.finish_collection();
        }
        Vec::new()
    }

    fn defer_deadlines(&mut self, _now: Instant) {
        // A dead leader abandons its collection with whatever it gathered.
        self.finish_collection();
    }

    fn forward_while_dead(&mut self, msg: Message) -> Option<Outgoing> {
        if !matches!(msg.body, Body::Election { .. }) {
            return None;
        }
        debug!(node = self.id, "dead, passing election token on");
        Some(Outgoing::Forward(msg.readdressed(self.successor)))
    }

    fn status(&self) -> RingStatus {
        RingStatus {
            id: self.id,
            leader: self.leader,
            state: self.state,
            election_hops: self.election_hops,
            data: self.data,
        }
    }
}

impl Cluster<RingNode> {
    /// Wires `ids` into a ring (in the given order) and starts every node.
    pub fn ring(ids: Vec<NodeId>, config: RingConfig) -> Result<Self> {
        let topology = Topology::ring(ids)?;
        let capacity = config.mailbox.capacity;
        Ok(Cluster::spawn(topology, capacity, |id, topology| {
            RingNode::new(id, topology, &config)
        }))
    }
}

impl NodeHandle<RingNode> {
    pub fn start_election(&self) -> Result<()> {
        self.request(RingControl::StartElection)
    }

    /// Runs a data collection round. Only the current leader can do this.
    pub async fn collect(&self) -> Result<CollectReport> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RingControl::Collect { respond_to })?;
        rx.await.map_err(|_| Error::NodeStopped(self.id()))?
    }
}
