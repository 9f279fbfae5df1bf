//! Raft term election and log replication.
//!
//! Each node is a Follower, Candidate or Leader for some term:
//!
//! - **Follower**: waits for heartbeats. When its randomized election timer
//!   expires it starts a new term as Candidate.
//! - **Candidate**: votes for itself and asks every peer for a vote. A strict
//!   majority of the full roster makes it Leader; a timeout starts the next term.
//! - **Leader**: sends `AppendEntries` (empty ones are heartbeats) to every
//!   peer, tracks how far each follower matches, and commits an entry of its
//!   own term once a majority holds it.
//!
//! Any message from a higher term turns the receiver into a Follower of that
//! term. Messages from a lower term are stale and ignored without a reply.
//! `commit_index` is exposed in [`RaftStatus`]; applying entries is left to
//! the caller.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::log::RaftLog;
use crate::message::{Body, Message, Outgoing};
use crate::runtime::{Cluster, NodeHandle, Protocol};
use crate::timer::{ElectionTimer, Ticker};
use crate::topology::Topology;
use crate::types::{Command, LogEntry, LogIndex, NodeId, Role, Term};

pub enum RaftControl {
    /// Append a command on the leader. Answers with the new entry's index.
    Propose {
        command: Command,
        respond_to: oneshot::Sender<Result<LogIndex>>,
    },
    /// Copy of the local log.
    Log {
        respond_to: oneshot::Sender<Vec<LogEntry>>,
    },
    /// Start an election now instead of waiting for the timer.
    Campaign,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
}

/// Leader's view of one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    /// Next index to send.
    next: LogIndex,
    /// Highest index known to be replicated.
    matched: LogIndex,
    /// An `AppendEntries` is out and unanswered. New proposals wait for its
    /// reply (or the next heartbeat) instead of piling more onto the peer.
    inflight: bool,
}

#[derive(Debug)]
enum State {
    Follower,
    Candidate { votes: BTreeSet<NodeId> },
    Leader { progress: BTreeMap<NodeId, Progress> },
}

pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    quorum: usize,
    term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    state: State,
    log: RaftLog,
    commit_index: LogIndex,
    election: ElectionTimer,
    heartbeat: Ticker,
    max_entries: usize,
}

impl RaftNode {
    pub fn new(id: NodeId, topology: &Topology, config: &RaftConfig, now: Instant) -> Self {
        Self {
            id,
            peers: topology.others(id).collect(),
            quorum: topology.quorum(),
            term: 0,
            voted_for: None,
            leader: None,
            state: State::Follower,
            log: RaftLog::new(),
            commit_index: 0,
            election: ElectionTimer::new(config.election_timeout.clone(), config.seed, id, now),
            heartbeat: Ticker::new(config.heartbeat_interval),
            max_entries: config.max_entries_per_append.max(1),
        }
    }

    pub fn role(&self) -> Role {
        match self.state {
            State::Follower => Role::Follower,
            State::Candidate { .. } => Role::Candidate,
            State::Leader { .. } => Role::Leader,
        }
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    fn broadcast(&self, body: Body) -> Outgoing {
        Outgoing::Broadcast(Message::new(self.id, self.id, self.term, body))
    }

    fn reply(&self, to: NodeId, body: Body) -> Outgoing {
        Outgoing::Send(Message::new(self.id, to, self.term, body))
    }

    fn start_election(&mut self, now: Instant) -> Vec<Outgoing> {
        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.heartbeat.stop();
        self.election.reset(now);
        self.state = State::Candidate {
            votes: BTreeSet::from([self.id]),
        };
        info!(node = self.id, term = self.term, "election timeout, campaigning");

        if self.quorum <= 1 {
            return self.become_leader(now);
        }
        vec![self.broadcast(Body::VoteRequest {
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })]
    }

    fn become_leader(&mut self, now: Instant) -> Vec<Outgoing> {
        let next = self.log.last_index() + 1;
        let progress = self
            .peers
            .iter()
            .map(|&peer| {
                let progress = Progress {
                    next,
                    matched: 0,
                    inflight: false,
                };
                (peer, progress)
            })
            .collect();
        self.state = State::Leader { progress };
        self.leader = Some(self.id);
        self.heartbeat.start(now);
        info!(node = self.id, term = self.term, "became leader");
        self.replicate(false)
    }

    fn become_follower(&mut self, now: Instant) {
        if !matches!(self.state, State::Follower) {
            info!(
                node = self.id,
                term = self.term,
                from = %self.role(),
                "stepping down to follower"
            );
            self.state = State::Follower;
            self.heartbeat.stop();
            self.election.reset(now);
        }
    }

    /// Adopts a higher term seen on any message.
    fn step_down(&mut self, term: Term, now: Instant) {
        debug!(node = self.id, old = self.term, new = term, "observed higher term");
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        self.become_follower(now);
    }

    fn append_for(&self, peer: NodeId, next: LogIndex) -> Outgoing {
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        self.reply(
            peer,
            Body::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries: self.log.entries_from(next, self.max_entries),
                leader_commit: self.commit_index,
            },
        )
    }

    /// Sends `AppendEntries` to every peer, or with `only_idle` just to the
    /// peers with nothing outstanding.
    fn replicate(&mut self, only_idle: bool) -> Vec<Outgoing> {
        let State::Leader { progress } = &mut self.state else {
            return Vec::new();
        };
        let targets: Vec<(NodeId, LogIndex)> = progress
            .iter_mut()
            .filter(|(_, p)| !(only_idle && p.inflight))
            .map(|(&peer, p)| {
                p.inflight = true;
                (peer, p.next)
            })
            .collect();
        targets
            .into_iter()
            .map(|(peer, next)| self.append_for(peer, next))
            .collect()
    }

    fn on_vote_request(
        &mut self,
        from: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
        now: Instant,
    ) -> Vec<Outgoing> {
        let free = self.voted_for.map_or(true, |voted| voted == from);
        let granted = free && self.log.is_up_to_date(last_log_index, last_log_term);
        if granted {
            self.voted_for = Some(from);
            self.election.reset(now);
        }
        debug!(
            node = self.id,
            term = self.term,
            candidate = from,
            granted,
            "vote request"
        );
        vec![self.reply(from, Body::VoteReply { granted })]
    }

    fn on_vote_reply(&mut self, from: NodeId, granted: bool, now: Instant) -> Vec<Outgoing> {
        let quorum = self.quorum;
        let State::Candidate { votes } = &mut self.state else {
            return Vec::new();
        };
        if !granted {
            return Vec::new();
        }
        votes.insert(from);
        trace!(node = self.id, term = self.term, votes = votes.len(), quorum, "vote granted");
        if votes.len() >= quorum {
            return self.become_leader(now);
        }
        Vec::new()
    }

    fn on_append_entries(
        &mut self,
        from: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        now: Instant,
    ) -> Vec<Outgoing> {
        if let State::Leader { .. } = self.state {
            warn!(
                node = self.id,
                term = self.term,
                from,
                "second leader in the same term, ignoring"
            );
            return Vec::new();
        }
        self.become_follower(now);
        if self.leader != Some(from) {
            info!(node = self.id, term = self.term, leader = from, "following leader");
        }
        self.leader = Some(from);
        self.election.reset(now);

        if !self.log.matches(prev_log_index, prev_log_term) {
            debug!(node = self.id, prev_log_index, prev_log_term, "log mismatch, rejecting");
            return vec![self.reply(
                from,
                Body::AppendEntriesReply {
                    success: false,
                    match_index: 0,
                },
            )];
        }

        let last_new = self.log.append_from(prev_log_index, entries);
        let commit = leader_commit.min(last_new);
        if commit > self.commit_index {
            debug!(node = self.id, commit_index = commit, "follower commit advanced");
            self.commit_index = commit;
        }
        vec![self.reply(
            from,
            Body::AppendEntriesReply {
                success: true,
                match_index: last_new,
            },
        )]
    }

    fn on_append_reply(
        &mut self,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
    ) -> Vec<Outgoing> {
        let last_index = self.log.last_index();
        let State::Leader { progress } = &mut self.state else {
            return Vec::new();
        };
        let Some(p) = progress.get_mut(&from) else {
            warn!(node = self.id, from, "append reply from unknown peer");
            return Vec::new();
        };

        if !success {
            p.next = p.next.saturating_sub(1).max(p.matched + 1);
            p.inflight = true;
            let next = p.next;
            debug!(node = self.id, peer = from, next, "follower rejected, backing off");
            return vec![self.append_for(from, next)];
        }

        p.matched = p.matched.max(match_index);
        p.next = p.next.max(p.matched + 1);
        // Entries proposed while the last append was out go with this reply.
        p.inflight = p.next <= last_index;
        let (next, more) = (p.next, p.inflight);
        self.advance_commit();
        if more {
            return vec![self.append_for(from, next)];
        }
        Vec::new()
    }

    /// Commits the highest current-term index replicated on a majority.
    fn advance_commit(&mut self) {
        let State::Leader { progress } = &self.state else {
            return;
        };
        let mut index = self.log.last_index();
        while index > self.commit_index {
            if self.log.term_at(index) != Some(self.term) {
                break;
            }
            let replicas = 1 + progress.values().filter(|p| p.matched >= index).count();
            if replicas >= self.quorum {
                info!(
                    node = self.id,
                    term = self.term,
                    commit_index = index,
                    "entries committed"
                );
                self.commit_index = index;
                break;
            }
            index -= 1;
        }
    }

    fn propose(&mut self, command: Command) -> Result<(LogIndex, Vec<Outgoing>)> {
        if !matches!(self.state, State::Leader { .. }) {
            return Err(Error::NotLeader {
                leader: self.leader,
            });
        }
        let index = self.log.append(LogEntry::new(self.term, command));
        debug!(node = self.id, term = self.term, index, "proposal appended");
        self.advance_commit();
        Ok((index, self.replicate(true)))
    }
}

impl Protocol for RaftNode {
    type Control = RaftControl;
    type Status = RaftStatus;

    const NAME: &'static str = "raft";

    fn id(&self) -> NodeId {
        self.id
    }

    fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<Outgoing> {
        if msg.term < self.term {
            debug!(
                node = self.id,
                term = self.term,
                stale = msg.term,
                kind = msg.kind(),
                from = msg.from,
                "stale message ignored"
            );
            return Vec::new();
        }
        if msg.term > self.term {
            self.step_down(msg.term, now);
        }

        match msg.body {
            Body::VoteRequest {
                last_log_index,
                last_log_term,
            } => self.on_vote_request(msg.from, last_log_index, last_log_term, now),
            Body::VoteReply { granted } => self.on_vote_reply(msg.from, granted, now),
            Body::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                msg.from,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            Body::AppendEntriesReply {
                success,
                match_index,
            } => self.on_append_reply(msg.from, success, match_index),
            other => {
                warn!(
                    node = self.id,
                    kind = other.kind(),
                    from = msg.from,
                    "unexpected message for raft node"
                );
                Vec::new()
            }
        }
    }

    fn handle_control(&mut self, control: RaftControl, now: Instant, alive: bool) -> Vec<Outgoing> {
        match control {
            RaftControl::Propose { respond_to, .. } if !alive => {
                let _ = respond_to.send(Err(Error::NodeStopped(self.id)));
                Vec::new()
            }
            RaftControl::Propose {
                command,
                respond_to,
            } => match self.propose(command) {
                Ok((index, out)) => {
                    let _ = respond_to.send(Ok(index));
                    out
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                    Vec::new()
                }
            },
            RaftControl::Log { respond_to } => {
                let _ = respond_to.send(self.log.entries().to_vec());
                Vec::new()
            }
            RaftControl::Campaign if alive => self.start_election(now),
            RaftControl::Campaign => {
                warn!(node = self.id, "dead node cannot campaign");
                Vec::new()
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Leader { .. } => self.heartbeat.deadline(),
            _ => Some(self.election.deadline()),
        }
    }

    fn handle_deadline(&mut self, now: Instant) -> Vec<Outgoing> {
        match self.state {
            State::Leader { .. } if self.heartbeat.due(now) => {
                self.heartbeat.start(now);
                self.replicate(false)
            }
            State::Leader { .. } => Vec::new(),
            _ if self.election.expired(now) => self.start_election(now),
            _ => Vec::new(),
        }
    }

    fn defer_deadlines(&mut self, now: Instant) {
        self.election.reset(now);
        if self.heartbeat.is_running() {
            self.heartbeat.start(now);
        }
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            role: self.role(),
            term: self.term,
            leader: self.leader,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
        }
    }
}

impl Cluster<RaftNode> {
    /// Wires `ids` into a full mesh and starts every node as a follower in term 0.
    pub fn raft(ids: Vec<NodeId>, config: RaftConfig) -> Result<Self> {
        let topology = Topology::mesh(ids)?;
        let capacity = config.mailbox.capacity;
        Ok(Cluster::spawn(topology, capacity, |id, topology| {
            RaftNode::new(id, topology, &config, Instant::now())
        }))
    }
}

impl NodeHandle<RaftNode> {
    /// Appends `command` to the leader's log and returns its index.
    ///
    /// The entry is not committed yet; watch `commit_index` for that.
    pub async fn propose(&self, command: Command) -> Result<LogIndex> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RaftControl::Propose {
            command,
            respond_to,
        })?;
        rx.await.map_err(|_| Error::NodeStopped(self.id()))?
    }

    pub async fn log(&self) -> Result<Vec<LogEntry>> {
        let (respond_to, rx) = oneshot::channel();
        self.request(RaftControl::Log { respond_to })?;
        rx.await.map_err(|_| Error::NodeStopped(self.id()))
    }

    pub fn campaign(&self) -> Result<()> {
        self.request(RaftControl::Campaign)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sim::SimNet;

    const STEP: Duration = Duration::from_millis(10);

    fn cluster(ids: &[NodeId], seed: u64) -> SimNet<RaftNode> {
        let topology = Topology::mesh(ids.to_vec()).unwrap();
        let config = RaftConfig {
            seed: Some(seed),
            ..RaftConfig::default()
        };
        let start = Instant::now();
        SimNet::new(topology, |id, topology| RaftNode::new(id, topology, &config, start))
    }

    fn standalone(id: NodeId, ids: &[NodeId]) -> RaftNode {
        let topology = Topology::mesh(ids.to_vec()).unwrap();
        RaftNode::new(id, &topology, &RaftConfig::default(), Instant::now())
    }

    /// Live leaders, highest term first.
    fn leaders(net: &SimNet<RaftNode>) -> Vec<NodeId> {
        let mut leaders: Vec<_> = net
            .live_ids()
            .into_iter()
            .filter(|&id| net.node(id).role() == Role::Leader)
            .collect();
        leaders.sort_by_key(|&id| std::cmp::Reverse(net.node(id).term()));
        leaders
    }

    fn wait_for_leader(net: &mut SimNet<RaftNode>) -> NodeId {
        for _ in 0..500 {
            net.advance(STEP);
            if let Some(&leader) = leaders(net).first() {
                return leader;
            }
        }
        panic!("no leader elected");
    }

    fn propose(net: &mut SimNet<RaftNode>, id: NodeId, key: &str) -> Result<LogIndex> {
        let (tx, mut rx) = oneshot::channel();
        net.control(
            id,
            RaftControl::Propose {
                command: Command::put(key, "v"),
                respond_to: tx,
            },
        );
        rx.try_recv().unwrap()
    }

    fn append(
        term: Term,
        prev: (LogIndex, Term),
        entries: Vec<LogEntry>,
        commit: LogIndex,
    ) -> Message {
        Message::new(
            1,
            2,
            term,
            Body::AppendEntries {
                prev_log_index: prev.0,
                prev_log_term: prev.1,
                entries,
                leader_commit: commit,
            },
        )
    }

    fn entry(term: Term, key: &str) -> LogEntry {
        LogEntry::new(term, Command::put(key, "v"))
    }

    #[test]
    fn elects_one_leader_everyone_follows() {
        let mut net = cluster(&[1, 2, 3, 4, 5], 7);
        let leader = wait_for_leader(&mut net);
        net.advance(Duration::from_millis(200));

        assert_eq!(leaders(&net), vec![leader]);
        let term = net.node(leader).term();
        for id in net.ids() {
            assert_eq!(net.node(id).leader(), Some(leader), "node {id}");
            assert_eq!(net.node(id).term(), term, "node {id}");
        }
    }

    #[test]
    fn at_most_one_leader_per_term_and_terms_never_decrease() {
        for seed in 0..10 {
            let mut net = cluster(&[1, 2, 3, 4, 5], seed);
            let mut leader_of_term: BTreeMap<Term, NodeId> = BTreeMap::new();
            let mut last_term: BTreeMap<NodeId, Term> = BTreeMap::new();

            for step in 0..300 {
                // Knock out whoever leads for a while, then bring it back.
                if step % 100 == 40 {
                    if let Some(&leader) = leaders(&net).first() {
                        net.kill(leader);
                    }
                }
                if step % 100 == 80 {
                    for id in net.ids() {
                        net.revive(id);
                    }
                }
                net.advance(STEP);

                for id in net.ids() {
                    let node = net.node(id);
                    let seen = last_term.insert(id, node.term()).unwrap_or(0);
                    assert!(node.term() >= seen, "seed {seed}: node {id} term went backwards");
                    if node.role() == Role::Leader {
                        let first = *leader_of_term.entry(node.term()).or_insert(id);
                        assert_eq!(first, id, "seed {seed}: two leaders in term {}", node.term());
                    }
                }
            }
        }
    }

    #[test]
    fn minority_never_elects() {
        let mut net = cluster(&[1, 2, 3, 4, 5], 3);
        net.kill(3);
        net.kill(4);
        net.kill(5);
        net.advance(Duration::from_secs(3));

        assert!(leaders(&net).is_empty());
        assert!(net.node(1).term() > 1, "candidates keep retrying");
    }

    #[test]
    fn candidate_needs_majority_of_full_roster() {
        let mut node = standalone(1, &[1, 2, 3, 4, 5]);
        let now = Instant::now();
        node.handle_control(RaftControl::Campaign, now, true);
        assert_eq!(node.role(), Role::Candidate);
        assert_eq!(node.term(), 1);

        let vote = |from, granted| Message::new(from, 1, 1, Body::VoteReply { granted });
        node.handle_message(vote(2, true), now);
        node.handle_message(vote(2, true), now);
        node.handle_message(vote(3, false), now);
        assert_eq!(node.role(), Role::Candidate, "duplicate and denied votes do not count");

        let out = node.handle_message(vote(4, true), now);
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(out.len(), 4, "heartbeat to every peer right away");
    }

    #[test]
    fn proposals_wait_for_outstanding_append() {
        let mut node = standalone(1, &[1, 2, 3]);
        let now = Instant::now();
        node.handle_control(RaftControl::Campaign, now, true);
        let vote = Message::new(2, 1, 1, Body::VoteReply { granted: true });
        let out = node.handle_message(vote, now);
        assert_eq!(node.role(), Role::Leader);
        assert_eq!(out.len(), 2);

        // Both peers still owe a reply to the leader's first heartbeat.
        let (index, out) = node.propose(Command::put("a", "v")).unwrap();
        assert_eq!(index, 1);
        assert!(out.is_empty(), "nothing new goes out while an append is pending");
        let (_, out) = node.propose(Command::put("b", "v")).unwrap();
        assert!(out.is_empty());

        // The reply carries everything proposed in the meantime.
        let reply = Message::new(
            2,
            1,
            1,
            Body::AppendEntriesReply {
                success: true,
                match_index: 0,
            },
        );
        let out = node.handle_message(reply, now);
        let [Outgoing::Send(msg)] = &out[..] else {
            panic!("expected one append to node 2, got {out:?}");
        };
        assert_eq!(msg.to, 2);
        let Body::AppendEntries { entries, .. } = &msg.body else {
            panic!("expected AppendEntries, got {msg:?}");
        };
        assert_eq!(entries.len(), 2);

        // Once node 2 holds both entries they commit, and node 2 is idle again.
        let caught_up = Message::new(
            2,
            1,
            1,
            Body::AppendEntriesReply {
                success: true,
                match_index: 2,
            },
        );
        assert!(node.handle_message(caught_up, now).is_empty());
        assert_eq!(node.commit_index(), 2);
        let (_, out) = node.propose(Command::put("c", "v")).unwrap();
        assert!(matches!(&out[..], [Outgoing::Send(msg)] if msg.to == 2));
    }

    #[test]
    fn heartbeat_resends_to_silent_peers() {
        let mut net = cluster(&[1, 2, 3], 19);
        let leader = wait_for_leader(&mut net);
        net.advance(Duration::from_millis(100));
        let ids = net.ids();
        let silent = *ids.iter().find(|&&id| id != leader).unwrap();
        net.isolate(silent);
        assert_eq!(propose(&mut net, leader, "a"), Ok(1));
        net.advance(Duration::from_millis(100));

        // The peer never answered, so only heartbeats can bring it level.
        net.heal(silent);
        net.advance(Duration::from_millis(200));
        assert_eq!(net.node(silent).log().last_index(), 1);
        assert_eq!(net.node(silent).commit_index(), 1);
    }

    #[test]
    fn single_node_leads_and_commits_alone() {
        let mut net = cluster(&[1], 0);
        let leader = wait_for_leader(&mut net);
        assert_eq!(leader, 1);
        assert_eq!(propose(&mut net, 1, "a"), Ok(1));
        assert_eq!(net.node(1).commit_index(), 1);
    }

    #[test]
    fn vote_goes_to_one_candidate_per_term() {
        let mut node = standalone(2, &[1, 2, 3]);
        let now = Instant::now();
        let request = |from| {
            Message::new(
                from,
                2,
                4,
                Body::VoteRequest {
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
        };

        let granted = |out: Vec<Outgoing>| match &out[..] {
            [Outgoing::Send(msg)] => msg.body == Body::VoteReply { granted: true },
            _ => panic!("expected one reply"),
        };
        assert!(granted(node.handle_message(request(1), now)));
        assert!(!granted(node.handle_message(request(3), now)));
        assert!(granted(node.handle_message(request(1), now)));
        assert_eq!(node.term(), 4);
        assert_eq!(node.status().voted_for, Some(1));
    }

    #[test]
    fn vote_denied_to_outdated_log() {
        let mut node = standalone(2, &[1, 2, 3]);
        let now = Instant::now();
        node.handle_message(append(2, (0, 0), vec![entry(1, "a"), entry(2, "b")], 0), now);

        let out = node.handle_message(
            Message::new(
                3,
                2,
                3,
                Body::VoteRequest {
                    last_log_index: 5,
                    last_log_term: 1,
                },
            ),
            now,
        );
        assert!(matches!(
            &out[..],
            [Outgoing::Send(msg)] if msg.body == (Body::VoteReply { granted: false })
        ));
        assert_eq!(node.term(), 3);
        assert_eq!(node.status().voted_for, None);
    }

    #[test]
    fn stale_messages_get_no_reply() {
        let mut node = standalone(2, &[1, 2, 3]);
        let now = Instant::now();
        node.handle_message(append(5, (0, 0), Vec::new(), 0), now);
        assert_eq!(node.term(), 5);

        let stale_vote = Message::new(
            3,
            2,
            4,
            Body::VoteRequest {
                last_log_index: 9,
                last_log_term: 4,
            },
        );
        assert!(node.handle_message(stale_vote, now).is_empty());
        assert!(node.handle_message(append(4, (0, 0), vec![entry(4, "x")], 1), now).is_empty());
        assert_eq!(node.log().last_index(), 0);
        assert_eq!(node.term(), 5);
    }

    #[test]
    fn duplicate_append_entries_change_nothing() {
        let mut node = standalone(2, &[1, 2, 3]);
        let now = Instant::now();
        let batch = vec![entry(1, "a"), entry(1, "b"), entry(1, "c")];
        node.handle_message(append(1, (0, 0), batch, 2), now);
        assert_eq!(node.commit_index(), 2);

        // A late copy of an earlier, shorter request.
        let out = node.handle_message(append(1, (0, 0), vec![entry(1, "a")], 1), now);
        assert_eq!(node.log().last_index(), 3);
        assert_eq!(node.commit_index(), 2);
        assert!(matches!(
            &out[..],
            [Outgoing::Send(msg)] if msg.body == (Body::AppendEntriesReply {
                success: true,
                match_index: 1,
            })
        ));

        // Replaying a heartbeat is a no-op as well.
        node.handle_message(append(1, (3, 1), Vec::new(), 2), now);
        assert_eq!(node.log().last_index(), 3);
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn mismatched_prefix_is_rejected() {
        let mut node = standalone(2, &[1, 2, 3]);
        let now = Instant::now();
        let out = node.handle_message(append(1, (2, 1), vec![entry(1, "c")], 0), now);
        assert!(matches!(
            &out[..],
            [Outgoing::Send(msg)] if msg.body == (Body::AppendEntriesReply {
                success: false,
                match_index: 0,
            })
        ));
        assert_eq!(node.log().last_index(), 0);
        assert_eq!(node.leader(), Some(1), "the leader is still adopted");
    }

    #[test]
    fn replicated_log_commits_everywhere() {
        let mut net = cluster(&[1, 2, 3], 11);
        let leader = wait_for_leader(&mut net);
        for key in ["a", "b", "c"] {
            assert!(propose(&mut net, leader, key).is_ok());
        }
        net.deliver_all();
        assert_eq!(net.node(leader).commit_index(), 3);

        // Followers learn the commit index from the next heartbeat.
        net.advance(Duration::from_millis(100));
        let expected = net.node(leader).log().clone();
        for id in net.ids() {
            assert_eq!(net.node(id).log(), &expected, "node {id}");
            assert_eq!(net.node(id).commit_index(), 3, "node {id}");
        }
    }

    #[test]
    fn follower_rejects_proposals() {
        let mut net = cluster(&[1, 2, 3], 5);
        let leader = wait_for_leader(&mut net);
        net.advance(Duration::from_millis(100));
        let follower = net.ids().into_iter().find(|&id| id != leader).unwrap();
        assert_eq!(
            propose(&mut net, follower, "a"),
            Err(Error::NotLeader {
                leader: Some(leader)
            })
        );
    }

    #[test]
    fn no_commit_without_majority() {
        let mut net = cluster(&[1, 2, 3], 13);
        let leader = wait_for_leader(&mut net);
        for id in net.ids() {
            if id != leader {
                net.isolate(id);
            }
        }
        assert_eq!(propose(&mut net, leader, "a"), Ok(1));
        net.advance(Duration::from_millis(100));
        assert_eq!(net.node(leader).commit_index(), 0);
    }

    #[test]
    fn lagging_follower_catches_up_after_leader_change() {
        let mut net = cluster(&[1, 2, 3], 17);
        let first = wait_for_leader(&mut net);
        let ids = net.ids();
        let lagging = *ids.iter().find(|&&id| id != first).unwrap();
        net.kill(lagging);

        for key in ["a", "b", "c"] {
            assert!(propose(&mut net, first, key).is_ok());
        }
        net.advance(Duration::from_millis(100));
        assert_eq!(net.node(first).commit_index(), 3);

        // The only up-to-date survivor has to win; the lagging node is
        // brought level entry by entry.
        net.kill(first);
        net.revive(lagging);
        let second = wait_for_leader(&mut net);
        assert_ne!(second, lagging);
        assert_ne!(second, first);
        net.advance(Duration::from_millis(200));

        assert_eq!(net.node(lagging).log(), net.node(second).log());
        assert_eq!(net.node(lagging).log().last_index(), 3);
        assert_eq!(net.node(lagging).commit_index(), 3);
    }

    #[test]
    fn stale_leader_steps_down_and_drops_uncommitted_entries() {
        let mut net = cluster(&[1, 2, 3], 23);
        let old = wait_for_leader(&mut net);
        let old_term = net.node(old).term();
        net.isolate(old);
        assert_eq!(propose(&mut net, old, "lost"), Ok(1));

        let mut new = old;
        for _ in 0..500 {
            net.advance(STEP);
            if let Some(&leader) = leaders(&net).first() {
                if leader != old {
                    new = leader;
                    break;
                }
            }
        }
        assert_ne!(new, old, "majority side elects a new leader");
        assert!(net.node(new).term() > old_term);
        assert!(propose(&mut net, new, "kept").is_ok());
        net.advance(Duration::from_millis(100));

        net.heal(old);
        net.advance(Duration::from_millis(200));
        let rejoined = net.node(old);
        assert_eq!(rejoined.role(), Role::Follower);
        assert_eq!(rejoined.leader(), Some(new));
        assert_eq!(rejoined.log(), net.node(new).log());
        assert_eq!(rejoined.log().entries()[0].command, Command::put("kept", "v"));
    }
}
