//! Deterministic in-memory network for unit tests.
//!
//! Routes [`Outgoing`] values between protocol instances with the same rules
//! as [`crate::transport::Transport`], using one global FIFO queue and a
//! virtual clock. No tasks, no sleeps.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{Message, Outgoing};
use crate::runtime::Protocol;
use crate::topology::Topology;
use crate::types::NodeId;

const MAX_STEPS: usize = 100_000;

pub(crate) struct SimNet<P: Protocol> {
    topology: Topology,
    nodes: BTreeMap<NodeId, P>,
    dead: BTreeSet<NodeId>,
    isolated: BTreeSet<NodeId>,
    queue: VecDeque<Message>,
    now: Instant,
}

impl<P: Protocol> SimNet<P> {
    pub fn new<F>(topology: Topology, mut make: F) -> Self
    where
        F: FnMut(NodeId, &Topology) -> P,
    {
        let nodes = topology
            .members()
            .iter()
            .map(|&id| (id, make(id, &topology)))
            .collect();
        Self {
            topology,
            nodes,
            dead: BTreeSet::new(),
            isolated: BTreeSet::new(),
            queue: VecDeque::new(),
            now: Instant::now(),
        }
    }

    pub fn node(&self, id: NodeId) -> &P {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut P {
        self.nodes.get_mut(&id).expect("node not found")
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn live_ids(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| !self.dead.contains(id))
            .collect()
    }

    pub fn kill(&mut self, id: NodeId) {
        self.dead.insert(id);
    }

    pub fn revive(&mut self, id: NodeId) {
        self.dead.remove(&id);
    }

    /// Cuts a live node off the network in both directions.
    pub fn isolate(&mut self, id: NodeId) {
        self.isolated.insert(id);
    }

    pub fn heal(&mut self, id: NodeId) {
        self.isolated.remove(&id);
    }

    pub fn control(&mut self, id: NodeId, control: P::Control) {
        let alive = !self.dead.contains(&id);
        let now = self.now;
        let out = self.node_mut(id).handle_control(control, now, alive);
        self.route(out);
    }

    /// Feeds one message straight into a node, bypassing the queue.
    pub fn inject(&mut self, msg: Message) {
        let now = self.now;
        let out = self.node_mut(msg.to).handle_message(msg, now);
        self.route(out);
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        if self.dead.contains(&to) {
            return false;
        }
        from == to || !(self.isolated.contains(&from) || self.isolated.contains(&to))
    }

    pub fn route(&mut self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            match out {
                Outgoing::Send(msg) => {
                    if self.reachable(msg.from, msg.to) {
                        self.queue.push_back(msg);
                    }
                }
                Outgoing::Forward(mut msg) => {
                    let mut target = msg.to;
                    for _ in 0..self.topology.len() {
                        if !self.dead.contains(&target) {
                            if self.reachable(msg.from, target) {
                                msg.to = target;
                                self.queue.push_back(msg);
                            }
                            break;
                        }
                        target = self.topology.successor(target).expect("member");
                    }
                }
                Outgoing::Broadcast(msg) => {
                    let peers: Vec<NodeId> = self.topology.others(msg.from).collect();
                    for peer in peers {
                        if self.reachable(msg.from, peer) {
                            self.queue.push_back(msg.readdressed(peer));
                        }
                    }
                }
            }
        }
    }

    /// Delivers queued messages until the network is quiet.
    pub fn deliver_all(&mut self) {
        let mut count = 0;
        while let Some(msg) = self.queue.pop_front() {
            count += 1;
            assert!(count < MAX_STEPS, "network never went quiet");
            let now = self.now;
            let to = msg.to;
            let out = if self.dead.contains(&to) {
                self.node_mut(to).forward_while_dead(msg).into_iter().collect()
            } else {
                self.node_mut(to).handle_message(msg, now)
            };
            self.route(out);
        }
    }

    /// Moves the virtual clock forward, firing every timer that falls due in
    /// order and draining the network after each one.
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        for _ in 0..MAX_STEPS {
            let due = self
                .nodes
                .iter()
                .filter_map(|(&id, node)| node.next_deadline().map(|d| (d, id)))
                .filter(|&(deadline, _)| deadline <= target)
                .min();
            let Some((deadline, id)) = due else {
                self.now = target;
                return;
            };
            self.now = self.now.max(deadline);
            let now = self.now;
            if self.dead.contains(&id) {
                self.node_mut(id).defer_deadlines(now);
            } else {
                let out = self.node_mut(id).handle_deadline(now);
                self.route(out);
            }
            self.deliver_all();
        }
        panic!("timers kept firing without the clock reaching its target");
    }
}
