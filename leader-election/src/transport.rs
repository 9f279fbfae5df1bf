//! Mailboxes and in-process message routing.
//!
//! Every node owns a bounded FIFO mailbox (a tokio `mpsc` channel). Senders
//! block when it is full instead of dropping, so messages between any ordered
//! pair of nodes arrive in send order. The [`Transport`] is built once from
//! the topology and shared read-only by all workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::message::{Message, Outgoing};
use crate::topology::Topology;
use crate::types::NodeId;

/// Shared liveness flag. Only the simulation driver flips it.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, alive: bool) {
        self.0.store(alive, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a node's mailbox.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::Receiver<Message>,
}

impl Mailbox {
    /// Waits for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Everything a worker needs to join the transport.
#[derive(Debug)]
pub struct Endpoint {
    pub id: NodeId,
    pub mailbox: Mailbox,
    pub liveness: Liveness,
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(NodeId),
    /// Recipient is dead; the sender has to notice through a timeout.
    Dropped,
}

#[derive(Debug)]
struct Route {
    sender: mpsc::Sender<Message>,
    liveness: Liveness,
}

#[derive(Debug)]
pub struct Transport {
    topology: Arc<Topology>,
    routes: HashMap<NodeId, Route>,
}

impl Transport {
    /// Creates one mailbox per topology member.
    pub fn build(topology: Arc<Topology>, capacity: usize) -> (Arc<Self>, Vec<Endpoint>) {
        let capacity = capacity.max(1);
        let mut routes = HashMap::with_capacity(topology.len());
        let mut endpoints = Vec::with_capacity(topology.len());

        for &id in topology.members() {
            let (sender, rx) = mpsc::channel(capacity);
            let liveness = Liveness::new();
            routes.insert(
                id,
                Route {
                    sender,
                    liveness: liveness.clone(),
                },
            );
            endpoints.push(Endpoint {
                id,
                mailbox: Mailbox { rx },
                liveness,
            });
        }

        (Arc::new(Self { topology, routes }), endpoints)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.routes
            .get(&id)
            .is_some_and(|route| route.liveness.is_alive())
    }

    /// Resolves a routing intent into concrete messages for live recipients.
    ///
    /// Nothing is enqueued here; the caller delivers each message with
    /// [`Transport::send`] or [`Transport::reserve`].
    pub fn route(&self, outgoing: Outgoing) -> Vec<Message> {
        match outgoing {
            Outgoing::Send(msg) => self.addressable(msg).into_iter().collect(),
            Outgoing::Forward(msg) => self.forward(msg).into_iter().collect(),
            Outgoing::Broadcast(msg) => self.broadcast(msg),
        }
    }

    /// Point-to-point: dead and unknown recipients are dropped.
    fn addressable(&self, msg: Message) -> Option<Message> {
        let Some(route) = self.routes.get(&msg.to) else {
            warn!(from = msg.from, to = msg.to, kind = msg.kind(), "unknown recipient, dropping");
            return None;
        };
        if !route.liveness.is_alive() {
            debug!(from = msg.from, to = msg.to, kind = msg.kind(), "recipient dead, dropping");
            return None;
        }
        Some(msg)
    }

    /// Ring delivery: walks successors past dead nodes.
    ///
    /// The walk is bounded by the roster size, so a fully dead ring segment
    /// costs at most one lap.
    pub fn forward(&self, mut msg: Message) -> Option<Message> {
        let mut target = msg.to;
        for _ in 0..self.topology.len() {
            if self.is_alive(target) {
                msg.to = target;
                return Some(msg);
            }
            debug!(from = msg.from, dead = target, kind = msg.kind(), "skipping dead node");
            match self.topology.successor(target) {
                Some(next) => target = next,
                None => break,
            }
        }
        warn!(from = msg.from, kind = msg.kind(), "no live node left on the ring, dropping");
        None
    }

    /// A copy for every live member except the sender.
    pub fn broadcast(&self, msg: Message) -> Vec<Message> {
        self.topology
            .others(msg.from)
            .filter_map(|peer| self.addressable(msg.readdressed(peer)))
            .collect()
    }

    /// Enqueues `msg`, waiting while the recipient's mailbox is full.
    pub async fn send(&self, msg: Message) -> Delivery {
        let Some(msg) = self.addressable(msg) else {
            return Delivery::Dropped;
        };
        let to = msg.to;
        trace!(from = msg.from, to, kind = msg.kind(), "send");
        match self.reserve(to).await {
            Some(permit) => {
                permit.send(msg);
                Delivery::Delivered(to)
            }
            None => {
                debug!(to, "mailbox closed, dropping");
                Delivery::Dropped
            }
        }
    }

    /// Waits for a free slot in `to`'s mailbox. `None` if the mailbox is gone.
    ///
    /// Slots are handed out in request order, so keeping the future alive
    /// keeps the caller's place in line.
    pub async fn reserve(&self, to: NodeId) -> Option<mpsc::Permit<'_, Message>> {
        self.routes.get(&to)?.sender.reserve().await.ok()
    }
}
