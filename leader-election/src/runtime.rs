//! Actor runtime shared by all three protocols.
//!
//! Each node runs as one tokio task (a [`Worker`]) that owns its protocol
//! state outright:
//!
//! - **Mailbox**: peer messages, bounded (senders block when full)
//! - **Backlog**: mail taken off the mailbox while the worker itself was
//!   blocked on a full peer mailbox
//! - **Control channel**: requests from the simulation driver
//! - **Deadline**: the protocol's earliest timer, slept on with `sleep_until`
//!
//! The loop handles one event at a time and never shares protocol state, so
//! no locks are involved. A worker waiting for room in a peer's mailbox keeps
//! emptying its own, so two nodes flooding each other cannot wedge.
//! Observers see state only through a `watch` channel carrying whole status
//! snapshots, never a half-applied update.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::pin;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::error::{Error, Result};
use crate::message::{Message, Outgoing};
use crate::topology::Topology;
use crate::transport::{Endpoint, Liveness, Mailbox, Transport};
use crate::types::NodeId;

/// A message-driven election/consensus state machine.
///
/// Implementations do no I/O: every handler returns the messages it wants
/// sent and the worker delivers them. That keeps them testable by routing
/// [`Outgoing`] values by hand.
pub trait Protocol: Send + 'static {
    /// Driver requests specific to this protocol.
    type Control: Send + 'static;
    /// Snapshot published after every event.
    type Status: Clone + PartialEq + Debug + Send + Sync + 'static;

    const NAME: &'static str;

    fn id(&self) -> NodeId;

    fn handle_message(&mut self, msg: Message, now: Instant) -> Vec<Outgoing>;

    fn handle_control(&mut self, control: Self::Control, now: Instant, alive: bool)
        -> Vec<Outgoing>;

    /// Earliest pending timer, if any is armed.
    fn next_deadline(&self) -> Option<Instant>;

    fn handle_deadline(&mut self, now: Instant) -> Vec<Outgoing>;

    /// Called instead of `handle_deadline` while the node is dead: timers
    /// move forward without firing.
    fn defer_deadlines(&mut self, now: Instant);

    /// What a dead node does with a message already in its mailbox.
    fn forward_while_dead(&mut self, msg: Message) -> Option<Outgoing> {
        debug!(node = self.id(), kind = msg.kind(), "dead, ignoring message");
        None
    }

    fn status(&self) -> Self::Status;
}

enum Request<C> {
    Protocol(C),
    Shutdown,
}

struct Worker<P: Protocol> {
    protocol: P,
    mailbox: Mailbox,
    backlog: VecDeque<Message>,
    control_rx: mpsc::UnboundedReceiver<Request<P::Control>>,
    status_tx: watch::Sender<P::Status>,
    liveness: Liveness,
    transport: Arc<Transport>,
}

impl<P: Protocol> Worker<P> {
    async fn run(mut self) {
        let transport = Arc::clone(&self.transport);
        loop {
            let deadline = self.protocol.next_deadline();
            let outgoing = tokio::select! {
                request = self.control_rx.recv() => match request {
                    Some(Request::Protocol(control)) => {
                        let alive = self.liveness.is_alive();
                        self.protocol.handle_control(control, Instant::now(), alive)
                    }
                    Some(Request::Shutdown) | None => break,
                },
                msg = next_inbound(&mut self.backlog, &mut self.mailbox) => match msg {
                    Some(msg) => self.on_message(msg),
                    None => break,
                },
                _ = wait_until(deadline) => self.on_deadline(),
            };

            for out in outgoing {
                for msg in transport.route(out) {
                    self.deliver(&transport, msg).await;
                }
            }
            self.publish();
        }
        debug!(node = self.protocol.id(), "worker stopped");
    }

    /// Waits for a slot in the recipient's mailbox, moving our own inbound
    /// mail to the backlog meanwhile.
    async fn deliver(&mut self, transport: &Transport, msg: Message) {
        let to = msg.to;
        let reserve = transport.reserve(to);
        pin!(reserve);
        let mut open = true;
        loop {
            tokio::select! {
                permit = &mut reserve => {
                    match permit {
                        Some(permit) if transport.is_alive(to) => {
                            trace!(to, kind = msg.kind(), "send");
                            permit.send(msg);
                        }
                        Some(_) => debug!(to, kind = msg.kind(), "recipient died, dropping"),
                        None => debug!(to, kind = msg.kind(), "mailbox closed, dropping"),
                    }
                    return;
                }
                inbound = self.mailbox.recv(), if open => match inbound {
                    Some(inbound) => self.backlog.push_back(inbound),
                    None => open = false,
                },
            }
        }
    }

    fn on_message(&mut self, msg: Message) -> Vec<Outgoing> {
        if self.liveness.is_alive() {
            self.protocol.handle_message(msg, Instant::now())
        } else {
            self.protocol.forward_while_dead(msg).into_iter().collect()
        }
    }

    fn on_deadline(&mut self) -> Vec<Outgoing> {
        let now = Instant::now();
        if self.liveness.is_alive() {
            self.protocol.handle_deadline(now)
        } else {
            self.protocol.defer_deadlines(now);
            Vec::new()
        }
    }

    fn publish(&self) {
        let next = self.protocol.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Oldest buffered message first, then the mailbox.
async fn next_inbound(backlog: &mut VecDeque<Message>, mailbox: &mut Mailbox) -> Option<Message> {
    match backlog.pop_front() {
        Some(msg) => Some(msg),
        None => mailbox.recv().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Driver-side handle to one running node.
pub struct NodeHandle<P: Protocol> {
    id: NodeId,
    control_tx: mpsc::UnboundedSender<Request<P::Control>>,
    status_rx: watch::Receiver<P::Status>,
    liveness: Liveness,
}

impl<P: Protocol> NodeHandle<P> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Latest published snapshot of this node's state.
    pub fn status(&self) -> P::Status {
        self.status_rx.borrow().clone()
    }

    /// Receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<P::Status> {
        self.status_rx.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Marks the node dead or alive. Peers only notice through missing replies.
    pub fn set_alive(&self, alive: bool) {
        self.liveness.set(alive);
    }

    /// Waits until the status satisfies `predicate`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<P::Status>
    where
        F: FnMut(&P::Status) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|status| predicate(status))).await;
        match waited {
            Ok(Ok(status)) => Some(status.clone()),
            _ => None,
        }
    }

    pub(crate) fn request(&self, control: P::Control) -> Result<()> {
        self.control_tx
            .send(Request::Protocol(control))
            .map_err(|_| Error::NodeStopped(self.id))
    }

    fn shutdown(&self) {
        let _ = self.control_tx.send(Request::Shutdown);
    }
}

/// A running set of nodes wired into one topology.
pub struct Cluster<P: Protocol> {
    topology: Arc<Topology>,
    handles: BTreeMap<NodeId, NodeHandle<P>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: Protocol> Cluster<P> {
    /// Builds mailboxes for every member and starts one worker per node.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<F>(topology: Topology, mailbox_capacity: usize, mut make: F) -> Self
    where
        F: FnMut(NodeId, &Topology) -> P,
    {
        let topology = Arc::new(topology);
        let (transport, endpoints) = Transport::build(Arc::clone(&topology), mailbox_capacity);
        let mut handles = BTreeMap::new();
        let mut tasks = Vec::with_capacity(endpoints.len());

        for Endpoint {
            id,
            mailbox,
            liveness,
        } in endpoints
        {
            let protocol = make(id, &topology);
            let (status_tx, status_rx) = watch::channel(protocol.status());
            let (control_tx, control_rx) = mpsc::unbounded_channel();

            let worker = Worker {
                protocol,
                mailbox,
                backlog: VecDeque::new(),
                control_rx,
                status_tx,
                liveness: liveness.clone(),
                transport: Arc::clone(&transport),
            };
            let span = info_span!("node", id, protocol = P::NAME);
            tasks.push(tokio::spawn(worker.run().instrument(span)));

            handles.insert(
                id,
                NodeHandle {
                    id,
                    control_tx,
                    status_rx,
                    liveness,
                },
            );
        }

        Self {
            topology,
            handles,
            tasks,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeHandle<P>> {
        self.handles.get(&id).ok_or(Error::UnknownNode(id))
    }

    /// Handles in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle<P>> {
        self.handles.values()
    }

    pub fn set_alive(&self, id: NodeId, alive: bool) -> Result<()> {
        self.node(id)?.set_alive(alive);
        Ok(())
    }

    pub fn statuses(&self) -> BTreeMap<NodeId, P::Status> {
        self.handles
            .iter()
            .map(|(&id, handle)| (id, handle.status()))
            .collect()
    }

    /// Stops every worker and waits for them to exit.
    pub async fn shutdown(self) {
        for handle in self.handles.values() {
            handle.shutdown();
        }
        for result in join_all(self.tasks).await {
            if let Err(err) = result {
                warn!(error = ?err, "worker task failed");
            }
        }
    }
}
