//! Leader election and consensus over in-process actors.
//!
//! Three protocols run on the same actor runtime:
//!
//! - **Ring** (Chang-Roberts): a token carrying the highest id seen so far
//!   circles a directed ring until it returns to its owner.
//! - **Bully**: nodes challenge every higher peer; the highest live node wins.
//! - **Raft**: randomized term elections with log replication and a
//!   majority commit index.
//!
//! # Architecture
//!
//! Every node is one tokio task that owns its protocol state:
//!
//! - **Mailbox**: bounded `mpsc` channel; full mailboxes block senders, so
//!   delivery between any two nodes stays FIFO
//! - **Timers**: deadlines owned by the state machine and slept on by the
//!   same loop that handles messages
//! - **Status**: a `watch` channel with a full snapshot after every event
//!
//! Protocols are written against [`runtime::Protocol`]: handlers take a
//! message, control request or timer expiry and return the messages to
//! send. They do no I/O themselves.
//!
//! Node death is a liveness flag flipped by the driver. Dead nodes keep
//! their mailbox but stop acting; peers find out only through timeouts.
//!
//! # Modules
//!
//! - [`ring`], [`bully`], [`raft`]: the protocols, each with a `Cluster` constructor
//! - [`runtime`]: worker loop, [`NodeHandle`], [`Cluster`]
//! - [`transport`]: mailboxes and routing
//! - [`topology`]: fixed roster, ring successors, quorum size
//! - [`log`]: the Raft log
//! - [`timer`]: election timer and tickers

pub mod bully;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod raft;
pub mod ring;
pub mod runtime;
pub mod timer;
pub mod topology;
pub mod transport;
pub mod types;

#[cfg(test)]
mod sim;

pub use bully::{BullyNode, BullyPhase, BullyStatus};
pub use config::{BullyConfig, MailboxConfig, RaftConfig, RingConfig};
pub use error::{Error, Result};
pub use raft::{RaftNode, RaftStatus};
pub use ring::{CollectReport, RingNode, RingState, RingStatus};
pub use runtime::{Cluster, NodeHandle, Protocol};
pub use topology::{Topology, TopologyKind};
pub use types::{Command, LogEntry, LogIndex, NodeId, Role, Term};
