//! Messages exchanged between node actors.
//!
//! A [`Message`] is plain data: once handed to the transport it is never
//! mutated, only copied (broadcast) or re-addressed (ring rerouting).
//! [`Body`] is keyed by message kind and each variant carries only what
//! that kind needs.

use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    /// Sender's term. Only meaningful for Raft; ring and bully traffic carries 0.
    pub term: Term,
    pub body: Body,
}

impl Message {
    pub fn new(from: NodeId, to: NodeId, term: Term, body: Body) -> Self {
        Self {
            from,
            to,
            term,
            body,
        }
    }

    /// Copy of this message delivered to a different recipient.
    pub fn readdressed(&self, to: NodeId) -> Self {
        Self {
            to,
            ..self.clone()
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Body {
    /// Ring election token. `candidate` is the highest live id seen so far.
    Election {
        candidate: NodeId,
        initiator: NodeId,
        hops: u32,
    },
    /// Bully challenge sent to every strictly higher peer.
    Challenge,
    /// Bully `OK`: a higher live node takes the election over.
    Answer,
    /// Leader announcement (ring and bully). Bully leaders repeat it as a heartbeat.
    Coordinator { leader: NodeId },
    VoteRequest {
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    VoteReply { granted: bool },
    /// Log replication; an empty `entries` list is a heartbeat.
    AppendEntries {
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesReply {
        success: bool,
        /// Highest index known to match the leader's log when `success` is set.
        match_index: LogIndex,
    },
    /// Leader asks a member for its local data.
    Collect,
    CollectReply { data: u64 },
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Election { .. } => "election",
            Body::Challenge => "challenge",
            Body::Answer => "answer",
            Body::Coordinator { .. } => "coordinator",
            Body::VoteRequest { .. } => "vote_request",
            Body::VoteReply { .. } => "vote_reply",
            Body::AppendEntries { .. } => "append_entries",
            Body::AppendEntriesReply { .. } => "append_entries_reply",
            Body::Collect => "collect",
            Body::CollectReply { .. } => "collect_reply",
        }
    }
}

/// What a protocol handler asks the transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Point-to-point. Dropped if the recipient is dead.
    Send(Message),
    /// Ring routing: deliver to `to`, or to the first live node after it on the ring.
    Forward(Message),
    /// Copy to every topology member except the sender; `to` is filled per recipient.
    Broadcast(Message),
}

impl Outgoing {
    pub fn message(&self) -> &Message {
        match self {
            Outgoing::Send(msg) | Outgoing::Forward(msg) | Outgoing::Broadcast(msg) => msg,
        }
    }
}
