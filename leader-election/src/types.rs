//! Identifiers and small value types shared by every protocol.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique, totally ordered node identifier. Higher ids win ring and bully elections.
pub type NodeId = u64;

/// Raft logical epoch. Never decreases on any node.
pub type Term = u64;

/// 1-based position in the replicated log. Index 0 means "before the first entry".
pub type LogIndex = u64;

/// Raft role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Commands that flow through the Raft replicated log.
///
/// The core never applies these; callers read `commit_index` and apply
/// committed entries themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
}

impl Command {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term of the leader that created this entry.
    pub term: Term,
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, command: Command) -> Self {
        Self { term, command }
    }
}
