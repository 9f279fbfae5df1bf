use thiserror::Error;

use crate::types::NodeId;

/// Errors surfaced to the simulation driver.
///
/// Protocol traffic never produces these: undeliverable, stale or malformed
/// messages are logged and dropped inside the actors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("topology requires at least one node")]
    EmptyTopology,

    #[error("node {0} appears more than once in the roster")]
    DuplicateNode(NodeId),

    #[error("node {0} is not part of the topology")]
    UnknownNode(NodeId),

    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("node {0} has stopped")]
    NodeStopped(NodeId),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
