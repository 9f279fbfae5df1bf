//! Node roster and the relation each protocol needs.
//!
//! A [`Topology`] is built once, before any actor starts, and is shared
//! read-only (`Arc<Topology>`) for the rest of the run. There is no dynamic
//! membership.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    /// Directed cycle in roster order; the last member's successor is the first.
    Ring,
    /// Every member sees every other member.
    Mesh,
}

#[derive(Debug, Clone)]
pub struct Topology {
    kind: TopologyKind,
    members: Vec<NodeId>,
}

impl Topology {
    pub fn ring(members: Vec<NodeId>) -> Result<Self> {
        Self::new(TopologyKind::Ring, members)
    }

    pub fn mesh(members: Vec<NodeId>) -> Result<Self> {
        Self::new(TopologyKind::Mesh, members)
    }

    fn new(kind: TopologyKind, members: Vec<NodeId>) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::EmptyTopology);
        }
        let mut seen = BTreeSet::new();
        for &id in &members {
            if !seen.insert(id) {
                return Err(Error::DuplicateNode(id));
            }
        }
        Ok(Self { kind, members })
    }

    pub fn kind(&self) -> TopologyKind {
        self.kind
    }

    /// Members in roster order (which is also ring order).
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }

    /// Ring successor of `id`. A single-member ring is its own successor.
    pub fn successor(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.members.iter().position(|&m| m == id)?;
        Some(self.members[(pos + 1) % self.members.len()])
    }

    /// Nodes `id` talks to directly: its successor on a ring, everyone else on a mesh.
    pub fn peers(&self, id: NodeId) -> Vec<NodeId> {
        match self.kind {
            TopologyKind::Ring => self.successor(id).into_iter().collect(),
            TopologyKind::Mesh => self.others(id).collect(),
        }
    }

    /// Every member except `id`, in roster order. Broadcast targets.
    pub fn others(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied().filter(move |&m| m != id)
    }

    /// Strict majority of the full configured node set.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}
