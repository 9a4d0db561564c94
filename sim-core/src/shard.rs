use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::{NodeId, ShardId},
    model::Block,
    node::Node,
};

/// One partition of the protocol: an append-only block list plus the set of
/// nodes currently assigned to it. Membership is ids only; node state lives
/// with the simulation.
#[derive(Clone, Debug)]
pub struct Shard {
    pub id: ShardId,
    blocks: Vec<Block>,
    members: BTreeSet<NodeId>,
}

impl Shard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            blocks: vec![],
            members: BTreeSet::new(),
        }
    }

    /// Appends a block, ignoring duplicates by id.
    pub fn add_block(&mut self, block: Block) {
        if self.blocks.iter().any(|b| b.id == block.id) {
            return;
        }
        self.blocks.push(block);
    }

    pub fn latest_block_id(&self) -> u64 {
        self.blocks.last().map(|b| b.id).unwrap_or(0)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn add_node(&mut self, id: NodeId) -> bool {
        self.members.insert(id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> bool {
        self.members.remove(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn honest_members(&self, nodes: &BTreeMap<NodeId, Node>) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|id| nodes.get(id).is_some_and(|n| n.honest))
            .collect()
    }

    pub fn malicious_members(&self, nodes: &BTreeMap<NodeId, Node>) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|id| nodes.get(id).is_some_and(|n| !n.honest))
            .collect()
    }
}
