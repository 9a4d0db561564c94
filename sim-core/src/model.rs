use crate::{
    clock::Timestamp,
    config::{NodeId, ShardId},
};

/// A full block body. Within a shard, ids are dense: each block's id is its
/// parent's id plus one, with 0 reserved for genesis.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: u64,
    pub shard: ShardId,
    pub producer: NodeId,
    pub parent: u64,
    pub timestamp: Timestamp,
    pub malicious: bool,
}

/// The lightweight projection of a block, gossiped to the whole network.
/// Headers carry no honesty tag; they are the chain-tip signal and are
/// accepted from anyone.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockHeader {
    pub id: u64,
    pub shard: ShardId,
    pub producer: NodeId,
    pub parent: u64,
    pub timestamp: Timestamp,
}

impl BlockHeader {
    pub fn genesis(shard: ShardId) -> Self {
        Self {
            id: 0,
            shard,
            producer: NodeId::new(0),
            parent: 0,
            timestamp: Timestamp::zero(),
        }
    }
}
