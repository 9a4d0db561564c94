use std::collections::BTreeMap;

use rand::Rng;

use crate::{
    clock::Timestamp,
    config::{NodeId, ShardId, SimConfiguration},
    delay, lottery,
    model::{Block, BlockHeader},
};

/// A participant in the protocol. Nodes are plain data owned by the
/// simulation; they hold no references to their peers. Peer slices are built
/// by the core for each broadcast or download.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub honest: bool,
    pub operator: bool,
    /// Current shard assignment; regular nodes start unassigned.
    pub shard: Option<ShardId>,
    blocks: BTreeMap<ShardId, BTreeMap<u64, Block>>,
    headers: BTreeMap<ShardId, BTreeMap<u64, BlockHeader>>,
}

/// One scheduled delivery produced by a broadcast: who receives the payload,
/// and how many milliseconds the gossip overlay takes to carry it there.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub recipient: NodeId,
    pub delay_ms: f64,
}

impl Node {
    pub fn new<R: Rng + ?Sized>(
        rng: &mut R,
        config: &SimConfiguration,
        id: NodeId,
        operator: bool,
    ) -> Self {
        let honest = !rng.random_bool(config.malicious_node_ratio);
        // every header chain starts from the synthetic genesis header
        let headers = (0..config.num_shards)
            .map(|s| {
                let shard = ShardId::new(s);
                (shard, BTreeMap::from([(0, BlockHeader::genesis(shard))]))
            })
            .collect();
        Self {
            id,
            honest,
            operator,
            shard: None,
            blocks: BTreeMap::new(),
            headers,
        }
    }

    /// Runs the rotation lottery for this node. On a win, returns the shard
    /// the winning ticket points at; the simulation core commits the move.
    pub fn participate_in_lottery<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        tick: u64,
        config: &SimConfiguration,
    ) -> Option<ShardId> {
        if lottery::win(rng, self.honest, tick, config) {
            Some(lottery::assign_shard(self.id, tick, config.num_shards))
        } else {
            None
        }
    }

    pub fn create_block(&self, parent: u64, now: Timestamp) -> Block {
        Block {
            id: parent + 1,
            shard: self.shard.expect("producers are always assigned to a shard"),
            producer: self.id,
            parent,
            timestamp: now,
            malicious: !self.honest,
        }
    }

    pub fn create_block_header(&self, parent: u64, now: Timestamp) -> BlockHeader {
        BlockHeader {
            id: parent + 1,
            shard: self.shard.expect("producers are always assigned to a shard"),
            producer: self.id,
            parent,
            timestamp: now,
        }
    }

    /// Stores a received block body. Malicious bodies are silently dropped;
    /// redelivery is a no-op.
    pub fn handle_block(&mut self, block: Block) {
        if block.malicious {
            return;
        }
        self.blocks
            .entry(block.shard)
            .or_default()
            .entry(block.id)
            .or_insert(block);
    }

    /// Stores a received header. Headers are not filtered for honesty; the
    /// header gossip is the only chain-tip signal.
    pub fn handle_block_header(&mut self, header: BlockHeader) {
        self.headers
            .entry(header.shard)
            .or_default()
            .entry(header.id)
            .or_insert(header);
    }

    pub fn latest_block_header_id(&self, shard: ShardId) -> u64 {
        self.headers
            .get(&shard)
            .and_then(|chain| chain.keys().next_back().copied())
            .unwrap_or(0)
    }

    pub fn has_header(&self, shard: ShardId, id: u64) -> bool {
        self.headers
            .get(&shard)
            .is_some_and(|chain| chain.contains_key(&id))
    }

    pub fn has_block(&self, shard: ShardId, id: u64) -> bool {
        self.blocks
            .get(&shard)
            .is_some_and(|store| store.contains_key(&id))
    }

    pub fn block(&self, shard: ShardId, id: u64) -> Option<&Block> {
        self.blocks.get(&shard).and_then(|store| store.get(&id))
    }

    /// Plans delivery of a block body to every operator of the shard, one
    /// sampled gossip delay per recipient.
    pub fn broadcast_block<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        config: &SimConfiguration,
        operators: &[&Node],
    ) -> Vec<Delivery> {
        operators
            .iter()
            .filter(|peer| peer.id != self.id)
            .map(|peer| Delivery {
                recipient: peer.id,
                delay_ms: delay::block_broadcast_delay(rng, config, operators.len()),
            })
            .collect()
    }

    /// Plans delivery of a header to every node in the network.
    pub fn broadcast_block_header<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        config: &SimConfiguration,
        peers: &[&Node],
    ) -> Vec<Delivery> {
        peers
            .iter()
            .filter(|peer| peer.id != self.id)
            .map(|peer| Delivery {
                recipient: peer.id,
                delay_ms: delay::header_broadcast_delay(rng, config),
            })
            .collect()
    }

    /// Catch-up: fetches the `num_blocks_to_download` bodies below the local
    /// header tip, in batches of at most `max_p2p_connections` parallel
    /// connections. Operators are tried before regular peers. Each batch
    /// waits for its slowest fetch, so the returned delay is the sum of
    /// per-batch maxima. Already-present ids cost nothing; a dishonest server
    /// adds the timeout penalty to its fetch.
    pub fn download_latest_k_blocks<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        config: &SimConfiguration,
        peers: &[&Node],
        shard: ShardId,
    ) -> f64 {
        let latest = self.latest_block_header_id(shard);
        let start = latest.saturating_sub(config.num_blocks_to_download);
        let (operators, regulars): (Vec<&&Node>, Vec<&&Node>) =
            peers.iter().partition(|peer| peer.operator);

        let mut total_delay = 0.0;
        let mut batch_start = latest;
        while batch_start > start {
            let batch_end = start.max(batch_start.saturating_sub(config.max_p2p_connections));
            let mut batch_max: f64 = 0.0;
            for id in ((batch_end + 1)..=batch_start).rev() {
                if self.has_block(shard, id) {
                    continue;
                }
                let served = operators
                    .iter()
                    .chain(regulars.iter())
                    .find_map(|peer| Some((peer.block(shard, id)?.clone(), peer.honest)));
                let Some((block, server_honest)) = served else {
                    continue;
                };
                let mut delay_ms = delay::block_download_delay(rng, config);
                if !server_honest {
                    delay_ms += config.time_out;
                }
                if !block.malicious {
                    self.blocks.entry(shard).or_default().insert(id, block);
                }
                batch_max = batch_max.max(delay_ms);
            }
            total_delay += batch_max;
            batch_start = batch_end;
        }
        total_delay
    }
}
