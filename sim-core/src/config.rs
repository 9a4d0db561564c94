use std::{collections::BTreeMap, fmt::Display};

use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);
impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl NodeId {
    pub fn to_inner(self) -> usize {
        self.0
    }
    pub fn new(value: usize) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(usize);
impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl ShardId {
    pub fn to_inner(self) -> usize {
        self.0
    }
    pub fn new(value: usize) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttackKind {
    NoAttack,
    Grinding,
}

/// The configuration blob accepted by the HTTP front end.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    pub num_nodes: usize,
    pub num_shards: usize,
    pub num_operators: usize,
    pub simulation_time: u64,
    pub time_step: u64,
    pub malicious_node_ratio: f64,
    pub lottery_win_probability: f64,
    pub malicious_node_multiplier: u32,
    pub block_production_interval: u64,
    pub transactions_per_block: u64,
    pub block_size: u64,
    pub block_header_size: u64,
    pub er_header_size: u64,
    pub er_body_size: u64,
    pub network_bandwidth: u64,
    pub min_network_delay_mean: f64,
    pub max_network_delay_mean: f64,
    pub min_network_delay_std: f64,
    pub max_network_delay_std: f64,
    pub min_gossip_fanout: u32,
    pub max_gossip_fanout: u32,
    #[serde(rename = "maxP2PConnections")]
    pub max_p2p_connections: u64,
    pub time_out: i64,
    pub num_blocks_to_download: u64,
    pub attack_start_time: i64,
    pub attack_end_time: i64,
    /// Not part of the original blob; lets callers reproduce a run exactly.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Clone, Debug)]
pub struct SimConfiguration {
    pub seed: u64,
    pub num_nodes: usize,
    pub num_shards: usize,
    pub num_operators: usize,
    pub simulation_time: u64,
    pub time_step: u64,
    pub malicious_node_ratio: f64,
    pub lottery_win_probability: f64,
    pub malicious_node_multiplier: u32,
    pub block_production_interval: u64,
    pub transactions_per_block: u64,
    pub block_size: u64,
    pub block_header_size: u64,
    pub er_header_size: u64,
    pub er_body_size: u64,
    /// Megabits per second.
    pub network_bandwidth: u64,
    pub min_network_delay_mean: f64,
    pub max_network_delay_mean: f64,
    pub min_network_delay_std: f64,
    pub max_network_delay_std: f64,
    pub min_gossip_fanout: u32,
    pub max_gossip_fanout: u32,
    pub max_p2p_connections: u64,
    /// Milliseconds added when a dishonest peer serves a download.
    pub time_out: f64,
    pub num_blocks_to_download: u64,
    pub attack_start: u64,
    pub attack_end: u64,
    pub attack_schedule: BTreeMap<u64, AttackKind>,
}

impl SimConfiguration {
    pub fn build(raw: RawConfig) -> Result<Self> {
        if raw.num_nodes == 0 {
            bail!("numNodes must be at least 1");
        }
        if raw.num_shards == 0 {
            bail!("numShards must be at least 1");
        }
        if raw.num_operators > raw.num_nodes {
            bail!(
                "numOperators ({}) cannot exceed numNodes ({})",
                raw.num_operators,
                raw.num_nodes
            );
        }
        if raw.simulation_time == 0 || raw.time_step == 0 || raw.block_production_interval == 0 {
            bail!("simulationTime, timeStep and blockProductionInterval must be at least 1");
        }
        if raw.min_gossip_fanout < 2 {
            bail!(
                "minGossipFanout must be at least 2, got {}",
                raw.min_gossip_fanout
            );
        }
        if raw.max_gossip_fanout < raw.min_gossip_fanout {
            bail!(
                "maxGossipFanout ({}) is below minGossipFanout ({})",
                raw.max_gossip_fanout,
                raw.min_gossip_fanout
            );
        }
        if raw.min_network_delay_mean < 0.0 || raw.max_network_delay_mean < raw.min_network_delay_mean
        {
            bail!("network delay mean range is invalid");
        }
        if raw.min_network_delay_std < 0.0 || raw.max_network_delay_std < raw.min_network_delay_std {
            bail!("network delay std range is invalid");
        }
        if raw.network_bandwidth == 0 {
            bail!("networkBandwidth must be at least 1");
        }
        if raw.max_p2p_connections == 0 {
            bail!("maxP2PConnections must be at least 1");
        }
        if raw.time_out < 0 {
            bail!("timeOut cannot be negative");
        }
        if raw.attack_start_time < 0 || raw.attack_end_time < 0 {
            bail!("attack times cannot be negative");
        }
        if !(0.0..=1.0).contains(&raw.malicious_node_ratio) {
            bail!("maliciousNodeRatio must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&raw.lottery_win_probability) {
            bail!("lotteryWinProbability must be within [0, 1]");
        }
        if raw.malicious_node_multiplier == 0 {
            bail!("maliciousNodeMultiplier must be at least 1");
        }
        if raw.transactions_per_block == 0 {
            bail!("transactionsPerBlock must be at least 1");
        }

        let attack_start = raw.attack_start_time as u64;
        let attack_end = raw.attack_end_time as u64;
        Ok(Self {
            seed: raw.seed,
            num_nodes: raw.num_nodes,
            num_shards: raw.num_shards,
            num_operators: raw.num_operators,
            simulation_time: raw.simulation_time,
            time_step: raw.time_step,
            malicious_node_ratio: raw.malicious_node_ratio,
            lottery_win_probability: raw.lottery_win_probability,
            malicious_node_multiplier: raw.malicious_node_multiplier,
            block_production_interval: raw.block_production_interval,
            transactions_per_block: raw.transactions_per_block,
            block_size: raw.block_size,
            block_header_size: raw.block_header_size,
            er_header_size: raw.er_header_size,
            er_body_size: raw.er_body_size,
            network_bandwidth: raw.network_bandwidth,
            min_network_delay_mean: raw.min_network_delay_mean,
            max_network_delay_mean: raw.max_network_delay_mean,
            min_network_delay_std: raw.min_network_delay_std,
            max_network_delay_std: raw.max_network_delay_std,
            min_gossip_fanout: raw.min_gossip_fanout,
            max_gossip_fanout: raw.max_gossip_fanout,
            max_p2p_connections: raw.max_p2p_connections,
            time_out: raw.time_out as f64,
            num_blocks_to_download: raw.num_blocks_to_download,
            attack_start,
            attack_end,
            attack_schedule: attack_schedule(attack_start, attack_end),
        })
    }

    /// The grinding attack window, half-open: active from the start tick up
    /// to (but excluding) the end tick.
    pub fn attack_active_at(&self, tick: u64) -> bool {
        self.attack_start <= tick && tick < self.attack_end
    }
}

fn attack_schedule(start: u64, end: u64) -> BTreeMap<u64, AttackKind> {
    let mut schedule = BTreeMap::new();
    schedule.insert(start, AttackKind::Grinding);
    schedule.insert(end, AttackKind::NoAttack);
    schedule
}

impl Default for SimConfiguration {
    fn default() -> Self {
        Self {
            seed: 0,
            num_nodes: 10_000,
            num_shards: 10,
            num_operators: 100,
            simulation_time: 120,
            time_step: 1,
            malicious_node_ratio: 0.1,
            lottery_win_probability: 0.001,
            malicious_node_multiplier: 1000,
            block_production_interval: 6,
            transactions_per_block: 100,
            block_size: 1_048_576,
            block_header_size: 512,
            er_header_size: 256,
            er_body_size: 4096,
            network_bandwidth: 10,
            min_network_delay_mean: 50.0,
            max_network_delay_mean: 200.0,
            min_network_delay_std: 10.0,
            max_network_delay_std: 50.0,
            min_gossip_fanout: 3,
            max_gossip_fanout: 6,
            max_p2p_connections: 5,
            time_out: 1000.0,
            num_blocks_to_download: 10,
            attack_start: 20,
            attack_end: 60,
            attack_schedule: attack_schedule(20, 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_raw() -> RawConfig {
        RawConfig {
            num_nodes: 100,
            num_shards: 4,
            num_operators: 8,
            simulation_time: 60,
            time_step: 1,
            malicious_node_ratio: 0.1,
            lottery_win_probability: 0.01,
            malicious_node_multiplier: 10,
            block_production_interval: 6,
            transactions_per_block: 100,
            block_size: 1_048_576,
            block_header_size: 512,
            er_header_size: 256,
            er_body_size: 4096,
            network_bandwidth: 10,
            min_network_delay_mean: 50.0,
            max_network_delay_mean: 200.0,
            min_network_delay_std: 10.0,
            max_network_delay_std: 50.0,
            min_gossip_fanout: 3,
            max_gossip_fanout: 6,
            max_p2p_connections: 5,
            time_out: 1000,
            num_blocks_to_download: 10,
            attack_start_time: 20,
            attack_end_time: 40,
            seed: 0,
        }
    }

    #[test]
    fn should_accept_a_valid_config() {
        let config = SimConfiguration::build(valid_raw()).unwrap();
        assert_eq!(config.num_shards, 4);
        assert_eq!(config.attack_schedule.len(), 2);
    }

    #[test]
    fn should_reject_degenerate_fanout() {
        let mut raw = valid_raw();
        raw.min_gossip_fanout = 1;
        assert!(SimConfiguration::build(raw).is_err());

        let mut raw = valid_raw();
        raw.max_gossip_fanout = 2;
        raw.min_gossip_fanout = 4;
        assert!(SimConfiguration::build(raw).is_err());
    }

    #[test]
    fn should_reject_empty_populations() {
        let mut raw = valid_raw();
        raw.num_nodes = 0;
        assert!(SimConfiguration::build(raw).is_err());

        let mut raw = valid_raw();
        raw.num_shards = 0;
        assert!(SimConfiguration::build(raw).is_err());
    }

    #[test]
    fn should_reject_negative_timeout() {
        let mut raw = valid_raw();
        raw.time_out = -1;
        assert!(SimConfiguration::build(raw).is_err());
    }

    #[test]
    fn should_reject_out_of_range_probabilities() {
        let mut raw = valid_raw();
        raw.malicious_node_ratio = 1.5;
        assert!(SimConfiguration::build(raw).is_err());

        let mut raw = valid_raw();
        raw.lottery_win_probability = -0.2;
        assert!(SimConfiguration::build(raw).is_err());
    }

    #[test]
    fn should_parse_camel_case_fields() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "numNodes": 10, "numShards": 2, "numOperators": 2,
                "simulationTime": 12, "timeStep": 1,
                "maliciousNodeRatio": 0.0, "lotteryWinProbability": 0.5,
                "maliciousNodeMultiplier": 2, "blockProductionInterval": 6,
                "transactionsPerBlock": 100, "blockSize": 1048576,
                "blockHeaderSize": 512, "erHeaderSize": 256, "erBodySize": 4096,
                "networkBandwidth": 10,
                "minNetworkDelayMean": 50.0, "maxNetworkDelayMean": 200.0,
                "minNetworkDelayStd": 10.0, "maxNetworkDelayStd": 50.0,
                "minGossipFanout": 3, "maxGossipFanout": 6,
                "maxP2PConnections": 5, "timeOut": 1000,
                "numBlocksToDownload": 10,
                "attackStartTime": 4, "attackEndTime": 8
            }"#,
        )
        .unwrap();
        assert_eq!(raw.max_p2p_connections, 5);
        assert_eq!(raw.seed, 0);
        let config = SimConfiguration::build(raw).unwrap();
        assert!(config.attack_active_at(4));
        assert!(config.attack_active_at(7));
        assert!(!config.attack_active_at(8));
        assert!(!config.attack_active_at(3));
    }
}
