use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use average::Mean;
use serde::Serialize;

use crate::{
    clock::Timestamp,
    config::{NodeId, ShardId, SimConfiguration},
    node::Node,
    shard::Shard,
};

/// Everything the simulation accumulates between two metrics checkpoints.
#[derive(Clone, Debug, Default)]
pub struct StepSamples {
    pub broadcast_delays: BTreeMap<ShardId, Vec<f64>>,
    pub header_delays: BTreeMap<ShardId, Vec<f64>>,
    pub download_delays: BTreeMap<ShardId, Vec<f64>>,
    pub rotations: u64,
    pub malicious_rotations: u64,
    pub logs: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct ShardSnapshot {
    honest_nodes: u64,
    malicious_nodes: u64,
    honest_blocks: u64,
    malicious_blocks: u64,
}

#[derive(Clone, Debug)]
struct Checkpoint {
    tick: u64,
    blocks_this_step: u64,
    transactions_this_step: u64,
    rotations_this_step: u64,
    malicious_rotations_this_step: u64,
    throughput: f64,
    /// Production cadence plus the average broadcast delay seen this step.
    latency: f64,
    shard_stats: BTreeMap<ShardId, ShardSnapshot>,
    logs: Vec<String>,
}

/// Accumulates per-shard production tallies and propagation-delay samples
/// over the whole run, plus per-checkpoint snapshots for the text report.
#[derive(Clone, Debug, Default)]
pub struct MetricsCollector {
    checkpoints: Vec<Checkpoint>,
    broadcast_delays: BTreeMap<ShardId, Vec<f64>>,
    header_delays: BTreeMap<ShardId, Vec<f64>>,
    download_delays: BTreeMap<ShardId, Vec<f64>>,
    shard_blocks: BTreeMap<ShardId, (u64, u64)>,
    malicious_rotations: u64,
    last_checkpoint: Option<Timestamp>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one step's accumulators into the collector and snapshots the
    /// current shard state. Block tallies are recomputed from the shards, not
    /// kept incrementally.
    pub fn collect(
        &mut self,
        now: Timestamp,
        config: &SimConfiguration,
        shards: &BTreeMap<ShardId, Shard>,
        nodes: &BTreeMap<NodeId, Node>,
        step: StepSamples,
    ) {
        let step_broadcast_samples: Vec<f64> = step
            .broadcast_delays
            .values()
            .flat_map(|samples| samples.iter().copied())
            .collect();
        let latency =
            config.block_production_interval as f64 + mean_of(&step_broadcast_samples);

        for (shard, samples) in step.broadcast_delays {
            self.broadcast_delays.entry(shard).or_default().extend(samples);
        }
        for (shard, samples) in step.header_delays {
            self.header_delays.entry(shard).or_default().extend(samples);
        }
        for (shard, samples) in step.download_delays {
            self.download_delays.entry(shard).or_default().extend(samples);
        }
        self.malicious_rotations += step.malicious_rotations;

        let mut shard_stats: BTreeMap<ShardId, ShardSnapshot> = shards
            .keys()
            .map(|id| (*id, ShardSnapshot::default()))
            .collect();
        for node in nodes.values() {
            let Some(shard) = node.shard else { continue };
            let stats = shard_stats.entry(shard).or_default();
            if node.honest {
                stats.honest_nodes += 1;
            } else {
                stats.malicious_nodes += 1;
            }
        }

        let mut blocks_this_step = 0;
        let mut honest_this_step = 0;
        self.shard_blocks.clear();
        for (id, shard) in shards {
            let stats = shard_stats.entry(*id).or_default();
            let tally = self.shard_blocks.entry(*id).or_default();
            for block in shard.blocks() {
                if block.malicious {
                    stats.malicious_blocks += 1;
                    tally.1 += 1;
                } else {
                    stats.honest_blocks += 1;
                    tally.0 += 1;
                }
                let in_window = block.timestamp <= now
                    && self.last_checkpoint.is_none_or(|last| block.timestamp > last);
                if in_window {
                    blocks_this_step += 1;
                    if !block.malicious {
                        honest_this_step += 1;
                    }
                }
            }
        }

        let transactions_this_step = honest_this_step * config.transactions_per_block;
        self.checkpoints.push(Checkpoint {
            tick: now.as_ticks(),
            blocks_this_step,
            transactions_this_step,
            rotations_this_step: step.rotations,
            malicious_rotations_this_step: step.malicious_rotations,
            throughput: transactions_this_step as f64 / config.time_step as f64,
            latency,
            shard_stats,
            logs: step.logs,
        });
        self.last_checkpoint = Some(now);
    }

    pub fn total_malicious_rotations(&self) -> u64 {
        self.malicious_rotations
    }

    /// Raw catch-up delay samples per shard, one per production event.
    pub fn download_samples(&self) -> &BTreeMap<ShardId, Vec<f64>> {
        &self.download_delays
    }

    /// The structured report returned to HTTP callers.
    pub fn response(&self, config: &SimConfiguration) -> SimulationResponse {
        let block_production: BTreeMap<usize, ShardProduction> = (0..config.num_shards)
            .map(|shard| {
                let (honest, malicious) = self
                    .shard_blocks
                    .get(&ShardId::new(shard))
                    .copied()
                    .unwrap_or_default();
                (
                    shard,
                    ShardProduction {
                        malicious_blocks: malicious,
                        honest_blocks: honest,
                        total_blocks: honest + malicious,
                    },
                )
            })
            .collect();

        let total_honest_blocks: u64 = block_production.values().map(|p| p.honest_blocks).sum();
        let transactions_per_second = (total_honest_blocks * config.transactions_per_block) as f64
            / config.simulation_time as f64;

        let header_samples: Vec<f64> = self
            .header_delays
            .values()
            .flat_map(|samples| samples.iter().copied())
            .collect();

        SimulationResponse {
            transaction_size_bytes: config.block_size / config.transactions_per_block,
            transactions_per_block: config.transactions_per_block,
            block_size_kb: config.block_size as f64 / 1024.0,
            block_production,
            network_metrics: NetworkMetrics {
                block_broadcast_delays_ms: self.shard_delay_means(config, &self.broadcast_delays),
                block_header_delay_ms: mean_of(&header_samples),
                block_download_delays_ms: self.shard_delay_means(config, &self.download_delays),
            },
            performance: Performance {
                transactions_per_second,
            },
        }
    }

    fn shard_delay_means(
        &self,
        config: &SimConfiguration,
        delays: &BTreeMap<ShardId, Vec<f64>>,
    ) -> BTreeMap<usize, f64> {
        (0..config.num_shards)
            .map(|shard| {
                let samples = delays
                    .get(&ShardId::new(shard))
                    .map(|s| s.as_slice())
                    .unwrap_or_default();
                (shard, mean_of(samples))
            })
            .collect()
    }

    /// Writes the human-readable report. The caller decides whether a failure
    /// here is fatal; the structured response does not depend on it.
    pub fn write_report(&self, config: &SimConfiguration, path: &Path) -> Result<()> {
        let report = self.render_report(config);
        std::fs::write(path, report)
            .with_context(|| format!("failed to write report to {}", path.display()))
    }

    fn render_report(&self, config: &SimConfiguration) -> String {
        let mut report = String::new();
        report.push_str("Simulation Report\n");
        report.push_str(&format!(
            "Nodes: {}, Shards: {}, Operators: {}, Simulation Time: {}\n",
            config.num_nodes, config.num_shards, config.num_operators, config.simulation_time
        ));
        report.push_str(&format!(
            "ER header size: {} bytes, ER body size: {} bytes\n\n",
            config.er_header_size, config.er_body_size
        ));

        for checkpoint in &self.checkpoints {
            report.push_str(&format!(
                "Tick: {}, Blocks This Step: {}, Transactions This Step: {}, TPS: {:.2}, Avg Latency: {:.2}\n",
                checkpoint.tick,
                checkpoint.blocks_this_step,
                checkpoint.transactions_this_step,
                checkpoint.throughput,
                checkpoint.latency
            ));
            for (shard, stats) in &checkpoint.shard_stats {
                report.push_str(&format!(
                    "  Shard {shard}: Honest Nodes: {}, Malicious Nodes: {}, Honest Blocks: {}, Malicious Blocks: {}\n",
                    stats.honest_nodes, stats.malicious_nodes, stats.honest_blocks, stats.malicious_blocks
                ));
            }
            if checkpoint.rotations_this_step > 0 || checkpoint.malicious_rotations_this_step > 0 {
                report.push_str(&format!(
                    "  Shard Rotations This Step: {} ({} malicious)\n",
                    checkpoint.rotations_this_step, checkpoint.malicious_rotations_this_step
                ));
            }
            for log in &checkpoint.logs {
                report.push_str(&format!("  {log}\n"));
            }
            report.push('\n');
        }

        for (shard, (honest, malicious)) in &self.shard_blocks {
            report.push_str(&format!(
                "Total Blocks Produced in Shard {shard}: {} (honest: {honest}, malicious: {malicious})\n",
                honest + malicious
            ));
        }

        self.render_attack_summary(config, &mut report);
        report
    }

    fn render_attack_summary(&self, config: &SimConfiguration, report: &mut String) {
        let start = config.attack_start;
        let end = config.attack_end;

        let phase_of = |tick: u64| {
            if tick < start {
                0
            } else if tick <= end {
                1
            } else {
                2
            }
        };
        let mut tps_sums = [0.0f64; 3];
        let mut counts = [0u64; 3];
        let mut rotations = [0u64; 3];
        for checkpoint in &self.checkpoints {
            let phase = phase_of(checkpoint.tick);
            tps_sums[phase] += checkpoint.throughput;
            counts[phase] += 1;
            rotations[phase] += checkpoint.malicious_rotations_this_step;
        }
        let avg = |phase: usize| {
            if counts[phase] > 0 {
                tps_sums[phase] / counts[phase] as f64
            } else {
                0.0
            }
        };

        report.push_str("\nSummary Analysis:\n");
        report.push_str(&format!(
            "Average TPS before Grinding Attack (Tick < {start}): {:.2}\n",
            avg(0)
        ));
        report.push_str(&format!(
            "Average TPS during Grinding Attack ({start} <= Tick <= {end}): {:.2}\n",
            avg(1)
        ));
        report.push_str(&format!(
            "Average TPS after Grinding Attack (Tick > {end}): {:.2}\n",
            avg(2)
        ));
        report.push_str(&format!(
            "Malicious Shard Rotations before/during/after Attack: {}/{}/{}\n",
            rotations[0], rotations[1], rotations[2]
        ));
        report.push_str(&format!(
            "Total Malicious Shard Rotations: {}\n",
            self.malicious_rotations
        ));
    }
}

fn mean_of(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean: Mean = samples.iter().copied().collect();
    mean.mean()
}

#[derive(Clone, Debug, Serialize)]
pub struct SimulationResponse {
    pub transaction_size_bytes: u64,
    pub transactions_per_block: u64,
    pub block_size_kb: f64,
    pub block_production: BTreeMap<usize, ShardProduction>,
    pub network_metrics: NetworkMetrics,
    pub performance: Performance,
}

#[derive(Clone, Debug, Serialize)]
pub struct ShardProduction {
    pub malicious_blocks: u64,
    pub honest_blocks: u64,
    pub total_blocks: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NetworkMetrics {
    pub block_broadcast_delays_ms: BTreeMap<usize, f64>,
    pub block_header_delay_ms: f64,
    pub block_download_delays_ms: BTreeMap<usize, f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Performance {
    pub transactions_per_second: f64,
}
