//! Closed-form propagation delays for the gossip overlay. Each call samples
//! fresh network conditions (mean latency, jitter, fanout) from the ranges in
//! the configuration, so repeated transfers see varying weather.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::SimConfiguration;

/// Delay in milliseconds for a full block reaching a shard of `num_operators`
/// over the gossip overlay.
pub fn block_broadcast_delay<R: Rng + ?Sized>(
    rng: &mut R,
    config: &SimConfiguration,
    num_operators: usize,
) -> f64 {
    gossip_delay(rng, config, num_operators, config.block_size)
}

/// Delay in milliseconds for a block header reaching the whole network.
pub fn header_broadcast_delay<R: Rng + ?Sized>(rng: &mut R, config: &SimConfiguration) -> f64 {
    gossip_delay(rng, config, config.num_nodes, config.block_header_size)
}

/// Point-to-point delay in milliseconds for downloading one full block.
/// The caller adds the timeout penalty when the serving peer is dishonest.
pub fn block_download_delay<R: Rng + ?Sized>(rng: &mut R, config: &SimConfiguration) -> f64 {
    let (mean, jitter) = network_conditions(rng, config);
    mean + jitter.sample(rng) / 1000.0 + transmission_ms(config.block_size, config)
}

fn gossip_delay<R: Rng + ?Sized>(
    rng: &mut R,
    config: &SimConfiguration,
    recipients: usize,
    payload_bytes: u64,
) -> f64 {
    let (mean, jitter) = network_conditions(rng, config);
    let fanout = rng.random_range(config.min_gossip_fanout..=config.max_gossip_fanout);
    let hops = ((recipients as f64).ln() / (fanout as f64).ln()).ceil();
    let transmission = transmission_ms(payload_bytes, config);

    let mut total = 0.0;
    for _ in 0..hops as u64 {
        total += mean + jitter.sample(rng) / 1000.0 + transmission;
    }
    total
}

fn network_conditions<R: Rng + ?Sized>(
    rng: &mut R,
    config: &SimConfiguration,
) -> (f64, Normal<f64>) {
    let mean = rng.random_range(config.min_network_delay_mean..=config.max_network_delay_mean);
    let std = rng.random_range(config.min_network_delay_std..=config.max_network_delay_std);
    (mean, Normal::new(0.0, std).unwrap())
}

/// Size in bits over bandwidth in bits per second, as milliseconds.
fn transmission_ms(payload_bytes: u64, config: &SimConfiguration) -> f64 {
    (payload_bytes as f64 * 8.0) / (config.network_bandwidth as f64 * 1_000_000.0) * 1000.0
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use super::*;

    fn fixed_conditions() -> SimConfiguration {
        SimConfiguration {
            num_nodes: 8,
            min_network_delay_mean: 50.0,
            max_network_delay_mean: 50.0,
            min_network_delay_std: 0.0,
            max_network_delay_std: 0.0,
            min_gossip_fanout: 2,
            max_gossip_fanout: 2,
            network_bandwidth: 10,
            block_size: 1_250_000,
            block_header_size: 1250,
            ..SimConfiguration::default()
        }
    }

    #[test]
    fn should_sum_latency_and_transmission_over_hops() {
        let config = fixed_conditions();
        let mut rng = ChaChaRng::seed_from_u64(0);
        // 7 recipients at fanout 2: exactly 3 hops; 1.25 MB at 10 Mbps: 1000ms each
        let delay = block_broadcast_delay(&mut rng, &config, 7);
        assert!((delay - 3.0 * (50.0 + 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn should_collapse_to_one_hop_when_fanout_covers_the_network() {
        let config = SimConfiguration {
            min_gossip_fanout: 8,
            max_gossip_fanout: 8,
            ..fixed_conditions()
        };
        let mut rng = ChaChaRng::seed_from_u64(0);
        // header is 1250 bytes: 1ms of transmission at 10 Mbps
        let delay = header_broadcast_delay(&mut rng, &config);
        assert!((delay - (50.0 + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn should_charge_a_single_transfer_for_downloads() {
        let config = fixed_conditions();
        let mut rng = ChaChaRng::seed_from_u64(0);
        let delay = block_download_delay(&mut rng, &config);
        assert!((delay - (50.0 + 1000.0)).abs() < 1e-9);
    }

    #[test]
    fn should_produce_no_delay_for_a_single_recipient() {
        let config = fixed_conditions();
        let mut rng = ChaChaRng::seed_from_u64(0);
        assert_eq!(block_broadcast_delay(&mut rng, &config, 1), 0.0);
    }
}
