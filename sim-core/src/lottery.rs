use rand::Rng;

use crate::config::{NodeId, ShardId, SimConfiguration};

/// Runs one rotation lottery for a node. Honest nodes always get a single
/// Bernoulli trial; dishonest nodes get `malicious_node_multiplier`
/// independent trials while the grinding attack window is active, winning if
/// any succeeds.
pub fn win<R: Rng + ?Sized>(
    rng: &mut R,
    honest: bool,
    tick: u64,
    config: &SimConfiguration,
) -> bool {
    let attempts = if honest || !config.attack_active_at(tick) {
        1
    } else {
        config.malicious_node_multiplier
    };
    (0..attempts).any(|_| rng.random_bool(config.lottery_win_probability))
}

/// The shard a winning ticket moves a node to, reproducible from the node id
/// and the winning tick alone.
pub fn assign_shard(node: NodeId, tick: u64, num_shards: usize) -> ShardId {
    ShardId::new((node.to_inner() + tick as usize) % num_shards)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaChaRng;

    use super::*;
    use crate::config::SimConfiguration;

    #[test]
    fn should_be_deterministic_at_the_extremes() {
        let mut rng = ChaChaRng::seed_from_u64(7);
        let mut config = SimConfiguration::default();

        config.lottery_win_probability = 1.0;
        assert!(win(&mut rng, true, 0, &config));
        config.lottery_win_probability = 0.0;
        assert!(!win(&mut rng, false, config.attack_start, &config));
    }

    #[test]
    fn should_multiply_attempts_inside_the_attack_window() {
        let config = SimConfiguration {
            lottery_win_probability: 0.01,
            malicious_node_multiplier: 100,
            ..SimConfiguration::default()
        };
        let in_window = config.attack_start;
        let before_window = config.attack_start - 1;

        let mut rng = ChaChaRng::seed_from_u64(42);
        let honest_wins = (0..500).filter(|_| win(&mut rng, true, in_window, &config)).count();
        let mut rng = ChaChaRng::seed_from_u64(42);
        let grinding_wins = (0..500)
            .filter(|_| win(&mut rng, false, in_window, &config))
            .count();
        let mut rng = ChaChaRng::seed_from_u64(42);
        let idle_malicious_wins = (0..500)
            .filter(|_| win(&mut rng, false, before_window, &config))
            .count();

        assert!(grinding_wins > honest_wins * 10);
        // outside the window a dishonest node is back to one trial
        assert_eq!(idle_malicious_wins, honest_wins);
    }

    #[test]
    fn should_assign_shards_by_id_and_tick() {
        assert_eq!(assign_shard(NodeId::new(3), 4, 5), ShardId::new(2));
        assert_eq!(assign_shard(NodeId::new(0), 0, 5), ShardId::new(0));
        // rotating the tick walks the node through every shard
        let shards: Vec<_> = (0..5)
            .map(|t| assign_shard(NodeId::new(1), t, 5).to_inner())
            .collect();
        assert_eq!(shards, vec![1, 2, 3, 4, 0]);
    }
}
