use std::{
    ops::{Add, AddAssign, Sub},
    time::Duration,
};

use serde::Serialize;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A timestamp tracks the time from the start of the simulation.
///
/// One simulation tick is stored as one second; propagation delays are
/// milliseconds, three orders of magnitude below the tick cadence. Events
/// scheduled a few delays past the final tick still order correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_ticks(ticks: u64) -> Self {
        Self(ticks * NANOS_PER_SEC)
    }

    /// The most recent whole tick at or before this timestamp.
    pub fn as_ticks(self) -> u64 {
        self.0 / NANOS_PER_SEC
    }
}

/// Converts a sampled propagation delay in milliseconds to an event offset.
/// Jitter can drive a sample below zero; those clamp to an immediate delivery.
pub fn duration_ms(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.as_nanos() as u64)
    }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.as_nanos() as u64;
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Self::Output {
        Duration::from_nanos(self.0 - rhs.0)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.0 as f64 / NANOS_PER_SEC as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_order_delays_below_tick_spacing() {
        let tick = Timestamp::from_ticks(5);
        let delayed = tick + duration_ms(999.0);
        assert!(delayed < Timestamp::from_ticks(6));
        assert_eq!(delayed.as_ticks(), 5);
    }

    #[test]
    fn should_clamp_negative_delays() {
        assert_eq!(duration_ms(-3.5), Duration::ZERO);
    }
}
