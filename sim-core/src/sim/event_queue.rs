use std::{cmp::Reverse, collections::BinaryHeap};

use crate::clock::Timestamp;

use super::SimulationEvent;

/// Min-heap of scheduled events. Timestamp ties break on the event-type
/// ordinal, so a lottery sweep always dispatches before the production
/// events it seeds at the same instant.
pub struct EventQueue {
    scheduled: BinaryHeap<FutureEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            scheduled: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, at: Timestamp, event: SimulationEvent) {
        self.scheduled.push(FutureEvent(at, event));
    }

    pub fn pop(&mut self) -> Option<(Timestamp, SimulationEvent)> {
        let FutureEvent(timestamp, event) = self.scheduled.pop()?;
        Some((timestamp, event))
    }
}

// wrapper struct which holds a SimulationEvent,
// but is ordered by (timestamp, ordinal) in reverse
struct FutureEvent(Timestamp, SimulationEvent);
impl FutureEvent {
    fn key(&self) -> Reverse<(Timestamp, u8)> {
        Reverse((self.0, self.1.ordinal()))
    }
}

impl PartialEq for FutureEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for FutureEvent {}
impl PartialOrd for FutureEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FutureEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttackKind, NodeId, ShardId};
    use crate::model::BlockHeader;
    use crate::sim::SimulationMessage;

    #[test]
    fn should_break_timestamp_ties_by_event_type() {
        let now = Timestamp::from_ticks(3);
        let mut queue = EventQueue::new();
        queue.push(now, SimulationEvent::Metrics);
        queue.push(
            now,
            SimulationEvent::Message {
                to: NodeId::new(0),
                payload: SimulationMessage::BlockHeader(BlockHeader::genesis(ShardId::new(0))),
            },
        );
        queue.push(now, SimulationEvent::Attack(AttackKind::Grinding));
        queue.push(
            now,
            SimulationEvent::ShardBlockProduction {
                shard: ShardId::new(0),
            },
        );
        queue.push(now, SimulationEvent::Lottery);

        let order: Vec<u8> = std::iter::from_fn(|| queue.pop())
            .map(|(_, event)| event.ordinal())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn should_pop_in_timestamp_order() {
        let mut queue = EventQueue::new();
        queue.push(Timestamp::from_ticks(2), SimulationEvent::Lottery);
        queue.push(Timestamp::from_ticks(1), SimulationEvent::Metrics);
        let (first, _) = queue.pop().unwrap();
        assert_eq!(first, Timestamp::from_ticks(1));
        let (second, _) = queue.pop().unwrap();
        assert_eq!(second, Timestamp::from_ticks(2));
        assert!(queue.pop().is_none());
    }
}
