use crate::aprs::AprsPacket;
use crate::filter::{matches_any, FilterSpec};
use std::collections::VecDeque;
use std::time::Instant;

/// Bounded ring of recently observed packets, used to replay history to
/// newly connected clients. The bound is hard; recording at capacity
/// evicts the oldest slot.
pub struct HistoryBuffer {
    capacity: usize,
    slots: VecDeque<HistorySlot>,
}

struct HistorySlot {
    packet: AprsPacket,
    recorded_at: Instant,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        HistoryBuffer {
            capacity: capacity.max(1),
            slots: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, packet: AprsPacket) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(HistorySlot {
            packet,
            recorded_at: Instant::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The most recent `limit` packets matching `filters` recorded after
    /// `since`, returned in insertion order.
    pub fn query(
        &self,
        filters: &[FilterSpec],
        since: Option<Instant>,
        limit: usize,
    ) -> Vec<AprsPacket> {
        let mut matched: Vec<AprsPacket> = self
            .slots
            .iter()
            .rev()
            .filter(|slot| match since {
                Some(since) => slot.recorded_at > since,
                None => true,
            })
            .filter(|slot| matches_any(filters, &slot.packet))
            .take(limit)
            .map(|slot| slot.packet.clone())
            .collect();
        matched.reverse();
        matched
    }
}
