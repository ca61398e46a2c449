//! Two-packet block assembly
//!
//! The chain emits the events of each round in exactly two packets, in either
//! order. Packets are buffered by round; when the second one arrives the round
//! is complete. Complete rounds are released strictly in ascending order: a
//! round ahead of the current one waits until every earlier round has been
//! released.

use crate::events::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half of a round's events as delivered upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    pub round: i64,
    #[serde(default)]
    pub block_hash: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// All events of one round, ready for processing
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvents {
    pub round: i64,
    pub block_hash: String,
    pub events: Vec<Event>,
}

#[derive(Debug)]
enum Slot {
    Partial(EventPacket),
    Complete(BlockEvents),
}

#[derive(Debug, Default)]
pub struct BlockAssembler {
    /// Next round to release; `None` until the first round is known
    current: Option<i64>,
    slots: BTreeMap<i64, Slot>,
}

impl BlockAssembler {
    /// `next_round` is the first round expected, usually one past the last
    /// committed round
    pub fn new(next_round: Option<i64>) -> Self {
        Self {
            current: next_round,
            slots: BTreeMap::new(),
        }
    }

    pub fn current_round(&self) -> Option<i64> {
        self.current.or_else(|| self.slots.keys().next().copied())
    }

    /// Rounds buffered but not yet released
    pub fn pending_rounds(&self) -> usize {
        self.slots.len()
    }

    /// Buffer a packet and return every round that became releasable
    pub fn push(&mut self, packet: EventPacket) -> Vec<BlockEvents> {
        if let Some(current) = self.current {
            if packet.round < current {
                log::warn!(
                    "⚠️  Discarding stale packet for round {} (current round {})",
                    packet.round,
                    current
                );
                return Vec::new();
            }
        }

        match self.slots.remove(&packet.round) {
            None => {
                self.slots.insert(packet.round, Slot::Partial(packet));
            }
            Some(Slot::Partial(first)) => {
                let round = packet.round;
                self.slots.insert(round, Slot::Complete(join(first, packet)));
            }
            Some(complete @ Slot::Complete(_)) => {
                log::warn!(
                    "⚠️  Extra packet for completed round {} discarded ({} events)",
                    packet.round,
                    packet.events.len()
                );
                self.slots.insert(packet.round, complete);
            }
        }

        self.drain()
    }

    /// Release the current round even if only one packet arrived, then any
    /// complete rounds after it
    pub fn flush(&mut self) -> Vec<BlockEvents> {
        if let Some(round) = self.current_round() {
            if let Some(Slot::Partial(packet)) = self.slots.remove(&round) {
                log::warn!("⚠️  Flushing round {} with a single packet", round);
                self.slots.insert(
                    round,
                    Slot::Complete(BlockEvents {
                        round,
                        block_hash: packet.block_hash,
                        events: packet.events,
                    }),
                );
            }
        }
        self.drain()
    }

    fn drain(&mut self) -> Vec<BlockEvents> {
        let mut ready = Vec::new();
        while let Some(round) = self.current_round() {
            match self.slots.get(&round) {
                Some(Slot::Complete(_)) => {}
                _ => break,
            }
            if let Some(Slot::Complete(block)) = self.slots.remove(&round) {
                ready.push(block);
            }
            self.current = Some(round + 1);
        }
        ready
    }
}

fn join(first: EventPacket, second: EventPacket) -> BlockEvents {
    let block_hash = if first.block_hash.is_empty() {
        second.block_hash
    } else {
        first.block_hash
    };
    let mut events = first.events;
    events.extend(second.events);
    BlockEvents {
        round: first.round,
        block_hash,
        events,
    }
}
