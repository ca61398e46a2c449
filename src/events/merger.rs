//! Per-block event merger
//!
//! Collapses the events of one block into the smallest set the dispatcher has
//! to apply. Events are grouped by tag (groups keep the order in which their
//! tag first appeared) and each group is reduced by the tag's strategy:
//!
//! - `OverwriteByIndex`: one output per index, the last event wins
//! - `AdditiveByIndex`: one output per index, payloads summed in input order
//! - `Append`: one output per tag carrying every payload, in input order
//!
//! Error-type events never merge; they are passed through for the `errors`
//! table. Payloads that fail to decode are rejected individually.
//!
//! Merging is a pure function of the input list, and merging an already
//! merged list (via `MergedEvent::to_event`) yields the same output.

use super::payloads::{decode, EventPayload};
use super::tags::{EventTag, MergeStrategy};
use super::{Event, EventType};
use crate::error::Result;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct MergedEvent {
    pub tag: EventTag,
    pub index: String,
    pub block_number: i64,
    pub tx_hash: String,
    pub payload: EventPayload,
}

impl MergedEvent {
    /// Re-encode as a raw event
    pub fn to_event(&self) -> Result<Event> {
        Ok(Event {
            block_number: self.block_number,
            tx_hash: self.tx_hash.clone(),
            event_type: EventType::Stats,
            tag: self.tag,
            index: self.index.clone(),
            data: self.payload.to_json()?,
        })
    }
}

/// An event that could not be decoded into its tag's payload
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEvent {
    pub tag: EventTag,
    pub tx_hash: String,
    pub index: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct MergeOutput {
    pub events: Vec<MergedEvent>,
    pub rejected: Vec<RejectedEvent>,
    /// `EventType::Error` events, untouched
    pub errors: Vec<Event>,
}

struct TagGroup {
    tag: EventTag,
    entries: Vec<MergedEvent>,
    by_index: HashMap<String, usize>,
}

impl TagGroup {
    fn new(tag: EventTag) -> Self {
        Self {
            tag,
            entries: Vec::new(),
            by_index: HashMap::new(),
        }
    }

    fn push(&mut self, event: &Event, payload: EventPayload, block_hash: &str) -> std::result::Result<(), String> {
        match self.tag.strategy() {
            MergeStrategy::OverwriteByIndex => {
                let merged = merged(event, payload, &event.index);
                match self.by_index.get(&event.index) {
                    Some(&pos) => self.entries[pos] = merged,
                    None => {
                        self.by_index.insert(event.index.clone(), self.entries.len());
                        self.entries.push(merged);
                    }
                }
            }
            MergeStrategy::AdditiveByIndex => match self.by_index.get(&event.index) {
                Some(&pos) => {
                    let entry = &mut self.entries[pos];
                    entry.payload.absorb(payload)?;
                    entry.tx_hash = event.tx_hash.clone();
                }
                None => {
                    // One summed item per key, even for multi-item payloads
                    let mut acc = empty_like(&payload);
                    acc.absorb(payload)?;
                    self.by_index.insert(event.index.clone(), self.entries.len());
                    self.entries.push(merged(event, acc, &event.index));
                }
            },
            MergeStrategy::Append => match self.entries.first_mut() {
                Some(entry) => entry.payload.extend(payload)?,
                None => self.entries.push(merged(event, payload, block_hash)),
            },
        }
        Ok(())
    }
}

fn merged(event: &Event, payload: EventPayload, index: &str) -> MergedEvent {
    MergedEvent {
        tag: event.tag,
        index: index.to_string(),
        block_number: event.block_number,
        tx_hash: event.tx_hash.clone(),
        payload,
    }
}

fn empty_like(payload: &EventPayload) -> EventPayload {
    match payload {
        EventPayload::BlobberOffers(_) => EventPayload::BlobberOffers(Vec::new()),
        EventPayload::StakeTotals(_) => EventPayload::StakeTotals(Vec::new()),
        EventPayload::StakePoolRewards(_) => EventPayload::StakePoolRewards(Vec::new()),
        EventPayload::BlobberChallenges(_) => EventPayload::BlobberChallenges(Vec::new()),
        EventPayload::BlobberOpenChallenges(_) => EventPayload::BlobberOpenChallenges(Vec::new()),
        EventPayload::BlobberStats(_) => EventPayload::BlobberStats(Vec::new()),
        EventPayload::AllocationChallengeCounts(_) => {
            EventPayload::AllocationChallengeCounts(Vec::new())
        }
        EventPayload::AllocationStats(_) => EventPayload::AllocationStats(Vec::new()),
        EventPayload::HealthChecks(_) => EventPayload::HealthChecks(Vec::new()),
        EventPayload::UserAmounts(_) => EventPayload::UserAmounts(Vec::new()),
        // absorb() rejects everything else
        other => other.clone(),
    }
}

/// Merge the events of one block
pub fn merge_block(block_hash: &str, events: &[Event]) -> MergeOutput {
    let mut output = MergeOutput::default();
    let mut groups: Vec<TagGroup> = Vec::new();
    let mut group_of: HashMap<EventTag, usize> = HashMap::new();

    for event in events {
        if event.event_type == EventType::Error {
            output.errors.push(event.clone());
            continue;
        }

        let payload = match decode(event.tag, &event.index, &event.data) {
            Ok(p) => p,
            Err(e) => {
                output.rejected.push(reject(event, e.to_string()));
                continue;
            }
        };

        let slot = *group_of.entry(event.tag).or_insert_with(|| {
            groups.push(TagGroup::new(event.tag));
            groups.len() - 1
        });

        if let Err(reason) = groups[slot].push(event, payload, block_hash) {
            output.rejected.push(reject(event, reason));
        }
    }

    output.events = groups.into_iter().flat_map(|g| g.entries).collect();
    output
}

fn reject(event: &Event, reason: String) -> RejectedEvent {
    log::warn!(
        "⚠️  Skipping {} event (tx: {}, index: {}): {}",
        event.tag,
        event.tx_hash,
        event.index,
        reason
    );
    RejectedEvent {
        tag: event.tag,
        tx_hash: event.tx_hash.clone(),
        index: event.index.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(tag: EventTag, index: &str, data: serde_json::Value) -> Event {
        Event::new(5, tag, index, data)
    }

    #[test]
    fn test_overwrite_last_wins() {
        // Test: two user overwrites for the same index collapse to the last
        let events = vec![
            ev(EventTag::AddOrOverwriteUser, "u1", json!({"user_id": "u1", "balance": 1})),
            ev(EventTag::AddOrOverwriteUser, "u2", json!({"user_id": "u2", "balance": 5})),
            ev(EventTag::AddOrOverwriteUser, "u1", json!({"user_id": "u1", "balance": 9})),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.events.len(), 2);
        match &out.events[0].payload {
            EventPayload::Users(u) => assert_eq!(u[0].balance, 9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_additive_sums_by_index() {
        let events = vec![
            ev(EventTag::UpdateBlobberTotalOffers, "b1", json!({"id": "b1", "offers_total": 4})),
            ev(EventTag::UpdateBlobberTotalOffers, "b2", json!({"id": "b2", "offers_total": 1})),
            ev(EventTag::UpdateBlobberTotalOffers, "b1", json!({"id": "b1", "offers_total": 6})),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].index, "b1");
        match &out.events[0].payload {
            EventPayload::BlobberOffers(o) => assert_eq!(o[0].offers_total, 10),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blobber_total_stake_updates_are_summed() {
        let events = vec![
            ev(EventTag::UpdateBlobberTotalStake, "b1", json!({"id": "b1", "total_stake": 30})),
            ev(EventTag::UpdateBlobberTotalStake, "b1", json!({"id": "b1", "total_stake": 12})),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.events.len(), 1);
        match &out.events[0].payload {
            EventPayload::StakeTotals(totals) => assert_eq!(totals[0].total_stake, 42),
            other => panic!("unexpected {:?}", other),
        }

        // Test: the other kinds keep the last reported stake
        let events = vec![
            ev(EventTag::UpdateMinerTotalStake, "m1", json!({"id": "m1", "total_stake": 30})),
            ev(EventTag::UpdateMinerTotalStake, "m1", json!({"id": "m1", "total_stake": 12})),
        ];
        match &merge_block("bh", &events).events[0].payload {
            EventPayload::StakeTotals(totals) => assert_eq!(totals[0].total_stake, 12),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_additive_array_keeps_items_apart() {
        // Test: one event carrying two blobbers' stats, then more for b2
        let events = vec![
            ev(
                EventTag::UpdateBlobberStat,
                "b1",
                json!([{"id": "b1", "saved_data": 5}, {"id": "b2", "saved_data": 7}]),
            ),
            ev(EventTag::UpdateBlobberStat, "b1", json!({"id": "b2", "read_data": 3})),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.events.len(), 1);
        match &out.events[0].payload {
            EventPayload::BlobberStats(stats) => {
                let summed: Vec<(&str, i64, i64)> = stats
                    .iter()
                    .map(|s| (s.id.as_str(), s.saved_data, s.read_data))
                    .collect();
                assert_eq!(summed, vec![("b1", 5, 0), ("b2", 7, 3)]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_append_concatenates_in_order() {
        let events = vec![
            ev(EventTag::AddTransactions, "t1", json!({"hash": "t1"})),
            ev(EventTag::AddMint, "m", json!({"amount": 1})),
            ev(EventTag::AddTransactions, "t2", json!([{"hash": "t2"}, {"hash": "t3"}])),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.events[0].tag, EventTag::AddTransactions);
        assert_eq!(out.events[0].index, "bh");
        match &out.events[0].payload {
            EventPayload::Transactions(t) => {
                let hashes: Vec<_> = t.iter().map(|t| t.hash.as_str()).collect();
                assert_eq!(hashes, vec!["t1", "t2", "t3"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_payload_rejected_not_fatal() {
        let events = vec![
            ev(EventTag::AddMint, "m", json!({"amount": "x"})),
            ev(EventTag::AddMint, "m", json!({"amount": 3})),
            Event::error(5, "tx9", "out of gas"),
        ];
        let out = merge_block("bh", &events);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].payload.len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        // Test: merging the merged output again changes nothing
        let events = vec![
            ev(EventTag::AddBlobber, "b1", json!({"id": "b1", "capacity": 10})),
            ev(
                EventTag::StakePoolReward,
                "b1",
                json!({"provider_id": "b1", "provider_type": "blobber", "reward": 2,
                       "delegate_rewards": {"d1": 1}}),
            ),
            ev(EventTag::AddTransactions, "t1", json!({"hash": "t1", "fee": 1})),
            ev(
                EventTag::StakePoolReward,
                "b1",
                json!({"provider_id": "b1", "provider_type": "blobber", "reward": 3,
                       "delegate_rewards": {"d1": 4, "d2": 1}}),
            ),
            ev(EventTag::AddTransactions, "t2", json!({"hash": "t2", "fee": 2})),
            ev(EventTag::AddBlobber, "b1", json!({"id": "b1", "capacity": 20})),
        ];
        let once = merge_block("bh", &events);
        let replay: Vec<Event> = once.events.iter().map(|e| e.to_event().unwrap()).collect();
        let twice = merge_block("bh", &replay);
        assert_eq!(once.events, twice.events);
        assert!(twice.rejected.is_empty());
    }

    #[test]
    fn test_merge_is_deterministic() {
        let events: Vec<Event> = (0..20)
            .map(|i| {
                ev(
                    EventTag::AddOrOverwriteUser,
                    &format!("u{}", i % 7),
                    json!({"user_id": format!("u{}", i % 7), "balance": i}),
                )
            })
            .collect();
        assert_eq!(merge_block("bh", &events).events, merge_block("bh", &events).events);
    }
}
