//! Event model: the record emitted by smart-contract execution, its closed tag
//! set, the typed payloads and the per-block merger.

pub mod merger;
pub mod payloads;
pub mod tags;

pub use merger::{merge_block, MergeOutput, MergedEvent, RejectedEvent};
pub use payloads::{decode, EventPayload};
pub use tags::{EventTag, MergeStrategy};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum EventType {
    #[default]
    None,
    /// Blockchain-visible failure; `data` holds the message
    Error,
    Chain,
    Stats,
}

impl From<EventType> for i32 {
    fn from(t: EventType) -> i32 {
        match t {
            EventType::None => 0,
            EventType::Error => 1,
            EventType::Chain => 2,
            EventType::Stats => 3,
        }
    }
}

impl TryFrom<i32> for EventType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, String> {
        match code {
            0 => Ok(EventType::None),
            1 => Ok(EventType::Error),
            2 => Ok(EventType::Chain),
            3 => Ok(EventType::Stats),
            other => Err(format!("unknown event type {}", other)),
        }
    }
}

/// One event as emitted for a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub block_number: i64,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(rename = "type", default)]
    pub event_type: EventType,
    pub tag: EventTag,
    /// Dedup key within a block: provider id, allocation id, tx hash...
    #[serde(default)]
    pub index: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        block_number: i64,
        tag: EventTag,
        index: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            block_number,
            tx_hash: String::new(),
            event_type: EventType::Stats,
            tag,
            index: index.into(),
            data,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = tx_hash.into();
        self
    }

    pub fn error(block_number: i64, tx_hash: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            block_number,
            tx_hash: tx_hash.into(),
            event_type: EventType::Error,
            tag: EventTag::None,
            index: String::new(),
            data: serde_json::Value::String(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        // Test: events decode from the integer-coded wire format
        let raw = json!({
            "block_number": 7,
            "tx_hash": "t1",
            "type": 3,
            "tag": 10,
            "index": "t1",
            "data": {"hash": "t1", "fee": 2}
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.tag, EventTag::AddTransactions);
        assert_eq!(event.event_type, EventType::Stats);
        assert_eq!(event.block_number, 7);
    }

    #[test]
    fn test_error_event() {
        let e = Event::error(3, "tx", "insufficient balance");
        assert_eq!(e.event_type, EventType::Error);
        assert_eq!(e.data, json!("insufficient balance"));
    }
}
