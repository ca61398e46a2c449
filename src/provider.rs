//! Provider kinds and the shared provider interface
//!
//! Five provider kinds live in their own tables but share the same lifecycle:
//! registration, stake updates, rewards, health checks, kill/shutdown and
//! round-robin aggregation by bucket.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Miner,
    Sharder,
    Blobber,
    Validator,
    Authorizer,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Miner,
        ProviderKind::Sharder,
        ProviderKind::Blobber,
        ProviderKind::Validator,
        ProviderKind::Authorizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Miner => "miner",
            ProviderKind::Sharder => "sharder",
            ProviderKind::Blobber => "blobber",
            ProviderKind::Validator => "validator",
            ProviderKind::Authorizer => "authorizer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        ProviderKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Entity table
    pub fn table(&self) -> &'static str {
        match self {
            ProviderKind::Miner => "miners",
            ProviderKind::Sharder => "sharders",
            ProviderKind::Blobber => "blobbers",
            ProviderKind::Validator => "validators",
            ProviderKind::Authorizer => "authorizers",
        }
    }

    pub fn snapshot_table(&self) -> &'static str {
        match self {
            ProviderKind::Miner => "miner_snapshots",
            ProviderKind::Sharder => "sharder_snapshots",
            ProviderKind::Blobber => "blobber_snapshots",
            ProviderKind::Validator => "validator_snapshots",
            ProviderKind::Authorizer => "authorizer_snapshots",
        }
    }

    /// Base name of the partitioned aggregate table; partitions are `<base>_<n>`
    pub fn aggregate_table(&self) -> &'static str {
        match self {
            ProviderKind::Miner => "miner_aggregates",
            ProviderKind::Sharder => "sharder_aggregates",
            ProviderKind::Blobber => "blobber_aggregates",
            ProviderKind::Validator => "validator_aggregates",
            ProviderKind::Authorizer => "authorizer_aggregates",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common read interface over provider state, whatever the kind
pub trait Provider {
    fn id(&self) -> &str;
    fn bucket_id(&self) -> i64;
    fn total_stake(&self) -> i64;
    fn service_charge(&self) -> f64;
    fn total_rewards(&self) -> i64;
    fn is_killed(&self) -> bool;
    fn is_shutdown(&self) -> bool;

    fn is_offline(&self) -> bool {
        self.is_killed() || self.is_shutdown()
    }
}

/// Stable bucket for a provider id: the id read as a big-endian hex number,
/// reduced modulo `period`. Ids that are not hex are reduced over their bytes.
pub fn bucket_id(provider_id: &str, period: i64) -> i64 {
    if period <= 1 {
        return 0;
    }
    let period = period as u128;
    let bytes = hex::decode(provider_id).unwrap_or_else(|_| provider_id.as_bytes().to_vec());
    let mut acc: u128 = 0;
    for b in bytes {
        acc = (acc * 256 + b as u128) % period;
    }
    acc as i64
}
