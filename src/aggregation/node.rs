//! Miner and sharder snapshots. Both consensus roles track the same state and
//! differ only in which global counters they feed.

use super::{avg, impl_provider, GlobalDelta, ProviderSnapshot, SnapshotBase};
use crate::provider::ProviderKind;
use rusqlite::types::Value;
use rusqlite::Row;

macro_rules! node_snapshot {
    ($name:ident, $kind:expr, $count:ident, $rewards:ident) => {
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $name {
            pub base: SnapshotBase,
            pub fees: i64,
            pub last_health_check: i64,
        }

        impl_provider!($name);

        impl ProviderSnapshot for $name {
            const KIND: ProviderKind = $kind;
            const EXTRA_COLUMNS: &'static [&'static str] = &["fees", "last_health_check"];
            const AGGREGATE_COLUMNS: &'static [(&'static str, &'static str)] =
                &[("fees", "INTEGER"), ("last_health_check", "INTEGER")];

            fn base(&self) -> &SnapshotBase {
                &self.base
            }

            fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    base: SnapshotBase::from_row(row)?,
                    fees: row.get(11)?,
                    last_health_check: row.get(12)?,
                })
            }

            fn extra_values(&self) -> Vec<Value> {
                vec![Value::Integer(self.fees), Value::Integer(self.last_health_check)]
            }

            fn aggregate_values(prev: &Self, curr: &Self) -> Vec<Value> {
                vec![
                    Value::Integer(avg(prev.fees, curr.fees)),
                    Value::Integer(curr.last_health_check),
                ]
            }

            fn online_contribution(&self) -> GlobalDelta {
                GlobalDelta {
                    $count: 1,
                    total_staked: self.base.total_stake,
                    total_rewards: self.base.total_rewards,
                    $rewards: self.base.total_rewards,
                    ..Default::default()
                }
            }
        }
    };
}

node_snapshot!(MinerSnapshot, ProviderKind::Miner, miner_count, miner_total_rewards);
node_snapshot!(SharderSnapshot, ProviderKind::Sharder, sharder_count, sharder_total_rewards);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contributions_feed_own_counters() {
        let base = SnapshotBase {
            provider_id: "m1".into(),
            total_stake: 40,
            total_rewards: 7,
            ..Default::default()
        };
        let miner = MinerSnapshot { base: base.clone(), ..Default::default() };
        let sharder = SharderSnapshot { base, ..Default::default() };

        let m = miner.contribution();
        assert_eq!((m.miner_count, m.sharder_count, m.miner_total_rewards), (1, 0, 7));
        let s = sharder.contribution();
        assert_eq!((s.miner_count, s.sharder_count, s.sharder_total_rewards), (0, 1, 7));
        assert_eq!(s.total_staked, 40);
    }
}
