use super::{avg, impl_provider, GlobalDelta, ProviderSnapshot, SnapshotBase};
use crate::provider::ProviderKind;
use rusqlite::types::Value;
use rusqlite::Row;

pub const GIB: i128 = 1 << 30;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobberSnapshot {
    pub base: SnapshotBase,
    pub write_price: i64,
    pub capacity: i64,
    pub allocated: i64,
    pub saved_data: i64,
    pub read_data: i64,
    pub offers_total: i64,
    pub open_challenges: i64,
    pub challenges_passed: i64,
    pub challenges_completed: i64,
    pub rank_metric: f64,
}

impl_provider!(BlobberSnapshot);

impl BlobberSnapshot {
    /// Storage the blobber's stake pays for at its write price. A free
    /// blobber backs its whole capacity. Only the network total is clamped,
    /// see `GlobalSnapshot::clamp`.
    pub fn staked_storage(&self) -> i64 {
        if self.write_price <= 0 {
            return self.capacity;
        }
        let backed = self.base.total_stake as i128 * GIB / self.write_price as i128;
        i64::try_from(backed).unwrap_or(i64::MAX)
    }

    pub fn current_rank(&self) -> f64 {
        if self.challenges_completed > 0 {
            self.challenges_passed as f64 / self.challenges_completed as f64
        } else {
            0.0
        }
    }
}

impl ProviderSnapshot for BlobberSnapshot {
    const KIND: ProviderKind = ProviderKind::Blobber;
    const EXTRA_COLUMNS: &'static [&'static str] = &[
        "write_price",
        "capacity",
        "allocated",
        "saved_data",
        "read_data",
        "offers_total",
        "open_challenges",
        "challenges_passed",
        "challenges_completed",
        "rank_metric",
    ];
    const AGGREGATE_COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("write_price", "INTEGER"),
        ("capacity", "INTEGER"),
        ("allocated", "INTEGER"),
        ("saved_data", "INTEGER"),
        ("read_data", "INTEGER"),
        ("offers_total", "INTEGER"),
        ("open_challenges", "INTEGER"),
        ("staked_storage", "INTEGER"),
        ("challenges_passed", "INTEGER"),
        ("challenges_completed", "INTEGER"),
        ("rank_metric", "REAL"),
    ];

    fn base(&self) -> &SnapshotBase {
        &self.base
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            base: SnapshotBase::from_row(row)?,
            write_price: row.get(11)?,
            capacity: row.get(12)?,
            allocated: row.get(13)?,
            saved_data: row.get(14)?,
            read_data: row.get(15)?,
            offers_total: row.get(16)?,
            open_challenges: row.get(17)?,
            challenges_passed: row.get(18)?,
            challenges_completed: row.get(19)?,
            rank_metric: row.get(20)?,
        })
    }

    fn extra_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.write_price),
            Value::Integer(self.capacity),
            Value::Integer(self.allocated),
            Value::Integer(self.saved_data),
            Value::Integer(self.read_data),
            Value::Integer(self.offers_total),
            Value::Integer(self.open_challenges),
            Value::Integer(self.challenges_passed),
            Value::Integer(self.challenges_completed),
            Value::Real(self.rank_metric),
        ]
    }

    fn aggregate_values(prev: &Self, curr: &Self) -> Vec<Value> {
        vec![
            Value::Integer(avg(prev.write_price, curr.write_price)),
            Value::Integer(avg(prev.capacity, curr.capacity)),
            Value::Integer(avg(prev.allocated, curr.allocated)),
            Value::Integer(avg(prev.saved_data, curr.saved_data)),
            Value::Integer(avg(prev.read_data, curr.read_data)),
            Value::Integer(avg(prev.offers_total, curr.offers_total)),
            Value::Integer(avg(prev.open_challenges, curr.open_challenges)),
            Value::Integer(avg(prev.staked_storage(), curr.staked_storage())),
            Value::Integer(curr.challenges_passed),
            Value::Integer(curr.challenges_completed),
            Value::Real(curr.current_rank()),
        ]
    }

    fn online_contribution(&self) -> GlobalDelta {
        GlobalDelta {
            blobber_count: 1,
            total_staked: self.base.total_stake,
            storage_token_stake: self.base.total_stake,
            total_rewards: self.base.total_rewards,
            blobber_total_rewards: self.base.total_rewards,
            successful_challenges: self.challenges_passed,
            total_challenges: self.challenges_completed,
            allocated_storage: self.allocated,
            max_capacity_storage: self.capacity,
            used_storage: self.saved_data,
            staked_storage: self.staked_storage(),
            total_write_price: self.write_price,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;

    fn snapshot(stake: i64, write_price: i64, capacity: i64) -> BlobberSnapshot {
        BlobberSnapshot {
            base: SnapshotBase {
                provider_id: "b1".into(),
                total_stake: stake,
                ..Default::default()
            },
            write_price,
            capacity,
            ..Default::default()
        }
    }

    #[test]
    fn test_staked_storage() {
        // 2 tokens at 1 token/GiB backs 2 GiB
        assert_eq!(snapshot(2, 1, 10 << 30).staked_storage(), 2 << 30);
        // not capped per blobber
        assert_eq!(snapshot(100, 1, 1 << 30).staked_storage(), 100 << 30);
        // free storage backs full capacity
        assert_eq!(snapshot(0, 0, 500).staked_storage(), 500);
    }

    #[test]
    fn test_offline_contributes_nothing() {
        let mut s = snapshot(10, 1, 100);
        assert_eq!(s.contribution().blobber_count, 1);
        s.base.is_killed = true;
        assert!(s.is_offline());
        assert!(s.contribution().is_zero());
    }

    #[test]
    fn test_aggregate_values_average_gauges() {
        let mut prev = snapshot(10, 4, 100);
        prev.challenges_passed = 1;
        prev.challenges_completed = 2;
        let mut curr = snapshot(20, 6, 300);
        curr.challenges_passed = 3;
        curr.challenges_completed = 4;

        let values = BlobberSnapshot::aggregate_values(&prev, &curr);
        assert_eq!(values[0], Value::Integer(5));
        assert_eq!(values[1], Value::Integer(200));
        assert_eq!(values[8], Value::Integer(3));
        assert_eq!(values[10], Value::Real(0.75));
    }
}
