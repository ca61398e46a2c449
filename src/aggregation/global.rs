//! Network-wide snapshot series
//!
//! One `global_snapshots` row per processed round. Each round starts from the
//! previous row, applies the round's `GlobalDelta` (event counters plus
//! provider contribution changes), clamps and saves.

use crate::error::Result;
use crate::store::now;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

macro_rules! global_metrics {
    ($($field:ident),+ $(,)?) => {
        /// Signed change to the global metrics
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct GlobalDelta {
            $(pub $field: i64,)+
        }

        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct GlobalSnapshot {
            pub round: i64,
            pub created_at: i64,
            $(pub $field: i64,)+
        }

        impl GlobalDelta {
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field)),+];
        }

        impl AddAssign for GlobalDelta {
            fn add_assign(&mut self, other: Self) {
                $(self.$field += other.$field;)+
            }
        }

        impl SubAssign for GlobalDelta {
            fn sub_assign(&mut self, other: Self) {
                $(self.$field -= other.$field;)+
            }
        }

        impl Neg for GlobalDelta {
            type Output = Self;

            fn neg(self) -> Self {
                Self { $($field: -self.$field,)+ }
            }
        }

        impl GlobalSnapshot {
            pub fn apply(&mut self, delta: &GlobalDelta) {
                $(self.$field += delta.$field;)+
            }

            fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                Ok(Self {
                    round: row.get("round")?,
                    created_at: row.get("created_at")?,
                    $($field: row.get(stringify!($field))?,)+
                })
            }

            fn metric_values(&self) -> Vec<i64> {
                vec![$(self.$field),+]
            }
        }
    };
}

global_metrics! {
    total_mint,
    zcn_supply,
    total_challenge_pools,
    client_locks,
    total_read_pool_locked,
    total_write_pool_locked,
    mined_total,
    total_staked,
    storage_token_stake,
    total_rewards,
    blobber_total_rewards,
    miner_total_rewards,
    sharder_total_rewards,
    validator_total_rewards,
    authorizer_total_rewards,
    successful_challenges,
    total_challenges,
    allocated_storage,
    max_capacity_storage,
    staked_storage,
    used_storage,
    total_write_price,
    transactions_count,
    total_txn_fee,
    block_count,
    unique_addresses,
    blobber_count,
    miner_count,
    sharder_count,
    validator_count,
    authorizer_count,
    authorizer_total_mint,
    authorizer_total_burn,
}

impl GlobalDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for GlobalDelta {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl Sub for GlobalDelta {
    type Output = Self;

    fn sub(mut self, other: Self) -> Self {
        self -= other;
        self
    }
}

impl GlobalSnapshot {
    /// The snapshot for `round`: `prev` (or zeros) plus `delta`, clamped
    pub fn next(prev: Option<&GlobalSnapshot>, round: i64, delta: &GlobalDelta) -> Self {
        let mut snapshot = prev.cloned().unwrap_or_default();
        snapshot.round = round;
        snapshot.created_at = now();
        snapshot.apply(delta);
        snapshot.clamp();
        snapshot
    }

    /// Stake-backed storage can never exceed what blobbers offer
    pub fn clamp(&mut self) {
        if self.staked_storage > self.max_capacity_storage {
            self.staked_storage = self.max_capacity_storage;
        }
    }

    pub fn save(&self, conn: &Connection) -> Result<()> {
        let columns = GlobalDelta::FIELDS;
        let placeholders: Vec<String> = (3..3 + columns.len()).map(|i| format!("?{}", i)).collect();
        let updates: Vec<String> = columns.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        let sql = format!(
            "INSERT INTO global_snapshots (round, created_at, {}) VALUES (?1, ?2, {})
             ON CONFLICT(round) DO UPDATE SET created_at = excluded.created_at, {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );

        let mut values = vec![self.round, self.created_at];
        values.extend(self.metric_values());
        conn.prepare_cached(&sql)?
            .execute(rusqlite::params_from_iter(values))?;
        Ok(())
    }

    pub fn load_latest(conn: &Connection) -> Result<Option<Self>> {
        Ok(conn
            .query_row(
                "SELECT * FROM global_snapshots ORDER BY round DESC LIMIT 1",
                [],
                Self::from_row,
            )
            .optional()?)
    }

    pub fn load_at(conn: &Connection, round: i64) -> Result<Option<Self>> {
        Ok(conn
            .query_row("SELECT * FROM global_snapshots WHERE round = ?1", [round], Self::from_row)
            .optional()?)
    }

    /// Round of the newest committed snapshot
    pub fn last_round(conn: &Connection) -> Result<Option<i64>> {
        Ok(conn.query_row("SELECT MAX(round) FROM global_snapshots", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_delta_arithmetic() {
        let a = GlobalDelta { blobber_count: 2, total_staked: 100, ..Default::default() };
        let b = GlobalDelta { blobber_count: 1, total_staked: 30, ..Default::default() };
        let d = a - b;
        assert_eq!(d.blobber_count, 1);
        assert_eq!(d.total_staked, 70);
        assert_eq!((-d).total_staked, -70);
        assert!((d - d).is_zero());
    }

    #[test]
    fn test_next_clamps_staked_storage() {
        let delta = GlobalDelta {
            staked_storage: 500,
            max_capacity_storage: 200,
            ..Default::default()
        };
        let snap = GlobalSnapshot::next(None, 3, &delta);
        assert_eq!(snap.staked_storage, 200);
        assert_eq!(snap.round, 3);
    }

    #[test]
    fn test_save_and_load() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        assert_eq!(GlobalSnapshot::last_round(conn).unwrap(), None);

        let first = GlobalSnapshot::next(None, 1, &GlobalDelta { total_mint: 1000, zcn_supply: 1000, ..Default::default() });
        first.save(conn).unwrap();
        let second = GlobalSnapshot::next(Some(&first), 2, &GlobalDelta { zcn_supply: -300, ..Default::default() });
        second.save(conn).unwrap();

        let latest = GlobalSnapshot::load_latest(conn).unwrap().unwrap();
        assert_eq!(latest.round, 2);
        assert_eq!(latest.total_mint, 1000);
        assert_eq!(latest.zcn_supply, 700);
        assert_eq!(GlobalSnapshot::load_at(conn, 1).unwrap().unwrap().zcn_supply, 1000);
        assert_eq!(GlobalSnapshot::last_round(conn).unwrap(), Some(2));
    }
}
