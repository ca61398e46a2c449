//! Per-user running totals
//!
//! Every round in which a user's read pool, write pool, stake, paid fees or
//! collected rewards change gets one row holding that user's totals as of the
//! round. Users never seen before start from zero, so an unlock can leave a
//! negative total.

use super::now;
use crate::error::{IndexerError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const UPSERT: &str = "INSERT INTO user_aggregates (
        user_id, round, collected_reward, total_stake, read_pool_total, write_pool_total, payed_fees, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(user_id, round) DO UPDATE SET
        collected_reward = excluded.collected_reward,
        total_stake = excluded.total_stake,
        read_pool_total = excluded.read_pool_total,
        write_pool_total = excluded.write_pool_total,
        payed_fees = excluded.payed_fees,
        created_at = excluded.created_at";

const SELECT: &str = "SELECT user_id, round, collected_reward, total_stake, read_pool_total, write_pool_total,
        payed_fees, created_at
    FROM user_aggregates";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTotalKind {
    CollectedReward,
    TotalStake,
    ReadPoolTotal,
    WritePoolTotal,
    PayedFees,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub user_id: String,
    pub round: i64,
    pub collected_reward: i64,
    pub total_stake: i64,
    pub read_pool_total: i64,
    pub write_pool_total: i64,
    pub payed_fees: i64,
    #[serde(default)]
    pub created_at: i64,
}

impl UserAggregate {
    fn add(&mut self, kind: UserTotalKind, amount: i64) {
        let total = match kind {
            UserTotalKind::CollectedReward => &mut self.collected_reward,
            UserTotalKind::TotalStake => &mut self.total_stake,
            UserTotalKind::ReadPoolTotal => &mut self.read_pool_total,
            UserTotalKind::WritePoolTotal => &mut self.write_pool_total,
            UserTotalKind::PayedFees => &mut self.payed_fees,
        };
        *total += amount;
    }

    fn absorb(&mut self, delta: &UserAggregate) {
        self.collected_reward += delta.collected_reward;
        self.total_stake += delta.total_stake;
        self.read_pool_total += delta.read_pool_total;
        self.write_pool_total += delta.write_pool_total;
        self.payed_fees += delta.payed_fees;
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            round: row.get(1)?,
            collected_reward: row.get(2)?,
            total_stake: row.get(3)?,
            read_pool_total: row.get(4)?,
            write_pool_total: row.get(5)?,
            payed_fees: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// Per-user deltas gathered while one block is dispatched
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserAggregateBatch {
    deltas: BTreeMap<String, UserAggregate>,
}

impl UserAggregateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, user_id: &str, kind: UserTotalKind, amount: i64) {
        self.deltas
            .entry(user_id.to_string())
            .or_insert_with(|| UserAggregate {
                user_id: user_id.to_string(),
                ..Default::default()
            })
            .add(kind, amount);
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Write one row per touched user for `round`: the user's totals as of
    /// `round` plus this batch's deltas
    pub fn save(&self, conn: &Connection, round: i64) -> Result<usize> {
        if self.deltas.is_empty() {
            return Ok(0);
        }

        let mut stmt = conn.prepare_cached(UPSERT)?;
        let ts = now();
        for (user_id, delta) in &self.deltas {
            let mut totals = at_round(conn, user_id, round)?.unwrap_or_default();
            totals.absorb(delta);
            stmt.execute(params![
                user_id,
                round,
                totals.collected_reward,
                totals.total_stake,
                totals.read_pool_total,
                totals.write_pool_total,
                totals.payed_fees,
                ts
            ])
            .map_err(IndexerError::upsert("user_aggregates"))?;
        }

        log::debug!("   ├─ {} user aggregates written for round {}", self.deltas.len(), round);
        Ok(self.deltas.len())
    }
}

/// The user's newest totals at or before `round`
pub fn at_round(conn: &Connection, user_id: &str, round: i64) -> Result<Option<UserAggregate>> {
    let sql = format!("{SELECT} WHERE user_id = ?1 AND round <= ?2 ORDER BY round DESC LIMIT 1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![user_id, round], UserAggregate::from_row)
        .optional()?)
}

pub fn latest(conn: &Connection, user_id: &str) -> Result<Option<UserAggregate>> {
    at_round(conn, user_id, i64::MAX)
}

/// Newest totals of every user, ordered by user id
pub fn latest_all(conn: &Connection) -> Result<Vec<UserAggregate>> {
    let sql = format!(
        "{SELECT} WHERE (user_id, round) IN (SELECT user_id, MAX(round) FROM user_aggregates GROUP BY user_id)
         ORDER BY user_id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([], UserAggregate::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// One user's rows in `[from_round, to_round]`, oldest first
pub fn in_range(conn: &Connection, user_id: &str, from_round: i64, to_round: i64) -> Result<Vec<UserAggregate>> {
    let sql = format!("{SELECT} WHERE user_id = ?1 AND round BETWEEN ?2 AND ?3 ORDER BY round");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![user_id, from_round, to_round], UserAggregate::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_totals_carry_across_rounds() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let mut first = UserAggregateBatch::new();
        first.add("u1", UserTotalKind::ReadPoolTotal, 10);
        first.add("u1", UserTotalKind::PayedFees, 3);
        first.add("u2", UserTotalKind::TotalStake, 7);
        assert_eq!(first.save(conn, 1).unwrap(), 2);

        let mut second = UserAggregateBatch::new();
        second.add("u1", UserTotalKind::ReadPoolTotal, -4);
        second.add("u1", UserTotalKind::CollectedReward, 6);
        second.save(conn, 3).unwrap();

        let u1 = latest(conn, "u1").unwrap().unwrap();
        assert_eq!(u1.round, 3);
        assert_eq!(u1.read_pool_total, 6);
        assert_eq!(u1.payed_fees, 3);
        assert_eq!(u1.collected_reward, 6);

        // Test: history keeps the earlier row untouched
        let history = in_range(conn, "u1", 0, 10).unwrap();
        let rounds: Vec<(i64, i64)> = history.iter().map(|a| (a.round, a.read_pool_total)).collect();
        assert_eq!(rounds, vec![(1, 10), (3, 6)]);
        assert_eq!(at_round(conn, "u1", 2).unwrap().unwrap().round, 1);

        let all = latest_all(conn).unwrap();
        let users: Vec<(&str, i64)> = all.iter().map(|a| (a.user_id.as_str(), a.round)).collect();
        assert_eq!(users, vec![("u1", 3), ("u2", 1)]);
    }

    #[test]
    fn test_unlock_for_unseen_user_goes_negative() {
        let store = Store::open_in_memory().unwrap();
        let mut batch = UserAggregateBatch::new();
        batch.add("u9", UserTotalKind::WritePoolTotal, -5);
        batch.save(store.conn(), 4).unwrap();

        let u9 = latest(store.conn(), "u9").unwrap().unwrap();
        assert_eq!(u9.write_pool_total, -5);
        assert_eq!(u9.total_stake, 0);
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(UserAggregateBatch::new().save(store.conn(), 1).unwrap(), 0);
        assert!(latest_all(store.conn()).unwrap().is_empty());
    }
}
