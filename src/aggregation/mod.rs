//! Per-provider snapshot and aggregate engine
//!
//! Every provider has a bucket (`bucket_id = id mod aggregate_period`). At
//! round `r` only the bucket `r mod aggregate_period` is processed, so each
//! provider is visited once per period and the cost is spread evenly.
//!
//! For each visited provider:
//! 1. load the current row and the previous snapshot
//! 2. if online, insert one aggregate row: `(prev + curr) / 2` for gauges,
//!    the current value for running totals
//! 3. upsert the snapshot with the current values
//! 4. add `contribution(curr) - contribution(prev)` to the global delta
//!
//! A provider's contribution is what it adds to the global metrics while it
//! is online (count, stake, rewards, capacity...). Offline providers
//! contribute nothing, so killing or shutting one down removes it from the
//! network totals at its next bucket round. Registration seeds a snapshot and
//! applies its contribution immediately.

pub mod authorizer;
pub mod blobber;
pub mod global;
pub mod node;
pub mod validator;

pub use authorizer::AuthorizerSnapshot;
pub use blobber::BlobberSnapshot;
pub use global::{GlobalDelta, GlobalSnapshot};
pub use node::{MinerSnapshot, SharderSnapshot};
pub use validator::ValidatorSnapshot;

use crate::error::{is_constraint_violation, IndexerError, Result};
use crate::provider::{Provider, ProviderKind};
use crate::store::{json_ids, PartitionManager};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::collections::{HashMap, HashSet};

/// Outer/inner paging plan for one aggregation round.
///
/// `count` items split into `page_amount` pages of `size` items; the page for
/// `round` is `round mod page_amount`, processed in `subpages` batches of at
/// most `page_limit`.
pub fn paginate(round: i64, page_amount: i64, count: i64, page_limit: i64) -> (i64, i64, i64) {
    let page_amount = page_amount.max(1);
    let page_limit = page_limit.max(1);
    let size = (count + page_amount - 1) / page_amount;
    let current = round % page_amount;
    let subpages = if size > page_limit {
        (size + page_limit - 1) / page_limit
    } else {
        1
    };
    (size, current, subpages)
}

/// Columns shared by every snapshot table (and by the current-state select)
pub const BASE_COLUMNS: &[&str] = &[
    "provider_id",
    "bucket_id",
    "round",
    "unstake_total",
    "total_stake",
    "service_charge",
    "total_rewards",
    "downtime",
    "creation_round",
    "is_killed",
    "is_shutdown",
];

/// Aggregate columns shared by every kind, after `provider_id, round, bucket_id`
const BASE_AGGREGATE_COLUMNS: &[(&str, &str)] = &[
    ("total_stake", "INTEGER"),
    ("unstake_total", "INTEGER"),
    ("service_charge", "REAL"),
    ("total_rewards", "INTEGER"),
    ("downtime", "INTEGER"),
];

/// Snapshot state common to all provider kinds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotBase {
    pub provider_id: String,
    pub bucket_id: i64,
    pub round: i64,
    pub unstake_total: i64,
    pub total_stake: i64,
    pub service_charge: f64,
    pub total_rewards: i64,
    pub downtime: i64,
    pub creation_round: i64,
    pub is_killed: bool,
    pub is_shutdown: bool,
}

impl SnapshotBase {
    /// Reads `BASE_COLUMNS` from the start of the row
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            provider_id: row.get(0)?,
            bucket_id: row.get(1)?,
            round: row.get(2)?,
            unstake_total: row.get(3)?,
            total_stake: row.get(4)?,
            service_charge: row.get(5)?,
            total_rewards: row.get(6)?,
            downtime: row.get(7)?,
            creation_round: row.get(8)?,
            is_killed: row.get(9)?,
            is_shutdown: row.get(10)?,
        })
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::Text(self.provider_id.clone()),
            Value::Integer(self.bucket_id),
            Value::Integer(self.round),
            Value::Integer(self.unstake_total),
            Value::Integer(self.total_stake),
            Value::Real(self.service_charge),
            Value::Integer(self.total_rewards),
            Value::Integer(self.downtime),
            Value::Integer(self.creation_round),
            Value::Integer(self.is_killed as i64),
            Value::Integer(self.is_shutdown as i64),
        ]
    }

    fn aggregate_values(prev: &Self, curr: &Self) -> Vec<Value> {
        vec![
            Value::Integer(avg(prev.total_stake, curr.total_stake)),
            Value::Integer(avg(prev.unstake_total, curr.unstake_total)),
            Value::Real((prev.service_charge + curr.service_charge) / 2.0),
            Value::Integer(curr.total_rewards),
            Value::Integer(curr.downtime),
        ]
    }
}

/// `(prev + curr) / 2` without overflow
pub fn avg(prev: i64, curr: i64) -> i64 {
    ((prev as i128 + curr as i128) / 2) as i64
}

/// Per-kind snapshot: the state a provider is aggregated from.
///
/// The same column layout is read from the provider table (current state)
/// and from the snapshot table (previous state): `BASE_COLUMNS` followed by
/// `EXTRA_COLUMNS`.
pub trait ProviderSnapshot: Provider + Clone + Sized {
    const KIND: ProviderKind;
    /// Kind-specific columns, present under the same name in the provider
    /// table and the snapshot table
    const EXTRA_COLUMNS: &'static [&'static str];
    /// Kind-specific aggregate columns with their SQL types
    const AGGREGATE_COLUMNS: &'static [(&'static str, &'static str)];

    fn base(&self) -> &SnapshotBase;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    /// Values for `EXTRA_COLUMNS`
    fn extra_values(&self) -> Vec<Value>;
    /// Values for `AGGREGATE_COLUMNS`
    fn aggregate_values(prev: &Self, curr: &Self) -> Vec<Value>;
    /// Contribution to the global metrics while online
    fn online_contribution(&self) -> GlobalDelta;

    fn contribution(&self) -> GlobalDelta {
        if self.is_offline() {
            GlobalDelta::default()
        } else {
            self.online_contribution()
        }
    }
}

macro_rules! impl_provider {
    ($snapshot:ty) => {
        impl $crate::provider::Provider for $snapshot {
            fn id(&self) -> &str {
                &self.base.provider_id
            }
            fn bucket_id(&self) -> i64 {
                self.base.bucket_id
            }
            fn total_stake(&self) -> i64 {
                self.base.total_stake
            }
            fn service_charge(&self) -> f64 {
                self.base.service_charge
            }
            fn total_rewards(&self) -> i64 {
                self.base.total_rewards
            }
            fn is_killed(&self) -> bool {
                self.base.is_killed
            }
            fn is_shutdown(&self) -> bool {
                self.base.is_shutdown
            }
        }
    };
}
pub(crate) use impl_provider;

fn snapshot_columns<S: ProviderSnapshot>() -> Vec<&'static str> {
    BASE_COLUMNS.iter().chain(S::EXTRA_COLUMNS).copied().collect()
}

/// Current provider state shaped like a snapshot taken at `round`
pub fn load_current<S: ProviderSnapshot>(conn: &Connection, ids: &[String], round: i64) -> Result<Vec<S>> {
    let extras: String = S::EXTRA_COLUMNS.iter().map(|c| format!(", p.{}", c)).collect();
    let sql = format!(
        "SELECT p.id, p.bucket_id, ?1, p.unstake_total, p.total_stake, p.service_charge,
                COALESCE(r.total_rewards, 0), p.downtime, p.creation_round, p.is_killed, p.is_shutdown{extras}
         FROM {table} p
         LEFT JOIN provider_rewards r ON r.provider_id = p.id
         WHERE p.id IN (SELECT value FROM json_each(?2))
         ORDER BY p.id",
        table = S::KIND.table(),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(rusqlite::params![round, json_ids(ids)], S::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Previous snapshots keyed by provider id
pub fn load_snapshots<S: ProviderSnapshot>(conn: &Connection, ids: &[String]) -> Result<HashMap<String, S>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE provider_id IN (SELECT value FROM json_each(?1))",
        snapshot_columns::<S>().join(", "),
        S::KIND.snapshot_table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([json_ids(ids)], S::from_row)?;
    let mut out = HashMap::new();
    for row in rows {
        let snapshot = row?;
        out.insert(snapshot.id().to_string(), snapshot);
    }
    Ok(out)
}

pub fn load_snapshot<S: ProviderSnapshot>(conn: &Connection, id: &str) -> Result<Option<S>> {
    Ok(load_snapshots::<S>(conn, &[id.to_string()])?.remove(id))
}

pub fn save_snapshot<S: ProviderSnapshot>(conn: &Connection, snapshot: &S) -> Result<()> {
    let columns = snapshot_columns::<S>();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(provider_id) DO UPDATE SET {}",
        S::KIND.snapshot_table(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );

    let mut values = snapshot.base().values();
    values.extend(snapshot.extra_values());
    conn.prepare_cached(&sql)?
        .execute(params_from_iter(values))
        .map_err(IndexerError::upsert(S::KIND.snapshot_table()))?;
    Ok(())
}

fn delete_snapshot<S: ProviderSnapshot>(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE provider_id = ?1", S::KIND.snapshot_table()),
        [id],
    )?;
    Ok(())
}

/// Insert the aggregate row for `curr`; a second row for the same
/// `(provider, round)` is an invariant violation
pub fn insert_aggregate<S: ProviderSnapshot>(conn: &Connection, table: &str, prev: &S, curr: &S) -> Result<()> {
    let names: Vec<&str> = ["provider_id", "round", "bucket_id"]
        .into_iter()
        .chain(BASE_AGGREGATE_COLUMNS.iter().map(|(n, _)| *n))
        .chain(S::AGGREGATE_COLUMNS.iter().map(|(n, _)| *n))
        .collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        names.join(", "),
        placeholders.join(", ")
    );

    let base = curr.base();
    let mut values = vec![
        Value::Text(base.provider_id.clone()),
        Value::Integer(base.round),
        Value::Integer(base.bucket_id),
    ];
    values.extend(SnapshotBase::aggregate_values(prev.base(), base));
    values.extend(S::aggregate_values(prev, curr));

    conn.prepare_cached(&sql)?
        .execute(params_from_iter(values))
        .map_err(|e| {
            if is_constraint_violation(&e) {
                IndexerError::InvariantViolation(format!(
                    "aggregate for ({}, {}) already exists in {}",
                    base.provider_id, base.round, table
                ))
            } else {
                IndexerError::from(e)
            }
        })?;
    Ok(())
}

/// Column definitions of an aggregate partition table
pub fn aggregate_columns_ddl(kind: ProviderKind) -> String {
    match kind {
        ProviderKind::Blobber => ddl_for::<BlobberSnapshot>(),
        ProviderKind::Miner => ddl_for::<MinerSnapshot>(),
        ProviderKind::Sharder => ddl_for::<SharderSnapshot>(),
        ProviderKind::Validator => ddl_for::<ValidatorSnapshot>(),
        ProviderKind::Authorizer => ddl_for::<AuthorizerSnapshot>(),
    }
}

fn ddl_for<S: ProviderSnapshot>() -> String {
    let mut columns = vec![
        "provider_id TEXT NOT NULL".to_string(),
        "round INTEGER NOT NULL".to_string(),
        "bucket_id INTEGER NOT NULL".to_string(),
    ];
    for (name, ty) in BASE_AGGREGATE_COLUMNS.iter().chain(S::AGGREGATE_COLUMNS) {
        columns.push(format!("{} {} NOT NULL DEFAULT 0", name, ty));
    }
    columns.push("PRIMARY KEY (provider_id, round)".to_string());
    columns.join(", ")
}

/// Seed baseline snapshots for newly registered providers and return the
/// contribution they add to the global metrics
pub fn seed_snapshots<S: ProviderSnapshot>(conn: &Connection, ids: &[String], round: i64) -> Result<GlobalDelta> {
    let existing = load_snapshots::<S>(conn, ids)?;
    let mut delta = GlobalDelta::default();
    for curr in load_current::<S>(conn, ids, round)? {
        if existing.contains_key(curr.id()) {
            continue;
        }
        save_snapshot(conn, &curr)?;
        delta += curr.contribution();
    }
    Ok(delta)
}

pub fn seed(conn: &Connection, kind: ProviderKind, ids: &[String], round: i64) -> Result<GlobalDelta> {
    match kind {
        ProviderKind::Blobber => seed_snapshots::<BlobberSnapshot>(conn, ids, round),
        ProviderKind::Miner => seed_snapshots::<MinerSnapshot>(conn, ids, round),
        ProviderKind::Sharder => seed_snapshots::<SharderSnapshot>(conn, ids, round),
        ProviderKind::Validator => seed_snapshots::<ValidatorSnapshot>(conn, ids, round),
        ProviderKind::Authorizer => seed_snapshots::<AuthorizerSnapshot>(conn, ids, round),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationSettings {
    pub aggregate_period: i64,
    pub page_limit: i64,
}

/// Result of aggregating one kind for one round
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KindSummary {
    pub processed: usize,
    pub aggregates: usize,
    pub removed: usize,
    pub delta: GlobalDelta,
}

/// Ids in the bucket: live providers plus snapshots whose provider is gone
fn bucket_ids<S: ProviderSnapshot>(conn: &Connection, bucket: i64) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT id FROM {table} WHERE bucket_id = ?1
         UNION
         SELECT provider_id FROM {snapshots} WHERE bucket_id = ?1
         ORDER BY 1",
        table = S::KIND.table(),
        snapshots = S::KIND.snapshot_table(),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([bucket], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
}

/// Aggregate one provider kind for `round`
pub fn aggregate_kind<S: ProviderSnapshot>(
    conn: &Connection,
    round: i64,
    settings: &AggregationSettings,
    partitions: &PartitionManager,
) -> Result<KindSummary> {
    let period = settings.aggregate_period.max(1);
    let bucket = round % period;
    let ids = bucket_ids::<S>(conn, bucket)?;
    let mut summary = KindSummary::default();
    if ids.is_empty() {
        return Ok(summary);
    }

    // The bucket is one page of `ids.len()` providers out of `period` pages
    let (size, page, subpages) = paginate(round, period, ids.len() as i64 * period, settings.page_limit);
    debug_assert_eq!(page, bucket);
    log::debug!(
        "   ├─ {} bucket {}: {} providers in {} batches",
        S::KIND,
        page,
        size,
        subpages
    );

    let table = partitions.ensure_partition(conn, S::KIND, round)?;
    let limit = settings.page_limit.max(1) as usize;

    for sub in 0..subpages as usize {
        let start = sub * limit;
        if start >= ids.len() {
            break;
        }
        let batch = &ids[start..(start + limit).min(ids.len())];

        let mut previous = load_snapshots::<S>(conn, batch)?;
        let current = load_current::<S>(conn, batch, round)?;
        let live: HashSet<&str> = current.iter().map(|c| c.id()).collect();

        for id in batch {
            if live.contains(id.as_str()) {
                continue;
            }
            if let Some(gone) = previous.remove(id) {
                summary.delta -= gone.contribution();
                delete_snapshot::<S>(conn, id)?;
                summary.removed += 1;
            }
        }

        for curr in &current {
            let prev = previous.remove(curr.id());
            let baseline = prev.as_ref().unwrap_or(curr);
            if !curr.is_offline() {
                insert_aggregate(conn, &table, baseline, curr)?;
                summary.aggregates += 1;
            }
            save_snapshot(conn, curr)?;

            summary.delta += curr.contribution();
            if let Some(prev) = &prev {
                summary.delta -= prev.contribution();
            }
            summary.processed += 1;
        }
    }

    Ok(summary)
}

/// Aggregate every provider kind for `round`; returns the summed delta
pub fn aggregate_round(
    conn: &Connection,
    round: i64,
    settings: &AggregationSettings,
    partitions: &PartitionManager,
) -> Result<GlobalDelta> {
    let summaries = [
        aggregate_kind::<BlobberSnapshot>(conn, round, settings, partitions)?,
        aggregate_kind::<MinerSnapshot>(conn, round, settings, partitions)?,
        aggregate_kind::<SharderSnapshot>(conn, round, settings, partitions)?,
        aggregate_kind::<ValidatorSnapshot>(conn, round, settings, partitions)?,
        aggregate_kind::<AuthorizerSnapshot>(conn, round, settings, partitions)?,
    ];

    let mut delta = GlobalDelta::default();
    let (mut processed, mut aggregates, mut removed) = (0, 0, 0);
    for s in &summaries {
        delta += s.delta;
        processed += s.processed;
        aggregates += s.aggregates;
        removed += s.removed;
    }
    if processed > 0 || removed > 0 {
        log::debug!(
            "   └─ Round {}: {} snapshots, {} aggregates, {} removed",
            round,
            processed,
            aggregates,
            removed
        );
    }
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_vectors() {
        assert_eq!(paginate(13, 7, 68, 50), (10, 6, 1));
        assert_eq!(paginate(13, 7, 695, 50), (100, 6, 2));
        assert_eq!(paginate(1, 7, 7, 50), (1, 1, 1));
        assert_eq!(paginate(13, 7, 650, 50), (93, 6, 2));
        assert_eq!(paginate(12, 7, 650, 50), (93, 5, 2));
    }

    #[test]
    fn test_paginate_degenerate_inputs() {
        assert_eq!(paginate(5, 0, 0, 0), (0, 0, 1));
        assert_eq!(paginate(5, 10, 1000, 1), (100, 5, 100));
    }

    #[test]
    fn test_avg_does_not_overflow() {
        assert_eq!(avg(i64::MAX, i64::MAX), i64::MAX);
        assert_eq!(avg(3, 4), 3);
        assert_eq!(avg(-3, 1), -1);
    }

    #[test]
    fn test_ddl_includes_kind_columns() {
        let ddl = aggregate_columns_ddl(ProviderKind::Blobber);
        assert!(ddl.contains("rank_metric REAL"));
        assert!(ddl.contains("PRIMARY KEY (provider_id, round)"));
        assert!(!aggregate_columns_ddl(ProviderKind::Validator).contains("rank_metric"));
    }
}
