//! Rolling round-range partitions for aggregate tables
//!
//! Aggregates for kind `k` live in physical tables `<k>_aggregates_<n>`, each
//! holding rounds `[n * P, (n + 1) * P)`. The `aggregate_partitions` registry
//! records every partition with its range and schema (`main` or the attached
//! slow tablespace). Readers union the registered partitions.
//!
//! Every operation checks the registry first, so calling them repeatedly for
//! the same round is a no-op. Retention runs once per partition index and kind;
//! `partition_retention` records the last index it ran for, so a pipeline that
//! starts or resumes past a boundary round still retires old partitions.

use super::{now, SLOW_SCHEMA};
use crate::aggregation::aggregate_columns_ddl;
use crate::error::Result;
use crate::provider::ProviderKind;
use rusqlite::{params, Connection, OptionalExtension};

/// Bytes per row assumed when page statistics are unavailable
const ESTIMATED_ROW_BYTES: i64 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub table_name: String,
    pub kind: ProviderKind,
    pub partition_index: i64,
    pub from_round: i64,
    pub to_round: i64,
    pub schema_name: String,
}

impl PartitionInfo {
    /// `schema.table` for use in SQL
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }
}

/// What one `on_round` call changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub created: Vec<String>,
    pub dropped: Vec<String>,
    pub moved: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionManager {
    change_period: i64,
    keep_count: i64,
    max_table_size: i64,
    slow_enabled: bool,
}

impl PartitionManager {
    pub fn new(change_period: i64, keep_count: i64, max_table_size: i64, slow_enabled: bool) -> Self {
        Self {
            change_period: change_period.max(1),
            keep_count: keep_count.max(1),
            max_table_size,
            slow_enabled,
        }
    }

    pub fn partition_index(&self, round: i64) -> i64 {
        round / self.change_period
    }

    pub fn table_name(kind: ProviderKind, index: i64) -> String {
        format!("{}_{}", kind.aggregate_table(), index)
    }

    /// Create the partition holding `round` if missing; returns its qualified name
    pub fn ensure_partition(&self, conn: &Connection, kind: ProviderKind, round: i64) -> Result<String> {
        Ok(self.ensure_index(conn, kind, self.partition_index(round))?.0)
    }

    fn ensure_index(&self, conn: &Connection, kind: ProviderKind, index: i64) -> Result<(String, bool)> {
        let name = Self::table_name(kind, index);
        let schema: Option<String> = conn
            .query_row(
                "SELECT schema_name FROM aggregate_partitions WHERE table_name = ?1",
                [&name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(schema) = schema {
            return Ok((format!("{}.{}", schema, name), false));
        }

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS main.{} ({})",
            name,
            aggregate_columns_ddl(kind)
        ))?;
        conn.execute(
            "INSERT INTO aggregate_partitions (table_name, kind, partition_index, from_round, to_round, schema_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'main', ?6)",
            params![
                name,
                kind.as_str(),
                index,
                index * self.change_period,
                (index + 1) * self.change_period,
                now()
            ],
        )?;
        log::info!("🧱 Created partition {} (rounds {}..{})", name, index * self.change_period, (index + 1) * self.change_period);
        Ok((format!("main.{}", name), true))
    }

    /// Round hook: keep the current and next partitions ready and, the first
    /// time a partition index is reached, retire old partitions
    pub fn on_round(&self, conn: &Connection, round: i64) -> Result<PartitionReport> {
        let mut report = PartitionReport::default();
        let current = self.partition_index(round);

        for kind in ProviderKind::ALL {
            for index in [current, current + 1] {
                let (name, created) = self.ensure_index(conn, kind, index)?;
                if created {
                    report.created.push(name);
                }
            }
        }

        for kind in ProviderKind::ALL {
            if retained_index(conn, kind)?.is_some_and(|last| last >= current) {
                continue;
            }
            report.dropped.extend(self.drop_expired(conn, kind, current)?);
            report.moved.extend(self.move_oversized(conn, kind, current)?);
            conn.execute(
                "INSERT INTO partition_retention (kind, partition_index, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind) DO UPDATE SET
                     partition_index = excluded.partition_index,
                     updated_at = excluded.updated_at",
                params![kind.as_str(), current, now()],
            )?;
        }
        Ok(report)
    }

    /// Drop partitions with index <= current - keep_count
    pub fn drop_expired(&self, conn: &Connection, kind: ProviderKind, current: i64) -> Result<Vec<String>> {
        let cutoff = current - self.keep_count;
        let expired: Vec<PartitionInfo> = registered(conn, kind)?
            .into_iter()
            .filter(|p| p.partition_index <= cutoff)
            .collect();

        let mut dropped = Vec::new();
        for p in expired {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", p.qualified()))?;
            conn.execute("DELETE FROM aggregate_partitions WHERE table_name = ?1", [&p.table_name])?;
            log::info!("🗑️  Dropped partition {}", p.qualified());
            dropped.push(p.table_name);
        }
        Ok(dropped)
    }

    /// Move closed partitions over the size threshold to the slow tablespace
    pub fn move_oversized(&self, conn: &Connection, kind: ProviderKind, current: i64) -> Result<Vec<String>> {
        if !self.slow_enabled {
            return Ok(Vec::new());
        }

        let candidates: Vec<PartitionInfo> = registered(conn, kind)?
            .into_iter()
            .filter(|p| p.schema_name == "main" && p.partition_index < current)
            .collect();

        let mut moved = Vec::new();
        for p in candidates {
            let size = table_size(conn, &p.table_name)?;
            if size <= self.max_table_size {
                continue;
            }
            let name = &p.table_name;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {slow}.{name} ({ddl});
                 INSERT OR IGNORE INTO {slow}.{name} SELECT * FROM main.{name};
                 DROP TABLE main.{name};",
                slow = SLOW_SCHEMA,
                ddl = aggregate_columns_ddl(kind),
            ))?;
            conn.execute(
                "UPDATE aggregate_partitions SET schema_name = ?1 WHERE table_name = ?2",
                params![SLOW_SCHEMA, name],
            )?;
            log::info!("📦 Moved partition {} ({} bytes) to {}", name, size, SLOW_SCHEMA);
            moved.push(name.clone());
        }
        Ok(moved)
    }
}

/// Partition index retention last ran for
fn retained_index(conn: &Connection, kind: ProviderKind) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT partition_index FROM partition_retention WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

/// Registered partitions of a kind, oldest first
pub fn registered(conn: &Connection, kind: ProviderKind) -> Result<Vec<PartitionInfo>> {
    let mut stmt = conn.prepare_cached(
        "SELECT table_name, partition_index, from_round, to_round, schema_name
         FROM aggregate_partitions WHERE kind = ?1 ORDER BY partition_index",
    )?;
    let rows = stmt.query_map([kind.as_str()], |row| {
        Ok(PartitionInfo {
            table_name: row.get(0)?,
            kind,
            partition_index: row.get(1)?,
            from_round: row.get(2)?,
            to_round: row.get(3)?,
            schema_name: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Registered partitions of a kind overlapping `[from_round, to_round]`
pub fn overlapping(conn: &Connection, kind: ProviderKind, from_round: i64, to_round: i64) -> Result<Vec<PartitionInfo>> {
    Ok(registered(conn, kind)?
        .into_iter()
        .filter(|p| p.from_round <= to_round && p.to_round > from_round)
        .collect())
}

/// Bytes used by a `main` table, from page statistics when available
pub fn table_size(conn: &Connection, table: &str) -> Result<i64> {
    let pages: rusqlite::Result<Option<i64>> = conn.query_row(
        "SELECT SUM(pgsize) FROM dbstat WHERE name = ?1 AND schema = 'main'",
        [table],
        |row| row.get(0),
    );
    match pages {
        Ok(Some(bytes)) => Ok(bytes),
        _ => {
            let rows: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM main.{}", table), [], |row| row.get(0))?;
            Ok(rows * ESTIMATED_ROW_BYTES)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use tempfile::TempDir;

    fn table_exists(conn: &Connection, schema: &str, name: &str) -> bool {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1", schema),
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn test_on_round_idempotent() {
        // Test: the same round twice creates partitions once
        let store = Store::open_in_memory().unwrap();
        let manager = PartitionManager::new(100, 10, i64::MAX, false);

        let first = manager.on_round(store.conn(), 250).unwrap();
        assert_eq!(first.created.len(), 10);
        let second = manager.on_round(store.conn(), 250).unwrap();
        assert!(second.created.is_empty());

        assert!(table_exists(store.conn(), "main", "blobber_aggregates_2"));
        assert!(table_exists(store.conn(), "main", "miner_aggregates_3"));
        assert_eq!(
            manager.ensure_partition(store.conn(), ProviderKind::Blobber, 299).unwrap(),
            "main.blobber_aggregates_2"
        );
    }

    #[test]
    fn test_drop_expired_partitions() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let manager = PartitionManager::new(10, 2, i64::MAX, false);
        for round in [0, 10, 20, 30, 40] {
            manager.on_round(conn, round).unwrap();
        }

        // current = 4, keep 2 => indexes <= 2 dropped
        let kept: Vec<i64> = registered(conn, ProviderKind::Validator)
            .unwrap()
            .iter()
            .map(|p| p.partition_index)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert!(!table_exists(conn, "main", "validator_aggregates_1"));
    }

    #[test]
    fn test_retention_runs_without_boundary_round() {
        // Test: no processed round is a multiple of the period
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let manager = PartitionManager::new(10, 2, i64::MAX, false);
        for round in [5, 15, 25] {
            manager.on_round(conn, round).unwrap();
        }

        // Round 25 already retired index 0; resumed at 37 (index 3) retires index 1
        let report = manager.on_round(conn, 37).unwrap();
        assert_eq!(report.dropped.len(), ProviderKind::ALL.len());
        let kept: Vec<i64> = registered(conn, ProviderKind::Miner)
            .unwrap()
            .iter()
            .map(|p| p.partition_index)
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);

        // Test: later rounds of the same partition do not rerun retention
        let again = manager.on_round(conn, 38).unwrap();
        assert!(again.dropped.is_empty());
        assert_eq!(retained_index(conn, ProviderKind::Miner).unwrap(), Some(3));
    }

    #[test]
    fn test_move_oversized_to_slow() {
        let dir = TempDir::new().unwrap();
        let slow = dir.path().join("slow.db");
        let options = StoreOptions {
            slow_tablespace: Some(slow.to_str().unwrap().to_string()),
            ..Default::default()
        };
        let store = Store::open_in_memory_with(&options).unwrap();
        let conn = store.conn();
        let manager = PartitionManager::new(10, 100, 0, true);

        let table = manager.ensure_partition(conn, ProviderKind::Validator, 5).unwrap();
        conn.execute(
            &format!("INSERT INTO {} (provider_id, round, bucket_id) VALUES ('v1', 5, 0)", table),
            [],
        )
        .unwrap();

        let moved = manager.move_oversized(conn, ProviderKind::Validator, 1).unwrap();
        assert_eq!(moved, vec!["validator_aggregates_0".to_string()]);
        assert!(table_exists(conn, SLOW_SCHEMA, "validator_aggregates_0"));
        assert!(!table_exists(conn, "main", "validator_aggregates_0"));

        let parts = overlapping(conn, ProviderKind::Validator, 0, 9).unwrap();
        assert_eq!(parts[0].qualified(), "slow.validator_aggregates_0");
        let rows: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", parts[0].qualified()), [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
