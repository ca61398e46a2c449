//! Provider entity writes
//!
//! Registration upserts the whole row (keyed by id). Everything after that is
//! a field-targeted batch update through `BatchUpdate`, so a block touching
//! many providers costs one statement per column set.

use super::batch::BatchUpdate;
use super::{json_ids, now};
use crate::error::{IndexerError, Result};
use crate::events::payloads::{
    Authorizer, Blobber, BlobberAllocatedSaved, BlobberChallenges, BlobberOffers,
    BlobberOpenChallenges, BlobberStat, HealthCheck, Node, ProviderFields, ProviderId, StakeTotal,
    Validator,
};
use crate::provider::{bucket_id, ProviderKind};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeMap;

const COMMON_COLUMNS: &[&str] = &[
    "id",
    "created_at",
    "updated_at",
    "delegate_wallet",
    "min_stake",
    "max_stake",
    "num_delegates",
    "service_charge",
    "unstake_total",
    "total_stake",
    "is_killed",
    "is_shutdown",
    "bucket_id",
    "creation_round",
    "last_health_check",
    "downtime",
];

/// Columns that keep their first value across re-registration
const IMMUTABLE_COLUMNS: &[&str] = &["id", "created_at", "bucket_id", "creation_round"];

/// Boolean provider flags that take a provider offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFlag {
    Killed,
    Shutdown,
}

impl ProviderFlag {
    fn column(&self) -> &'static str {
        match self {
            ProviderFlag::Killed => "is_killed",
            ProviderFlag::Shutdown => "is_shutdown",
        }
    }
}

fn upsert_sql(table: &str, extra: &[&str]) -> String {
    let columns: Vec<&str> = COMMON_COLUMNS.iter().chain(extra.iter()).copied().collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !IMMUTABLE_COLUMNS.contains(c))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

fn common_values(p: &ProviderFields, round: i64, period: i64) -> Vec<Value> {
    let ts = now();
    let creation_round = if p.creation_round > 0 {
        p.creation_round
    } else {
        round
    };
    vec![
        Value::Text(p.id.clone()),
        Value::Integer(ts),
        Value::Integer(ts),
        Value::Text(p.delegate_wallet.clone()),
        Value::Integer(p.min_stake),
        Value::Integer(p.max_stake),
        Value::Integer(p.num_delegates),
        Value::Real(p.service_charge),
        Value::Integer(p.unstake_total),
        Value::Integer(p.total_stake),
        Value::Integer(p.is_killed as i64),
        Value::Integer(p.is_shutdown as i64),
        Value::Integer(bucket_id(&p.id, period)),
        Value::Integer(creation_round),
        Value::Integer(p.last_health_check),
        Value::Integer(p.downtime),
    ]
}

fn upsert_rows(
    conn: &Connection,
    kind: ProviderKind,
    extra: &[&str],
    rows: Vec<Vec<Value>>,
) -> Result<()> {
    let sql = upsert_sql(kind.table(), extra);
    let mut stmt = conn.prepare_cached(&sql)?;
    for row in rows {
        stmt.execute(params_from_iter(row))
            .map_err(IndexerError::upsert(kind.table()))?;
    }
    Ok(())
}

const BLOBBER_COLUMNS: &[&str] = &[
    "base_url",
    "read_price",
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
    "not_available",
];

/// Register or overwrite blobbers; returns their ids
pub fn upsert_blobbers(conn: &Connection, items: &[Blobber], round: i64, period: i64) -> Result<Vec<String>> {
    let rows = items
        .iter()
        .map(|b| {
            let mut v = common_values(&b.provider, round, period);
            let rank = if b.challenges_completed > 0 {
                b.challenges_passed as f64 / b.challenges_completed as f64
            } else {
                0.0
            };
            v.extend([
                Value::Text(b.base_url.clone()),
                Value::Integer(b.read_price),
                Value::Integer(b.write_price),
                Value::Integer(b.capacity),
                Value::Integer(b.allocated),
                Value::Integer(b.saved_data),
                Value::Integer(b.read_data),
                Value::Integer(b.offers_total),
                Value::Integer(b.open_challenges),
                Value::Integer(b.challenges_passed),
                Value::Integer(b.challenges_completed),
                Value::Real(rank),
                Value::Integer(b.not_available as i64),
            ]);
            v
        })
        .collect();
    upsert_rows(conn, ProviderKind::Blobber, BLOBBER_COLUMNS, rows)?;
    Ok(items.iter().map(|b| b.provider.id.clone()).collect())
}

const NODE_COLUMNS: &[&str] = &["n2n_host", "host", "port", "path", "short_name", "build_tag", "fees"];

/// Register or overwrite miners or sharders
pub fn upsert_nodes(
    conn: &Connection,
    kind: ProviderKind,
    items: &[Node],
    round: i64,
    period: i64,
) -> Result<Vec<String>> {
    let rows = items
        .iter()
        .map(|n| {
            let mut v = common_values(&n.provider, round, period);
            v.extend([
                Value::Text(n.n2n_host.clone()),
                Value::Text(n.host.clone()),
                Value::Integer(n.port),
                Value::Text(n.path.clone()),
                Value::Text(n.short_name.clone()),
                Value::Text(n.build_tag.clone()),
                Value::Integer(n.fees),
            ]);
            v
        })
        .collect();
    upsert_rows(conn, kind, NODE_COLUMNS, rows)?;
    Ok(items.iter().map(|n| n.provider.id.clone()).collect())
}

pub fn upsert_validators(
    conn: &Connection,
    items: &[Validator],
    round: i64,
    period: i64,
) -> Result<Vec<String>> {
    let rows = items
        .iter()
        .map(|v| {
            let mut row = common_values(&v.provider, round, period);
            row.extend([
                Value::Text(v.base_url.clone()),
                Value::Text(v.public_key.clone()),
            ]);
            row
        })
        .collect();
    upsert_rows(conn, ProviderKind::Validator, &["base_url", "public_key"], rows)?;
    Ok(items.iter().map(|v| v.provider.id.clone()).collect())
}

pub fn upsert_authorizers(
    conn: &Connection,
    items: &[Authorizer],
    round: i64,
    period: i64,
) -> Result<Vec<String>> {
    let rows = items
        .iter()
        .map(|a| {
            let mut row = common_values(&a.provider, round, period);
            row.extend([
                Value::Text(a.url.clone()),
                Value::Integer(a.fee),
                Value::Integer(a.total_mint),
                Value::Integer(a.total_burn),
            ]);
            row
        })
        .collect();
    upsert_rows(
        conn,
        ProviderKind::Authorizer,
        &["url", "fee", "total_mint", "total_burn"],
        rows,
    )?;
    Ok(items.iter().map(|a| a.provider.id.clone()).collect())
}

/// Stake settings every provider update may change
fn stake_settings(kind: ProviderKind, fields: &[&ProviderFields]) -> BatchUpdate {
    let ts = now();
    BatchUpdate::new(
        kind.table(),
        "id",
        fields.iter().map(|p| p.id.clone()).collect(),
    )
    .set("delegate_wallet", fields.iter().map(|p| p.delegate_wallet.clone()).collect())
    .set("min_stake", fields.iter().map(|p| p.min_stake).collect())
    .set("max_stake", fields.iter().map(|p| p.max_stake).collect())
    .set("num_delegates", fields.iter().map(|p| p.num_delegates).collect())
    .set("service_charge", fields.iter().map(|p| p.service_charge).collect())
    .set_raw(format!("updated_at = {}", ts))
}

/// Fail with NotFound unless every id was updated
fn expect_all(conn: &Connection, kind: ProviderKind, ids: &[String], updated: usize) -> Result<()> {
    if updated >= ids.len() {
        return Ok(());
    }
    for id in ids {
        if !provider_exists(conn, kind, id)? {
            return Err(IndexerError::not_found(kind.as_str(), id.clone()));
        }
    }
    Ok(())
}

/// Update blobber terms and stake settings; every blobber must exist
pub fn update_blobbers(conn: &Connection, items: &[Blobber]) -> Result<()> {
    let ids: Vec<String> = items.iter().map(|b| b.provider.id.clone()).collect();
    let fields: Vec<&ProviderFields> = items.iter().map(|b| &b.provider).collect();
    let updated = stake_settings(ProviderKind::Blobber, &fields)
        .set("base_url", items.iter().map(|b| b.base_url.clone()).collect())
        .set("read_price", items.iter().map(|b| b.read_price).collect())
        .set("write_price", items.iter().map(|b| b.write_price).collect())
        .set("capacity", items.iter().map(|b| b.capacity).collect())
        .set("not_available", items.iter().map(|b| b.not_available).collect())
        .execute(conn)?;
    expect_all(conn, ProviderKind::Blobber, &ids, updated)
}

pub fn update_nodes(conn: &Connection, kind: ProviderKind, items: &[Node]) -> Result<()> {
    let ids: Vec<String> = items.iter().map(|n| n.provider.id.clone()).collect();
    let fields: Vec<&ProviderFields> = items.iter().map(|n| &n.provider).collect();
    let updated = stake_settings(kind, &fields)
        .set("n2n_host", items.iter().map(|n| n.n2n_host.clone()).collect())
        .set("host", items.iter().map(|n| n.host.clone()).collect())
        .set("port", items.iter().map(|n| n.port).collect())
        .set("path", items.iter().map(|n| n.path.clone()).collect())
        .set("short_name", items.iter().map(|n| n.short_name.clone()).collect())
        .set("build_tag", items.iter().map(|n| n.build_tag.clone()).collect())
        .set("fees", items.iter().map(|n| n.fees).collect())
        .execute(conn)?;
    expect_all(conn, kind, &ids, updated)
}

pub fn update_validators(conn: &Connection, items: &[Validator]) -> Result<()> {
    let ids: Vec<String> = items.iter().map(|v| v.provider.id.clone()).collect();
    let fields: Vec<&ProviderFields> = items.iter().map(|v| &v.provider).collect();
    let updated = stake_settings(ProviderKind::Validator, &fields)
        .set("base_url", items.iter().map(|v| v.base_url.clone()).collect())
        .set("public_key", items.iter().map(|v| v.public_key.clone()).collect())
        .execute(conn)?;
    expect_all(conn, ProviderKind::Validator, &ids, updated)
}

pub fn update_authorizers(conn: &Connection, items: &[Authorizer]) -> Result<()> {
    let ids: Vec<String> = items.iter().map(|a| a.provider.id.clone()).collect();
    let fields: Vec<&ProviderFields> = items.iter().map(|a| &a.provider).collect();
    let updated = stake_settings(ProviderKind::Authorizer, &fields)
        .set("url", items.iter().map(|a| a.url.clone()).collect())
        .set("fee", items.iter().map(|a| a.fee).collect())
        .execute(conn)?;
    expect_all(conn, ProviderKind::Authorizer, &ids, updated)
}

/// Delete providers and their reward rows; snapshots stay until aggregation
/// notices the provider is gone
pub fn delete_providers(conn: &Connection, kind: ProviderKind, ids: &[String]) -> Result<usize> {
    let ids_json = json_ids(ids);
    let deleted = conn.execute(
        &format!(
            "DELETE FROM {} WHERE id IN (SELECT value FROM json_each(?1))",
            kind.table()
        ),
        [&ids_json],
    )?;
    conn.execute(
        "DELETE FROM provider_rewards WHERE provider_type = ?1 AND provider_id IN (SELECT value FROM json_each(?2))",
        rusqlite::params![kind.as_str(), ids_json],
    )?;
    Ok(deleted)
}

/// Set `is_killed` / `is_shutdown` on the listed providers
pub fn set_provider_flag(conn: &Connection, providers: &[ProviderId], flag: ProviderFlag) -> Result<usize> {
    let mut by_kind: BTreeMap<ProviderKind, Vec<String>> = BTreeMap::new();
    for p in providers {
        by_kind.entry(p.kind).or_default().push(p.id.clone());
    }

    let mut updated = 0;
    for (kind, ids) in by_kind {
        updated += BatchUpdate::new(kind.table(), "id", ids)
            .set_raw(format!("{} = 1", flag.column()))
            .set_raw(format!("updated_at = {}", now()))
            .execute(conn)?;
    }
    Ok(updated)
}

pub fn update_total_stakes(conn: &Connection, kind: ProviderKind, items: &[StakeTotal]) -> Result<usize> {
    BatchUpdate::new(kind.table(), "id", items.iter().map(|s| s.id.clone()).collect())
        .set("total_stake", items.iter().map(|s| s.total_stake).collect())
        .execute(conn)
}

/// `downtime += delta`, `last_health_check := value`
pub fn apply_health_checks(conn: &Connection, kind: ProviderKind, items: &[HealthCheck]) -> Result<usize> {
    BatchUpdate::new(kind.table(), "id", items.iter().map(|h| h.id.clone()).collect())
        .add("downtime", items.iter().map(|h| h.downtime).collect())
        .set("last_health_check", items.iter().map(|h| h.last_health_check).collect())
        .execute(conn)
}

pub fn update_blobber_allocated_saved(conn: &Connection, items: &[BlobberAllocatedSaved]) -> Result<usize> {
    BatchUpdate::new("blobbers", "id", items.iter().map(|b| b.id.clone()).collect())
        .set("allocated", items.iter().map(|b| b.allocated).collect())
        .set("saved_data", items.iter().map(|b| b.saved_data).collect())
        .set("last_health_check", items.iter().map(|b| b.last_health_check).collect())
        .execute(conn)
}

pub fn add_blobber_stats(conn: &Connection, items: &[BlobberStat]) -> Result<usize> {
    BatchUpdate::new("blobbers", "id", items.iter().map(|b| b.id.clone()).collect())
        .add("saved_data", items.iter().map(|b| b.saved_data).collect())
        .add("read_data", items.iter().map(|b| b.read_data).collect())
        .execute(conn)
}

pub fn add_blobber_offers(conn: &Connection, items: &[BlobberOffers]) -> Result<usize> {
    BatchUpdate::new("blobbers", "id", items.iter().map(|b| b.id.clone()).collect())
        .add("offers_total", items.iter().map(|b| b.offers_total).collect())
        .execute(conn)
}

pub fn add_blobber_open_challenges(conn: &Connection, items: &[BlobberOpenChallenges]) -> Result<usize> {
    BatchUpdate::new("blobbers", "id", items.iter().map(|b| b.id.clone()).collect())
        .add("open_challenges", items.iter().map(|b| b.open_challenges).collect())
        .execute(conn)
}

/// Add challenge outcomes and recompute the pass ratio
pub fn add_blobber_challenges(conn: &Connection, items: &[BlobberChallenges]) -> Result<usize> {
    let ids: Vec<String> = items.iter().map(|b| b.id.clone()).collect();
    let updated = BatchUpdate::new("blobbers", "id", ids.clone())
        .add("challenges_passed", items.iter().map(|b| b.challenges_passed).collect())
        .add("challenges_completed", items.iter().map(|b| b.challenges_completed).collect())
        .execute(conn)?;

    conn.execute(
        "UPDATE blobbers SET rank_metric = CASE WHEN challenges_completed > 0
             THEN CAST(challenges_passed AS REAL) / challenges_completed ELSE 0 END
         WHERE id IN (SELECT value FROM json_each(?1))",
        [json_ids(&ids)],
    )?;
    Ok(updated)
}

/// Revenue buckets a blobber's stake-pool rewards are attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobberRevenue {
    Block,
    Storage,
    Read,
    Slashed,
}

impl BlobberRevenue {
    fn column(&self) -> &'static str {
        match self {
            BlobberRevenue::Block => "total_block_rewards",
            BlobberRevenue::Storage => "total_storage_income",
            BlobberRevenue::Read => "total_read_income",
            BlobberRevenue::Slashed => "total_slashed_stake",
        }
    }
}

pub fn add_blobber_revenue(conn: &Connection, id: &str, revenue: BlobberRevenue, amount: i64) -> Result<usize> {
    let column = revenue.column();
    Ok(conn.execute(
        &format!("UPDATE blobbers SET {column} = {column} + ?1 WHERE id = ?2"),
        rusqlite::params![amount, id],
    )?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizerTotal {
    Mint,
    Burn,
}

/// Accumulate bridge mint/burn amounts per authorizer
pub fn add_authorizer_totals(conn: &Connection, total: AuthorizerTotal, amounts: &[(String, i64)]) -> Result<usize> {
    let mut summed: BTreeMap<&str, i64> = BTreeMap::new();
    for (id, amount) in amounts {
        *summed.entry(id.as_str()).or_insert(0) += amount;
    }
    let column = match total {
        AuthorizerTotal::Mint => "total_mint",
        AuthorizerTotal::Burn => "total_burn",
    };
    BatchUpdate::new(
        "authorizers",
        "id",
        summed.keys().map(|s| s.to_string()).collect(),
    )
    .add(column, summed.values().copied().collect())
    .execute(conn)
}

pub fn provider_exists(conn: &Connection, kind: ProviderKind, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1", kind.table()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn blobber(id: &str, stake: i64) -> Blobber {
        Blobber {
            provider: ProviderFields {
                id: id.to_string(),
                total_stake: stake,
                service_charge: 0.1,
                ..Default::default()
            },
            capacity: 1_000,
            write_price: 10,
            ..Default::default()
        }
    }

    fn column(conn: &Connection, id: &str, col: &str) -> i64 {
        conn.query_row(&format!("SELECT {} FROM blobbers WHERE id = ?1", col), [id], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_upsert_keeps_bucket_and_creation_round() {
        // Test: re-registration overwrites values but not identity columns
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_blobbers(conn, &[blobber("0f", 10)], 3, 10).unwrap();
        upsert_blobbers(conn, &[blobber("0f", 99)], 8, 10).unwrap();

        assert_eq!(column(conn, "0f", "total_stake"), 99);
        assert_eq!(column(conn, "0f", "creation_round"), 3);
        assert_eq!(column(conn, "0f", "bucket_id"), 5);
    }

    #[test]
    fn test_update_missing_blobber_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_blobbers(conn, &[blobber("b1", 10)], 1, 10).unwrap();

        let err = update_blobbers(conn, &[blobber("b1", 0), blobber("ghost", 0)]).unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { id, .. } if id == "ghost"));
    }

    #[test]
    fn test_update_blobber_keeps_stake() {
        // Test: settings update leaves stake and usage untouched
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_blobbers(conn, &[blobber("b1", 500)], 1, 10).unwrap();
        let mut changed = blobber("b1", 0);
        changed.capacity = 4_000;
        update_blobbers(conn, &[changed]).unwrap();

        assert_eq!(column(conn, "b1", "capacity"), 4_000);
        assert_eq!(column(conn, "b1", "total_stake"), 500);
    }

    #[test]
    fn test_flags_health_and_challenges() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_blobbers(conn, &[blobber("b1", 1), blobber("b2", 1)], 1, 10).unwrap();

        let flagged = set_provider_flag(
            conn,
            &[ProviderId { id: "b2".into(), kind: ProviderKind::Blobber }],
            ProviderFlag::Killed,
        )
        .unwrap();
        assert_eq!(flagged, 1);
        assert_eq!(column(conn, "b2", "is_killed"), 1);
        assert_eq!(column(conn, "b1", "is_killed"), 0);

        apply_health_checks(
            conn,
            ProviderKind::Blobber,
            &[HealthCheck { id: "b1".into(), last_health_check: 77, downtime: 4 }],
        )
        .unwrap();
        apply_health_checks(
            conn,
            ProviderKind::Blobber,
            &[HealthCheck { id: "b1".into(), last_health_check: 80, downtime: 3 }],
        )
        .unwrap();
        assert_eq!(column(conn, "b1", "downtime"), 7);
        assert_eq!(column(conn, "b1", "last_health_check"), 80);

        add_blobber_challenges(
            conn,
            &[BlobberChallenges { id: "b1".into(), challenges_passed: 3, challenges_completed: 4 }],
        )
        .unwrap();
        let rank: f64 = conn
            .query_row("SELECT rank_metric FROM blobbers WHERE id = 'b1'", [], |r| r.get(0))
            .unwrap();
        assert!((rank - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_delete_and_authorizer_totals() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_authorizers(
            conn,
            &[Authorizer {
                provider: ProviderFields { id: "a1".into(), ..Default::default() },
                ..Default::default()
            }],
            1,
            10,
        )
        .unwrap();
        add_authorizer_totals(
            conn,
            AuthorizerTotal::Mint,
            &[("a1".into(), 5), ("a1".into(), 6), ("ghost".into(), 1)],
        )
        .unwrap();
        let mint: i64 = conn
            .query_row("SELECT total_mint FROM authorizers WHERE id = 'a1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mint, 11);

        assert_eq!(delete_providers(conn, ProviderKind::Authorizer, &["a1".into()]).unwrap(), 1);
        assert!(!provider_exists(conn, ProviderKind::Authorizer, "a1").unwrap());
    }
}
