//! Read surface over the committed end-of-block state
//!
//! Rows are decoded generically: each row becomes a JSON object keyed by
//! column name and is then deserialized into the same payload structs the
//! handlers write. Integer flag columns become booleans on the way.

use super::partitions;
use super::user_aggregates::{self, UserAggregate};
use crate::aggregation::{load_snapshot, GlobalSnapshot, ProviderSnapshot};
use crate::error::{IndexerError, Result};
use crate::events::payloads::{
    Allocation, AllocationBlobberTerm, Block, Challenge, DelegatePool, ProviderFields, ReadMarker, RewardType,
    Transaction, User, WriteMarker,
};
use crate::provider::{Provider, ProviderKind};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Params, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Columns stored as 0/1 that decode to `bool`
const BOOL_COLUMNS: &[&str] = &[
    "is_killed",
    "is_shutdown",
    "not_available",
    "finalized",
    "cancelled",
    "passed",
    "is_finalised",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: i64,
    pub limit: i64,
    pub descending: bool,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
            descending: false,
        }
    }
}

impl Pagination {
    fn order(&self) -> &'static str {
        if self.descending {
            "DESC"
        } else {
            "ASC"
        }
    }
}

/// Provider row of any kind: common fields typed, kind-specific columns kept
/// as a JSON map
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRecord {
    pub kind: ProviderKind,
    pub provider: ProviderFields,
    pub bucket_id: i64,
    pub rewards: i64,
    pub total_rewards: i64,
    pub details: Map<String, Value>,
}

impl Provider for ProviderRecord {
    fn id(&self) -> &str {
        &self.provider.id
    }
    fn bucket_id(&self) -> i64 {
        self.bucket_id
    }
    fn total_stake(&self) -> i64 {
        self.provider.total_stake
    }
    fn service_charge(&self) -> f64 {
        self.provider.service_charge
    }
    fn total_rewards(&self) -> i64 {
        self.total_rewards
    }
    fn is_killed(&self) -> bool {
        self.provider.is_killed
    }
    fn is_shutdown(&self) -> bool {
        self.provider.is_shutdown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRewards {
    pub provider_id: String,
    pub provider_type: ProviderKind,
    pub rewards: i64,
    pub total_rewards: i64,
    pub round_last_updated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(flatten)]
    pub block: Block,
    #[serde(default)]
    pub is_finalised: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub payed_fees: i64,
    #[serde(default)]
    pub collected_reward: i64,
}

/// One `reward_providers` or `reward_delegates` row; `pool_id` is empty for
/// provider rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRecord {
    pub id: i64,
    #[serde(default)]
    pub pool_id: String,
    pub provider_id: String,
    pub provider_type: ProviderKind,
    pub amount: i64,
    pub block_number: i64,
    pub reward_type: String,
    pub allocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRow {
    pub id: i64,
    pub round: i64,
    pub tx_hash: String,
    pub error: String,
    pub created_at: i64,
}

fn row_to_json(row: &Row<'_>, names: &[String]) -> rusqlite::Result<Map<String, Value>> {
    let mut map = Map::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) if BOOL_COLUMNS.contains(&name.as_str()) => Value::Bool(n != 0),
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => Value::from(f),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(hex::encode(b)),
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}

pub struct Queries<'a> {
    conn: &'a Connection,
}

impl<'a> Queries<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn rows<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Map<String, Value>>> {
        let mut stmt = self.conn.prepare(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let rows = stmt.query_map(params, |row| row_to_json(row, &names))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_as<T: DeserializeOwned, P: Params>(&self, sql: &str, params: P) -> Result<Vec<T>> {
        self.rows(sql, params)?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(IndexerError::from))
            .collect()
    }

    fn query_one<T: DeserializeOwned, P: Params>(&self, sql: &str, params: P) -> Result<Option<T>> {
        Ok(self.query_as(sql, params)?.into_iter().next())
    }

    fn count<P: Params>(&self, sql: &str, params: P) -> Result<i64> {
        Ok(self.conn.query_row(sql, params, |row| row.get(0))?)
    }

    // ---------------------------------------------------------------- providers

    fn provider_select(kind: ProviderKind) -> String {
        format!(
            "SELECT p.*, COALESCE(r.rewards, 0) AS rewards, COALESCE(r.total_rewards, 0) AS total_rewards
             FROM {} p LEFT JOIN provider_rewards r ON r.provider_id = p.id",
            kind.table()
        )
    }

    fn provider_record(kind: ProviderKind, mut row: Map<String, Value>) -> Result<ProviderRecord> {
        let provider: ProviderFields = serde_json::from_value(Value::Object(row.clone()))?;
        let int = |row: &Map<String, Value>, key: &str| row.get(key).and_then(Value::as_i64).unwrap_or(0);
        let bucket_id = int(&row, "bucket_id");
        let rewards = int(&row, "rewards");
        let total_rewards = int(&row, "total_rewards");

        let common = serde_json::to_value(ProviderFields::default())?;
        if let Value::Object(common) = common {
            for key in common.keys() {
                row.remove(key);
            }
        }
        for key in ["bucket_id", "rewards", "total_rewards", "created_at", "updated_at"] {
            row.remove(key);
        }

        Ok(ProviderRecord {
            kind,
            provider,
            bucket_id,
            rewards,
            total_rewards,
            details: row,
        })
    }

    pub fn provider(&self, kind: ProviderKind, id: &str) -> Result<Option<ProviderRecord>> {
        let sql = format!("{} WHERE p.id = ?1", Self::provider_select(kind));
        self.rows(&sql, [id])?
            .into_iter()
            .next()
            .map(|row| Self::provider_record(kind, row))
            .transpose()
    }

    pub fn providers(&self, kind: ProviderKind, page: &Pagination) -> Result<Vec<ProviderRecord>> {
        let sql = format!(
            "{} ORDER BY p.id {} LIMIT ?1 OFFSET ?2",
            Self::provider_select(kind),
            page.order()
        );
        self.rows(&sql, params![page.limit, page.offset])?
            .into_iter()
            .map(|row| Self::provider_record(kind, row))
            .collect()
    }

    pub fn active_count(&self, kind: ProviderKind) -> Result<i64> {
        self.count(
            &format!("SELECT COUNT(*) FROM {} WHERE is_killed = 0 AND is_shutdown = 0", kind.table()),
            [],
        )
    }

    pub fn inactive_count(&self, kind: ProviderKind) -> Result<i64> {
        self.count(
            &format!("SELECT COUNT(*) FROM {} WHERE is_killed = 1 OR is_shutdown = 1", kind.table()),
            [],
        )
    }

    pub fn total_stake(&self, kind: ProviderKind) -> Result<i64> {
        self.count(&format!("SELECT COALESCE(SUM(total_stake), 0) FROM {}", kind.table()), [])
    }

    /// Open challenges across all blobbers
    pub fn open_challenges(&self, kind: ProviderKind) -> Result<i64> {
        if kind != ProviderKind::Blobber {
            return Err(IndexerError::NotImplemented(format!("open challenges for {}", kind)));
        }
        self.count("SELECT COALESCE(SUM(open_challenges), 0) FROM blobbers", [])
    }

    pub fn provider_rewards(&self, provider_id: &str) -> Result<Option<ProviderRewards>> {
        self.query_one(
            "SELECT provider_id, provider_type, rewards, total_rewards, round_last_updated
             FROM provider_rewards WHERE provider_id = ?1",
            [provider_id],
        )
    }

    pub fn delegate_pools(&self, provider_id: &str) -> Result<Vec<DelegatePool>> {
        self.query_as(
            "SELECT * FROM delegate_pools WHERE provider_id = ?1 ORDER BY pool_id",
            [provider_id],
        )
    }

    // -------------------------------------------------------------- allocations

    pub fn allocation(&self, allocation_id: &str) -> Result<Option<Allocation>> {
        self.query_one("SELECT * FROM allocations WHERE allocation_id = ?1", [allocation_id])
    }

    pub fn allocation_terms(&self, allocation_id: &str) -> Result<Vec<AllocationBlobberTerm>> {
        self.query_as(
            "SELECT a.allocation_id, t.blobber_id, t.read_price, t.write_price, t.min_lock_demand,
                    t.max_offer_duration, t.alloc_blobber_idx
             FROM allocation_blobber_terms t
             JOIN allocations a ON a.allocation_id = t.alloc_id
             WHERE a.allocation_id = ?1
             ORDER BY t.alloc_blobber_idx, t.blobber_id",
            [allocation_id],
        )
    }

    pub fn challenges_by_allocation(&self, allocation_id: &str) -> Result<Vec<Challenge>> {
        self.query_as(
            "SELECT * FROM challenges WHERE allocation_id = ?1 ORDER BY round_created, challenge_id",
            [allocation_id],
        )
    }

    // -------------------------------------------------------------------- chain

    pub fn transaction(&self, hash: &str) -> Result<Option<Transaction>> {
        self.query_one("SELECT * FROM transactions WHERE hash = ?1", [hash])
    }

    /// Transactions in blocks `[from_round, to_round]`
    pub fn transactions_in_range(&self, from_round: i64, to_round: i64, page: &Pagination) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT * FROM transactions WHERE round BETWEEN ?1 AND ?2
             ORDER BY round {order}, hash {order} LIMIT ?3 OFFSET ?4",
            order = page.order()
        );
        self.query_as(&sql, params![from_round, to_round, page.limit, page.offset])
    }

    pub fn block_by_round(&self, round: i64) -> Result<Option<BlockRecord>> {
        self.query_one("SELECT * FROM blocks WHERE round = ?1", [round])
    }

    pub fn user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        self.query_one("SELECT * FROM users WHERE user_id = ?1", [user_id])
    }

    pub fn users(&self, page: &Pagination) -> Result<Vec<UserRecord>> {
        let sql = format!(
            "SELECT * FROM users ORDER BY user_id {} LIMIT ?1 OFFSET ?2",
            page.order()
        );
        self.query_as(&sql, params![page.limit, page.offset])
    }

    pub fn user_aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>> {
        user_aggregates::latest(self.conn, user_id)
    }

    /// Newest aggregate of every user
    pub fn latest_user_aggregates(&self) -> Result<Vec<UserAggregate>> {
        user_aggregates::latest_all(self.conn)
    }

    pub fn user_aggregates_in_range(&self, user_id: &str, from_round: i64, to_round: i64) -> Result<Vec<UserAggregate>> {
        user_aggregates::in_range(self.conn, user_id, from_round, to_round)
    }

    pub fn write_markers(&self, from_block: i64, to_block: i64) -> Result<Vec<WriteMarker>> {
        self.query_as(
            "SELECT * FROM write_markers WHERE block_number BETWEEN ?1 AND ?2
             ORDER BY block_number, transaction_id",
            [from_block, to_block],
        )
    }

    pub fn read_markers(&self, from_block: i64, to_block: i64) -> Result<Vec<ReadMarker>> {
        self.query_as(
            "SELECT * FROM read_markers WHERE block_number BETWEEN ?1 AND ?2
             ORDER BY block_number, transaction_id",
            [from_block, to_block],
        )
    }

    pub fn reward_providers(
        &self,
        from_block: i64,
        to_block: i64,
        reward_type: Option<RewardType>,
    ) -> Result<Vec<RewardRecord>> {
        self.reward_rows("reward_providers", from_block, to_block, reward_type)
    }

    pub fn reward_delegates(
        &self,
        from_block: i64,
        to_block: i64,
        reward_type: Option<RewardType>,
    ) -> Result<Vec<RewardRecord>> {
        self.reward_rows("reward_delegates", from_block, to_block, reward_type)
    }

    fn reward_rows(
        &self,
        table: &str,
        from_block: i64,
        to_block: i64,
        reward_type: Option<RewardType>,
    ) -> Result<Vec<RewardRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE block_number BETWEEN ?1 AND ?2
               AND (?3 IS NULL OR reward_type = ?3)
             ORDER BY block_number, id",
            table
        );
        self.query_as(&sql, params![from_block, to_block, reward_type.map(|t| t.as_str())])
    }

    // ---------------------------------------------------------------- analytics

    pub fn snapshot<S: ProviderSnapshot>(&self, provider_id: &str) -> Result<Option<S>> {
        load_snapshot::<S>(self.conn, provider_id)
    }

    /// Aggregate rows for a provider in `[from_round, to_round]`, across every
    /// partition that overlaps the range, ordered by round
    pub fn aggregates(
        &self,
        kind: ProviderKind,
        provider_id: &str,
        from_round: i64,
        to_round: i64,
    ) -> Result<Vec<Map<String, Value>>> {
        let tables = partitions::overlapping(self.conn, kind, from_round, to_round)?;
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let selects: Vec<String> = tables
            .iter()
            .map(|p| {
                format!(
                    "SELECT * FROM {} WHERE provider_id = ?1 AND round BETWEEN ?2 AND ?3",
                    p.qualified()
                )
            })
            .collect();
        let sql = format!("{} ORDER BY round", selects.join(" UNION ALL "));
        self.rows(&sql, params![provider_id, from_round, to_round])
    }

    pub fn latest_global(&self) -> Result<Option<GlobalSnapshot>> {
        GlobalSnapshot::load_latest(self.conn)
    }

    pub fn global_at(&self, round: i64) -> Result<Option<GlobalSnapshot>> {
        GlobalSnapshot::load_at(self.conn, round)
    }

    pub fn errors_by_tx(&self, tx_hash: &str) -> Result<Vec<ErrorRow>> {
        self.query_as(
            "SELECT id, round, tx_hash, error, created_at FROM errors WHERE tx_hash = ?1 ORDER BY id",
            [tx_hash],
        )
    }

    pub fn errors_by_round(&self, round: i64) -> Result<Vec<ErrorRow>> {
        self.query_as(
            "SELECT id, round, tx_hash, error, created_at FROM errors WHERE round = ?1 ORDER BY id",
            [round],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::payloads::Blobber;
    use crate::store::{allocations, chain, providers, Store};

    fn create_test_blobber(id: &str, stake: i64) -> Blobber {
        Blobber {
            provider: ProviderFields {
                id: id.to_string(),
                total_stake: stake,
                service_charge: 0.1,
                ..Default::default()
            },
            base_url: format!("https://{}.example", id),
            capacity: 1 << 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_provider_lookup_and_pagination() {
        let store = Store::open_in_memory().unwrap();
        let blobbers: Vec<Blobber> = ["b1", "b2", "b3"]
            .iter()
            .enumerate()
            .map(|(i, id)| create_test_blobber(id, 10 * (i as i64 + 1)))
            .collect();
        providers::upsert_blobbers(store.conn(), &blobbers, 1, 10).unwrap();

        let q = store.queries();
        let b2 = q.provider(ProviderKind::Blobber, "b2").unwrap().unwrap();
        assert_eq!(b2.total_stake(), 20);
        assert_eq!(b2.details["base_url"], Value::from("https://b2.example"));
        assert!(!b2.details.contains_key("total_stake"));

        let page = Pagination {
            offset: 0,
            limit: 2,
            descending: true,
        };
        let ids: Vec<String> = q
            .providers(ProviderKind::Blobber, &page)
            .unwrap()
            .into_iter()
            .map(|p| p.provider.id)
            .collect();
        assert_eq!(ids, vec!["b3", "b2"]);

        assert_eq!(q.total_stake(ProviderKind::Blobber).unwrap(), 60);
        assert!(q.provider(ProviderKind::Miner, "b1").unwrap().is_none());
    }

    #[test]
    fn test_active_inactive_counts() {
        let store = Store::open_in_memory().unwrap();
        let mut killed = create_test_blobber("b2", 5);
        killed.provider.is_killed = true;
        providers::upsert_blobbers(store.conn(), &[create_test_blobber("b1", 5), killed], 1, 10).unwrap();

        let q = store.queries();
        assert_eq!(q.active_count(ProviderKind::Blobber).unwrap(), 1);
        assert_eq!(q.inactive_count(ProviderKind::Blobber).unwrap(), 1);
        let b2 = q.provider(ProviderKind::Blobber, "b2").unwrap().unwrap();
        assert!(b2.is_offline());
    }

    #[test]
    fn test_open_challenges_only_for_blobbers() {
        let store = Store::open_in_memory().unwrap();
        let q = store.queries();
        assert_eq!(q.open_challenges(ProviderKind::Blobber).unwrap(), 0);
        assert!(matches!(
            q.open_challenges(ProviderKind::Miner),
            Err(IndexerError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_allocation_terms_join() {
        let store = Store::open_in_memory().unwrap();
        let alloc = Allocation {
            allocation_id: "a1".into(),
            owner: "u1".into(),
            size: 1024,
            ..Default::default()
        };
        allocations::upsert_allocations(store.conn(), &[alloc], 3).unwrap();
        allocations::upsert_terms(
            store.conn(),
            &[AllocationBlobberTerm {
                allocation_id: "a1".into(),
                blobber_id: "b1".into(),
                write_price: 7,
                ..Default::default()
            }],
        )
        .unwrap();

        let q = store.queries();
        let terms = q.allocation_terms("a1").unwrap();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].allocation_id, "a1");
        assert_eq!(terms[0].write_price, 7);

        let allocation = q.allocation("a1").unwrap().unwrap();
        assert!(!allocation.finalized);
        assert_eq!(q.user("u1").unwrap().unwrap().user.user_id, "u1");
    }

    #[test]
    fn test_transactions_by_hash_and_range() {
        let store = Store::open_in_memory().unwrap();
        let txns: Vec<Transaction> = (1..=3)
            .map(|i| Transaction {
                hash: format!("t{}", i),
                round: i,
                fee: i,
                ..Default::default()
            })
            .collect();
        for tx in &txns {
            chain::insert_transactions(store.conn(), std::slice::from_ref(tx), tx.round).unwrap();
        }

        let q = store.queries();
        assert_eq!(q.transaction("t2").unwrap().unwrap().fee, 2);
        let range = q.transactions_in_range(2, 3, &Pagination::default()).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].hash, "t2");
    }
}
