//! Relational store
//!
//! SQLite through rusqlite. The pipeline owns a single writer `Store`; readers
//! open their own `ReadStore` on the same file and see the last committed block
//! (WAL mode).
//!
//! Schema files live in `/sql/` and are embedded at build time. Every statement
//! uses `IF NOT EXISTS`, so running the migrations on every start is safe.
//!
//! Entity write helpers are grouped by domain:
//! - `providers` - provider rows, stake, health, kill/shutdown
//! - `rewards` - provider rewards, reward rows, collection
//! - `allocations` - allocations, blobber terms, challenges
//! - `pools` - delegate, read, write and challenge pools
//! - `chain` - blocks, transactions, users, markers, bridge records, errors
//! - `partitions` - rolling aggregate partitions
//! - `user_aggregates` - per-user pool, stake, fee and reward totals per round
//! - `queries` - the read surface

pub mod allocations;
pub mod batch;
pub mod chain;
pub mod partitions;
pub mod pools;
pub mod providers;
pub mod queries;
pub mod rewards;
pub mod user_aggregates;

pub use batch::BatchUpdate;
pub use partitions::PartitionManager;
pub use queries::{Pagination, Queries};
pub use user_aggregates::{UserAggregate, UserAggregateBatch, UserTotalKind};

use crate::error::Result;
use rusqlite::{Connection, OpenFlags, Transaction};
use std::time::{Duration, Instant};

/// Schema name the slow tablespace file is attached under
pub const SLOW_SCHEMA: &str = "slow";

/// VM instructions between deadline checks
const PROGRESS_OPS: i32 = 1_000;

const MIGRATIONS: &[(&str, &str)] = &[
    ("00_providers.sql", include_str!("../../sql/00_providers.sql")),
    ("01_allocations.sql", include_str!("../../sql/01_allocations.sql")),
    ("02_pools.sql", include_str!("../../sql/02_pools.sql")),
    ("03_chain.sql", include_str!("../../sql/03_chain.sql")),
    ("04_snapshots.sql", include_str!("../../sql/04_snapshots.sql")),
    ("05_user_aggregates.sql", include_str!("../../sql/05_user_aggregates.sql")),
];

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    /// Database file attached as the slow tablespace
    pub slow_tablespace: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            slow_tablespace: None,
        }
    }
}

/// Run the embedded schema migrations
pub fn run_schema_migrations(conn: &Connection) -> Result<()> {
    log::info!("🔧 Running schema migrations");

    for (name, sql) in MIGRATIONS {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }

    log::info!("   └─ ✅ {} migration files applied", MIGRATIONS.len());
    Ok(())
}

/// WAL for concurrent readers, FK enforcement for allocation ownership
fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

fn attach_slow(conn: &Connection, path: &str) -> Result<()> {
    conn.execute("ATTACH DATABASE ?1 AS slow", [path])?;
    log::info!("🗄️  Attached slow tablespace: {}", path);
    Ok(())
}

/// Writer side of the store
pub struct Store {
    conn: Connection,
    slow_attached: bool,
}

impl Store {
    /// Open (or create) the database file, apply pragmas and migrations
    pub fn open(db_path: &str, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, options)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, &StoreOptions::default())
    }

    pub fn open_in_memory_with(options: &StoreOptions) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, options)
    }

    fn init(conn: Connection, options: &StoreOptions) -> Result<Self> {
        apply_pragmas(&conn, options.busy_timeout)?;
        run_schema_migrations(&conn)?;

        let slow_attached = match &options.slow_tablespace {
            Some(path) => {
                attach_slow(&conn, path)?;
                true
            }
            None => false,
        };

        Ok(Self {
            conn,
            slow_attached,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn has_slow_tablespace(&self) -> bool {
        self.slow_attached
    }

    pub fn queries(&self) -> Queries<'_> {
        Queries::new(&self.conn)
    }

    /// Run `f` inside one transaction bounded by `timeout`.
    ///
    /// The transaction commits only when `f` succeeds and `commit` is true;
    /// otherwise it rolls back. A query still running at the deadline is
    /// interrupted and surfaces as `TransientStorage`.
    pub fn run_in_transaction<T, F>(&mut self, timeout: Duration, commit: bool, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let deadline = Instant::now() + timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));

        let result = transact(&mut self.conn, commit, f);

        self.conn.progress_handler(0, None::<fn() -> bool>);
        result
    }
}

fn transact<T, F>(conn: &mut Connection, commit: bool, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction()?;
    let out = f(&tx)?;
    if commit {
        tx.commit()?;
    } else {
        tx.rollback()?;
    }
    Ok(out)
}

/// Read-only connection for the query surface
pub struct ReadStore {
    conn: Connection,
}

impl ReadStore {
    pub fn open(db_path: &str, slow_tablespace: Option<&str>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        if let Some(path) = slow_tablespace {
            attach_slow(&conn, path)?;
        }
        Ok(Self { conn })
    }

    pub fn queries(&self) -> Queries<'_> {
        Queries::new(&self.conn)
    }
}

/// Current unix time in seconds
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// JSON array parameter for `json_each`
pub(crate) fn json_ids<S: AsRef<str>>(ids: &[S]) -> String {
    serde_json::Value::Array(
        ids.iter()
            .map(|s| serde_json::Value::String(s.as_ref().to_string()))
            .collect(),
    )
    .to_string()
}
