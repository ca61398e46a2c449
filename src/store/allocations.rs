//! Allocations, allocation-blobber terms and storage challenges

use super::batch::BatchUpdate;
use super::{chain, now};
use crate::error::{IndexerError, Result};
use crate::events::payloads::{
    Allocation, AllocationBlobberTerm, AllocationChallengeCount, AllocationChallenges, AllocationStakes,
    AllocationStat, Challenge,
};
use rusqlite::{params, Connection, OptionalExtension};

const ALLOCATION_UPSERT: &str = "INSERT INTO allocations (
        allocation_id, transaction_id, data_shards, parity_shards, size, expiration, owner,
        owner_public_key, read_price_min, read_price_max, write_price_min, write_price_max,
        start_time, finalized, cancelled, used_size, moved_to_challenge, moved_back,
        moved_to_validators, write_pool, min_lock_demand, file_options, num_writes, num_reads,
        total_challenges, open_challenges, successful_challenges, failed_challenges,
        latest_closed_challenge_txn, created_at, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?30)
    ON CONFLICT(allocation_id) DO UPDATE SET
        transaction_id = excluded.transaction_id,
        data_shards = excluded.data_shards,
        parity_shards = excluded.parity_shards,
        size = excluded.size,
        expiration = excluded.expiration,
        owner = excluded.owner,
        owner_public_key = excluded.owner_public_key,
        read_price_min = excluded.read_price_min,
        read_price_max = excluded.read_price_max,
        write_price_min = excluded.write_price_min,
        write_price_max = excluded.write_price_max,
        start_time = excluded.start_time,
        finalized = excluded.finalized,
        cancelled = excluded.cancelled,
        used_size = excluded.used_size,
        moved_to_challenge = excluded.moved_to_challenge,
        moved_back = excluded.moved_back,
        moved_to_validators = excluded.moved_to_validators,
        write_pool = excluded.write_pool,
        min_lock_demand = excluded.min_lock_demand,
        file_options = excluded.file_options,
        num_writes = excluded.num_writes,
        num_reads = excluded.num_reads,
        total_challenges = excluded.total_challenges,
        open_challenges = excluded.open_challenges,
        successful_challenges = excluded.successful_challenges,
        failed_challenges = excluded.failed_challenges,
        latest_closed_challenge_txn = excluded.latest_closed_challenge_txn,
        updated_at = excluded.updated_at";

/// Insert or overwrite allocations; owners get a user row if they have none
pub fn upsert_allocations(conn: &Connection, allocations: &[Allocation], round: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(ALLOCATION_UPSERT)?;
    let ts = now();
    for a in allocations {
        chain::ensure_user(conn, &a.owner, round)?;
        stmt.execute(params![
            a.allocation_id,
            a.transaction_id,
            a.data_shards,
            a.parity_shards,
            a.size,
            a.expiration,
            a.owner,
            a.owner_public_key,
            a.read_price_min,
            a.read_price_max,
            a.write_price_min,
            a.write_price_max,
            a.start_time,
            a.finalized,
            a.cancelled,
            a.used_size,
            a.moved_to_challenge,
            a.moved_back,
            a.moved_to_validators,
            a.write_pool,
            a.min_lock_demand,
            a.file_options,
            a.num_writes,
            a.num_reads,
            a.total_challenges,
            a.open_challenges,
            a.successful_challenges,
            a.failed_challenges,
            a.latest_closed_challenge_txn,
            ts
        ])
        .map_err(IndexerError::upsert("allocations"))?;
    }
    Ok(())
}

/// Overwrite existing allocations
pub fn update_allocations(conn: &Connection, allocations: &[Allocation], round: i64) -> Result<()> {
    for a in allocations {
        require_allocation(conn, &a.allocation_id)?;
    }
    upsert_allocations(conn, allocations, round)
}

pub fn allocation_exists(conn: &Connection, allocation_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM allocations WHERE allocation_id = ?1",
            [allocation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn require_allocation(conn: &Connection, allocation_id: &str) -> Result<()> {
    if allocation_exists(conn, allocation_id)? {
        Ok(())
    } else {
        Err(IndexerError::not_found("allocation", allocation_id))
    }
}

fn allocation_batch(ids: Vec<String>) -> BatchUpdate {
    BatchUpdate::new("allocations", "allocation_id", ids).set_raw(format!("updated_at = {}", now()))
}

pub fn update_allocation_stakes(conn: &Connection, items: &[AllocationStakes]) -> Result<usize> {
    allocation_batch(items.iter().map(|s| s.allocation_id.clone()).collect())
        .set("write_pool", items.iter().map(|s| s.write_pool).collect())
        .set("min_lock_demand", items.iter().map(|s| s.min_lock_demand).collect())
        .execute(conn)
}

/// Accumulate usage deltas
pub fn add_allocation_stats(conn: &Connection, items: &[AllocationStat]) -> Result<usize> {
    allocation_batch(items.iter().map(|s| s.allocation_id.clone()).collect())
        .add("used_size", items.iter().map(|s| s.used_size).collect())
        .add("num_writes", items.iter().map(|s| s.num_writes).collect())
        .add("num_reads", items.iter().map(|s| s.num_reads).collect())
        .add("moved_to_challenge", items.iter().map(|s| s.moved_to_challenge).collect())
        .add("moved_back", items.iter().map(|s| s.moved_back).collect())
        .add("moved_to_validators", items.iter().map(|s| s.moved_to_validators).collect())
        .execute(conn)
}

pub fn update_allocation_challenges(conn: &Connection, items: &[AllocationChallenges]) -> Result<usize> {
    allocation_batch(items.iter().map(|c| c.allocation_id.clone()).collect())
        .set("open_challenges", items.iter().map(|c| c.open_challenges).collect())
        .set("successful_challenges", items.iter().map(|c| c.successful_challenges).collect())
        .set("failed_challenges", items.iter().map(|c| c.failed_challenges).collect())
        .set(
            "latest_closed_challenge_txn",
            items.iter().map(|c| c.latest_closed_challenge_txn.clone()).collect(),
        )
        .execute(conn)
}

pub fn add_allocation_challenge_counts(conn: &Connection, items: &[AllocationChallengeCount]) -> Result<usize> {
    allocation_batch(items.iter().map(|c| c.allocation_id.clone()).collect())
        .add("total_challenges", items.iter().map(|c| c.total_challenges).collect())
        .add("open_challenges", items.iter().map(|c| c.open_challenges).collect())
        .execute(conn)
}

/// Insert or overwrite terms; the allocation must already exist
pub fn upsert_terms(conn: &Connection, terms: &[AllocationBlobberTerm]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO allocation_blobber_terms (
             alloc_id, blobber_id, read_price, write_price, min_lock_demand, max_offer_duration, alloc_blobber_idx)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(alloc_id, blobber_id) DO UPDATE SET
             read_price = excluded.read_price,
             write_price = excluded.write_price,
             min_lock_demand = excluded.min_lock_demand,
             max_offer_duration = excluded.max_offer_duration,
             alloc_blobber_idx = excluded.alloc_blobber_idx",
    )?;
    for t in terms {
        require_allocation(conn, &t.allocation_id)?;
        stmt.execute(params![
            t.allocation_id,
            t.blobber_id,
            t.read_price,
            t.write_price,
            t.min_lock_demand,
            t.max_offer_duration,
            t.alloc_blobber_idx
        ])
        .map_err(IndexerError::upsert("allocation_blobber_terms"))?;
    }
    Ok(())
}

/// Update prices of existing terms
pub fn update_terms(conn: &Connection, terms: &[AllocationBlobberTerm]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE allocation_blobber_terms SET
             read_price = ?1, write_price = ?2, min_lock_demand = ?3, max_offer_duration = ?4
         WHERE alloc_id = ?5 AND blobber_id = ?6",
    )?;
    for t in terms {
        let updated = stmt.execute(params![
            t.read_price,
            t.write_price,
            t.min_lock_demand,
            t.max_offer_duration,
            t.allocation_id,
            t.blobber_id
        ])?;
        if updated == 0 {
            return Err(IndexerError::not_found(
                "allocation_blobber_term",
                format!("{}/{}", t.allocation_id, t.blobber_id),
            ));
        }
    }
    Ok(())
}

pub fn delete_terms(conn: &Connection, terms: &[AllocationBlobberTerm]) -> Result<usize> {
    let mut stmt =
        conn.prepare_cached("DELETE FROM allocation_blobber_terms WHERE alloc_id = ?1 AND blobber_id = ?2")?;
    let mut deleted = 0;
    for t in terms {
        deleted += stmt.execute(params![t.allocation_id, t.blobber_id])?;
    }
    Ok(deleted)
}

/// Append challenges; a challenge id seen before is left alone
pub fn insert_challenges(conn: &Connection, challenges: &[Challenge]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO challenges (
             challenge_id, created_at, allocation_id, blobber_id, validators_id, seed, allocation_root,
             responded, passed, round_created, round_responded, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(challenge_id) DO NOTHING",
    )?;
    let mut inserted = 0;
    for c in challenges {
        inserted += stmt.execute(params![
            c.challenge_id,
            c.created_at,
            c.allocation_id,
            c.blobber_id,
            c.validators_id,
            c.seed,
            c.allocation_root,
            c.responded,
            c.passed,
            c.round_created,
            c.round_responded,
            c.timestamp
        ])?;
    }
    Ok(inserted)
}

/// Record challenge responses; unknown challenges are skipped with a warning
pub fn update_challenges(conn: &Connection, challenges: &[Challenge]) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE challenges SET responded = ?1, passed = ?2, round_responded = ?3 WHERE challenge_id = ?4",
    )?;
    let mut updated = 0;
    for c in challenges {
        let n = stmt.execute(params![c.responded, c.passed, c.round_responded, c.challenge_id])?;
        if n == 0 {
            log::warn!("⚠️  Response for unknown challenge {}", c.challenge_id);
        }
        updated += n;
    }
    Ok(updated)
}
