//! Blocks, transactions, users, markers, bridge records and the error log

use super::{json_ids, now};
use crate::error::{IndexerError, Result};
use crate::events::payloads::{Block, BurnTicket, ReadMarker, Transaction, User, UserAmount, WriteMarker};
use rusqlite::{params, Connection};

const BLOCK_UPSERT: &str = "INSERT INTO blocks (
        hash, round, version, creation_date, miner_id, round_random_seed, merkle_tree_root,
        state_hash, receipt_merkle_tree_root, num_txns, magic_block_hash, prev_hash, signature,
        chain_id, running_txn_count, round_timeout_count, is_finalised)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
    ON CONFLICT(hash) DO UPDATE SET
        version = excluded.version,
        creation_date = excluded.creation_date,
        miner_id = excluded.miner_id,
        round_random_seed = excluded.round_random_seed,
        merkle_tree_root = excluded.merkle_tree_root,
        state_hash = excluded.state_hash,
        receipt_merkle_tree_root = excluded.receipt_merkle_tree_root,
        num_txns = excluded.num_txns,
        magic_block_hash = excluded.magic_block_hash,
        prev_hash = excluded.prev_hash,
        signature = excluded.signature,
        chain_id = excluded.chain_id,
        running_txn_count = excluded.running_txn_count,
        round_timeout_count = excluded.round_timeout_count,
        is_finalised = MAX(blocks.is_finalised, excluded.is_finalised)";

fn write_blocks(conn: &Connection, blocks: &[Block], finalised: bool) -> Result<usize> {
    let mut stmt = conn.prepare_cached(BLOCK_UPSERT)?;
    for b in blocks {
        stmt.execute(params![
            b.hash,
            b.round,
            b.version,
            b.creation_date,
            b.miner_id,
            b.round_random_seed,
            b.merkle_tree_root,
            b.state_hash,
            b.receipt_merkle_tree_root,
            b.num_txns,
            b.magic_block_hash,
            b.prev_hash,
            b.signature,
            b.chain_id,
            b.running_txn_count,
            b.round_timeout_count,
            finalised
        ])
        .map_err(IndexerError::upsert("blocks"))?;
    }
    Ok(blocks.len())
}

pub fn insert_blocks(conn: &Connection, blocks: &[Block]) -> Result<usize> {
    write_blocks(conn, blocks, false)
}

/// Mark blocks final, inserting them if they were never added. Returns how
/// many blocks were not final before.
pub fn finalize_blocks(conn: &Connection, blocks: &[Block]) -> Result<usize> {
    let hashes: Vec<&str> = blocks.iter().map(|b| b.hash.as_str()).collect();
    let already: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks WHERE is_finalised = 1 AND hash IN (SELECT value FROM json_each(?1))",
        [json_ids(&hashes)],
        |row| row.get(0),
    )?;
    write_blocks(conn, blocks, true)?;
    Ok(blocks.len().saturating_sub(already as usize))
}

/// Append transactions. Returns the number of newly inserted rows and the sum
/// of their fees; hashes already stored are not counted again.
pub fn insert_transactions(conn: &Connection, txns: &[Transaction], round: i64) -> Result<(i64, i64)> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO transactions (
             hash, block_hash, round, client_id, to_client_id, value, fee, nonce, status,
             txn_type, transaction_data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(hash) DO NOTHING",
    )?;
    let (mut count, mut fees) = (0i64, 0i64);
    for t in txns {
        let tx_round = if t.round > 0 { t.round } else { round };
        let inserted = stmt.execute(params![
            t.hash,
            t.block_hash,
            tx_round,
            t.client_id,
            t.to_client_id,
            t.value,
            t.fee,
            t.nonce,
            t.status,
            t.txn_type,
            t.transaction_data,
            t.created_at
        ])?;
        if inserted > 0 {
            count += 1;
            fees += t.fee;
        }
    }
    Ok((count, fees))
}

pub fn upsert_users(conn: &Connection, users: &[User]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO users (user_id, txn_hash, balance, round, nonce, mint_nonce, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
             txn_hash = excluded.txn_hash,
             balance = excluded.balance,
             round = excluded.round,
             nonce = excluded.nonce,
             mint_nonce = excluded.mint_nonce,
             updated_at = excluded.updated_at",
    )?;
    let ts = now();
    for u in users {
        stmt.execute(params![u.user_id, u.txn_hash, u.balance, u.round, u.nonce, u.mint_nonce, ts])
            .map_err(IndexerError::upsert("users"))?;
    }
    Ok(())
}

/// Create an empty user row unless one exists
pub fn ensure_user(conn: &Connection, user_id: &str, round: i64) -> Result<()> {
    let ts = now();
    conn.prepare_cached(
        "INSERT INTO users (user_id, round, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(user_id) DO NOTHING",
    )?
    .execute(params![user_id, round, ts])?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTotal {
    PayedFees,
    CollectedReward,
}

impl UserTotal {
    fn column(&self) -> &'static str {
        match self {
            UserTotal::PayedFees => "payed_fees",
            UserTotal::CollectedReward => "collected_reward",
        }
    }
}

/// Accumulate per-user totals, creating users on first sight
pub fn add_user_amounts(conn: &Connection, total: UserTotal, amounts: &[UserAmount], round: i64) -> Result<()> {
    let column = total.column();
    let sql = format!(
        "INSERT INTO users (user_id, {column}, round, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             {column} = users.{column} + excluded.{column},
             updated_at = excluded.updated_at"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ts = now();
    for a in amounts {
        stmt.execute(params![a.user_id, a.amount, round, ts])
            .map_err(IndexerError::upsert("users"))?;
    }
    Ok(())
}

pub fn set_mint_nonce(conn: &Connection, user_id: &str, mint_nonce: i64, round: i64) -> Result<()> {
    ensure_user(conn, user_id, round)?;
    conn.prepare_cached("UPDATE users SET mint_nonce = ?1, updated_at = ?2 WHERE user_id = ?3")?
        .execute(params![mint_nonce, now(), user_id])?;
    Ok(())
}

pub fn insert_write_markers(conn: &Connection, markers: &[WriteMarker], round: i64) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO write_markers (
             transaction_id, client_id, blobber_id, allocation_id, allocation_root,
             previous_allocation_root, file_meta_root, size, timestamp, signature, block_number,
             lookup_hash, name, content_hash, operation)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(transaction_id) DO NOTHING",
    )?;
    let mut inserted = 0;
    for m in markers {
        let block = if m.block_number > 0 { m.block_number } else { round };
        inserted += stmt.execute(params![
            m.transaction_id,
            m.client_id,
            m.blobber_id,
            m.allocation_id,
            m.allocation_root,
            m.previous_allocation_root,
            m.file_meta_root,
            m.size,
            m.timestamp,
            m.signature,
            block,
            m.lookup_hash,
            m.name,
            m.content_hash,
            m.operation
        ])?;
    }
    Ok(inserted)
}

pub fn insert_read_markers(conn: &Connection, markers: &[ReadMarker], round: i64) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO read_markers (
             transaction_id, client_id, blobber_id, allocation_id, owner_id, timestamp,
             read_counter, read_size, signature, payer_id, auth_ticket, block_number)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(transaction_id) DO NOTHING",
    )?;
    let mut inserted = 0;
    for m in markers {
        let block = if m.block_number > 0 { m.block_number } else { round };
        inserted += stmt.execute(params![
            m.transaction_id,
            m.client_id,
            m.blobber_id,
            m.allocation_id,
            m.owner_id,
            m.timestamp,
            m.read_counter,
            m.read_size,
            m.signature,
            m.payer_id,
            m.auth_ticket,
            block
        ])?;
    }
    Ok(inserted)
}

pub fn upsert_burn_tickets(conn: &Connection, tickets: &[BurnTicket], round: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO burn_tickets (hash, ethereum_address, nonce, amount, round)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(hash) DO UPDATE SET
             ethereum_address = excluded.ethereum_address,
             nonce = excluded.nonce,
             amount = excluded.amount",
    )?;
    for t in tickets {
        stmt.execute(params![t.hash, t.ethereum_address, t.nonce, t.amount, round])
            .map_err(IndexerError::upsert("burn_tickets"))?;
    }
    Ok(())
}

/// Append to the blockchain-visible error log
pub fn insert_error(conn: &Connection, round: i64, tx_hash: &str, error: &str) -> Result<()> {
    conn.prepare_cached("INSERT INTO errors (round, tx_hash, error, created_at) VALUES (?1, ?2, ?3, ?4)")?
        .execute(params![round, tx_hash, error, now()])?;
    Ok(())
}
