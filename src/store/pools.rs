//! Delegate, read, write and challenge pools

use super::now;
use crate::error::{IndexerError, Result};
use crate::events::payloads::{ChallengePool, ChallengePoolTransfer, DelegatePool, DelegatePoolUpdate, ReadPool};
use rusqlite::{params, Connection};

pub fn upsert_delegate_pools(conn: &Connection, pools: &[DelegatePool], round: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO delegate_pools (
             pool_id, provider_id, provider_type, delegate_id, balance, reward, total_reward,
             total_penalty, status, round_created, staked_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
         ON CONFLICT(provider_id, provider_type, pool_id) DO UPDATE SET
             delegate_id = excluded.delegate_id,
             balance = excluded.balance,
             status = excluded.status,
             staked_at = excluded.staked_at,
             updated_at = excluded.updated_at",
    )?;
    let ts = now();
    for p in pools {
        let created = if p.round_created > 0 { p.round_created } else { round };
        stmt.execute(params![
            p.pool_id,
            p.provider_id,
            p.provider_type.as_str(),
            p.delegate_id,
            p.balance,
            p.reward,
            p.total_reward,
            p.total_penalty,
            p.status.as_str(),
            created,
            p.staked_at,
            ts
        ])
        .map_err(IndexerError::upsert("delegate_pools"))?;
    }
    Ok(())
}

/// Apply status/balance changes; the pool must exist
pub fn update_delegate_pools(conn: &Connection, updates: &[DelegatePoolUpdate]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE delegate_pools SET
             status = COALESCE(?1, status),
             balance = COALESCE(?2, balance),
             updated_at = ?3
         WHERE provider_id = ?4 AND provider_type = ?5 AND pool_id = ?6",
    )?;
    let ts = now();
    for u in updates {
        let updated = stmt.execute(params![
            u.status.map(|s| s.as_str()),
            u.balance,
            ts,
            u.provider_id,
            u.provider_type.as_str(),
            u.pool_id
        ])?;
        if updated == 0 {
            return Err(IndexerError::not_found("delegate_pool", u.pool_id.clone()));
        }
    }
    Ok(())
}

/// Add a signed amount to a client's read pool balance
pub fn adjust_read_pool(conn: &Connection, user_id: &str, delta: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO read_pools (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET
             balance = read_pools.balance + excluded.balance,
             updated_at = excluded.updated_at",
    )?
    .execute(params![user_id, delta, now()])
    .map_err(IndexerError::upsert("read_pools"))?;
    Ok(())
}

/// Overwrite read pool balances
pub fn upsert_read_pools(conn: &Connection, pools: &[ReadPool]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO read_pools (user_id, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
    )?;
    let ts = now();
    for p in pools {
        stmt.execute(params![p.user_id, p.balance, ts])
            .map_err(IndexerError::upsert("read_pools"))?;
    }
    Ok(())
}

/// Add a signed amount to a client's write pool for one allocation
pub fn adjust_write_pool(conn: &Connection, allocation_id: &str, user_id: &str, delta: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO write_pools (allocation_id, user_id, balance, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(allocation_id, user_id) DO UPDATE SET
             balance = write_pools.balance + excluded.balance,
             updated_at = excluded.updated_at",
    )?
    .execute(params![allocation_id, user_id, delta, now()])
    .map_err(IndexerError::upsert("write_pools"))?;
    Ok(())
}

pub fn upsert_challenge_pools(conn: &Connection, pools: &[ChallengePool]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO challenge_pools (allocation_id, balance, start_time, expiration, finalized, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(allocation_id) DO UPDATE SET
             balance = excluded.balance,
             start_time = excluded.start_time,
             expiration = excluded.expiration,
             finalized = excluded.finalized,
             updated_at = excluded.updated_at",
    )?;
    let ts = now();
    for p in pools {
        stmt.execute(params![p.allocation_id, p.balance, p.start_time, p.expiration, p.finalized, ts])
            .map_err(IndexerError::upsert("challenge_pools"))?;
    }
    Ok(())
}

/// Move tokens into (`sign = 1`) or out of (`sign = -1`) challenge pools;
/// returns the signed total moved
pub fn transfer_challenge_pools(conn: &Connection, transfers: &[ChallengePoolTransfer], sign: i64) -> Result<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO challenge_pools (allocation_id, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(allocation_id) DO UPDATE SET
             balance = challenge_pools.balance + excluded.balance,
             updated_at = excluded.updated_at",
    )?;
    let ts = now();
    let mut total = 0;
    for t in transfers {
        let delta = sign * t.amount;
        stmt.execute(params![t.allocation_id, delta, ts])
            .map_err(IndexerError::upsert("challenge_pools"))?;
        total += delta;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use crate::events::payloads::PoolStatus;
    use crate::store::Store;

    fn pool(id: &str, balance: i64) -> DelegatePool {
        DelegatePool {
            pool_id: id.to_string(),
            provider_id: "b1".into(),
            provider_type: ProviderKind::Blobber,
            delegate_id: "client".into(),
            balance,
            reward: 0,
            total_reward: 0,
            total_penalty: 0,
            status: PoolStatus::Active,
            round_created: 0,
            staked_at: 0,
        }
    }

    #[test]
    fn test_delegate_pool_upsert_and_update() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        upsert_delegate_pools(conn, &[pool("d1", 10)], 4).unwrap();
        upsert_delegate_pools(conn, &[pool("d1", 30)], 6).unwrap();

        update_delegate_pools(
            conn,
            &[DelegatePoolUpdate {
                pool_id: "d1".into(),
                provider_id: "b1".into(),
                provider_type: ProviderKind::Blobber,
                status: Some(PoolStatus::Deleted),
                balance: None,
            }],
        )
        .unwrap();

        let (balance, status, created): (i64, String, i64) = conn
            .query_row(
                "SELECT balance, status, round_created FROM delegate_pools WHERE pool_id = 'd1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((balance, status.as_str(), created), (30, "deleted", 4));
    }

    #[test]
    fn test_update_missing_delegate_pool() {
        let store = Store::open_in_memory().unwrap();
        let err = update_delegate_pools(
            store.conn(),
            &[DelegatePoolUpdate {
                pool_id: "nope".into(),
                provider_id: "b1".into(),
                provider_type: ProviderKind::Blobber,
                status: None,
                balance: Some(1),
            }],
        )
        .unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { .. }));
    }

    #[test]
    fn test_pool_adjustments_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        adjust_read_pool(conn, "u1", 10).unwrap();
        adjust_read_pool(conn, "u1", -4).unwrap();
        adjust_write_pool(conn, "a1", "u1", 8).unwrap();

        let moved = transfer_challenge_pools(
            conn,
            &[
                ChallengePoolTransfer { allocation_id: "a1".into(), amount: 5 },
                ChallengePoolTransfer { allocation_id: "a1".into(), amount: 2 },
            ],
            1,
        )
        .unwrap();
        assert_eq!(moved, 7);
        transfer_challenge_pools(conn, &[ChallengePoolTransfer { allocation_id: "a1".into(), amount: 3 }], -1)
            .unwrap();

        let read: i64 = conn
            .query_row("SELECT balance FROM read_pools WHERE user_id = 'u1'", [], |r| r.get(0))
            .unwrap();
        let challenge: i64 = conn
            .query_row("SELECT balance FROM challenge_pools WHERE allocation_id = 'a1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(read, 6);
        assert_eq!(challenge, 4);
    }
}
