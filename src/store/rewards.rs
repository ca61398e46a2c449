//! Provider rewards, delegate reward posting and reward history rows

use crate::error::{IndexerError, Result};
use crate::events::payloads::{RewardMint, RewardType, StakePoolReward};
use crate::provider::ProviderKind;
use rusqlite::{params, Connection};

/// Create empty `provider_rewards` rows for newly registered providers
pub fn ensure_reward_rows(conn: &Connection, kind: ProviderKind, ids: &[String], round: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO provider_rewards (provider_id, provider_type, round_last_updated)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(provider_id) DO NOTHING",
    )?;
    for id in ids {
        stmt.execute(params![id, kind.as_str(), round])
            .map_err(IndexerError::upsert("provider_rewards"))?;
    }
    Ok(())
}

/// What posting one reward changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewardPosting {
    pub provider_reward: i64,
    pub delegate_rewards: i64,
    /// Delegate entries whose pool row does not exist
    pub missing_pools: usize,
}

fn check_non_negative(reward: &StakePoolReward) -> Result<()> {
    if reward.reward < 0 {
        return Err(IndexerError::InvariantViolation(format!(
            "negative reward {} for {} would decrease total_rewards",
            reward.reward, reward.provider_id
        )));
    }
    if let Some((pool, amount)) = reward.delegate_rewards.iter().find(|(_, a)| **a < 0) {
        return Err(IndexerError::InvariantViolation(format!(
            "negative delegate reward {} for pool {}",
            amount, pool
        )));
    }
    Ok(())
}

/// Credit a stake-pool reward to the provider and its delegate pools, and
/// record the history rows for this round
pub fn post_reward(conn: &Connection, reward: &StakePoolReward, round: i64) -> Result<RewardPosting> {
    check_non_negative(reward)?;
    let kind = reward.provider_type;

    conn.execute(
        "INSERT INTO provider_rewards (provider_id, provider_type, rewards, total_rewards, round_last_updated)
         VALUES (?1, ?2, ?3, ?3, ?4)
         ON CONFLICT(provider_id) DO UPDATE SET
             rewards = provider_rewards.rewards + excluded.rewards,
             total_rewards = provider_rewards.total_rewards + excluded.total_rewards,
             round_last_updated = excluded.round_last_updated",
        params![reward.provider_id, kind.as_str(), reward.reward, round],
    )
    .map_err(IndexerError::upsert("provider_rewards"))?;

    insert_provider_reward_row(conn, reward, reward.reward, round)?;

    let mut posting = RewardPosting {
        provider_reward: reward.reward,
        ..Default::default()
    };

    let mut credit = conn.prepare_cached(
        "UPDATE delegate_pools SET
             reward = reward + ?1,
             total_reward = total_reward + ?1,
             updated_at = ?2
         WHERE provider_id = ?3 AND provider_type = ?4 AND pool_id = ?5",
    )?;
    let ts = super::now();
    for (pool_id, amount) in &reward.delegate_rewards {
        let updated = credit.execute(params![amount, ts, reward.provider_id, kind.as_str(), pool_id])?;
        if updated == 0 {
            log::warn!(
                "⚠️  Reward for unknown delegate pool {} of {} {}",
                pool_id,
                kind,
                reward.provider_id
            );
            posting.missing_pools += 1;
        }
        insert_delegate_reward_row(conn, reward, pool_id, *amount, reward.reward_type, round)?;
        posting.delegate_rewards += amount;
    }

    Ok(posting)
}

/// Apply a stake-pool penalty; returns the total slashed from delegates
pub fn post_penalty(conn: &Connection, penalty: &StakePoolReward, round: i64) -> Result<i64> {
    let kind = penalty.provider_type;
    let mut slash = conn.prepare_cached(
        "UPDATE delegate_pools SET total_penalty = total_penalty + ?1, updated_at = ?2
         WHERE provider_id = ?3 AND provider_type = ?4 AND pool_id = ?5",
    )?;
    let ts = super::now();
    let mut total = 0;
    for (pool_id, amount) in &penalty.delegate_penalties {
        slash.execute(params![amount, ts, penalty.provider_id, kind.as_str(), pool_id])?;
        insert_delegate_reward_row(conn, penalty, pool_id, *amount, penalty.reward_type, round)?;
        total += amount;
    }

    if penalty.reward != 0 {
        insert_provider_reward_row(conn, penalty, penalty.reward, round)?;
    }
    Ok(total)
}

fn insert_provider_reward_row(conn: &Connection, reward: &StakePoolReward, amount: i64, round: i64) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO reward_providers (provider_id, provider_type, amount, block_number, reward_type, allocation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        reward.provider_id,
        reward.provider_type.as_str(),
        amount,
        round,
        reward.reward_type.as_str(),
        reward.allocation_id
    ])?;
    Ok(())
}

fn insert_delegate_reward_row(
    conn: &Connection,
    reward: &StakePoolReward,
    pool_id: &str,
    amount: i64,
    reward_type: RewardType,
    round: i64,
) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO reward_delegates (pool_id, provider_id, provider_type, amount, block_number, reward_type, allocation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        pool_id,
        reward.provider_id,
        reward.provider_type.as_str(),
        amount,
        round,
        reward_type.as_str(),
        reward.allocation_id
    ])?;
    Ok(())
}

/// Zero the uncollected rewards of a provider, whatever its kind.
///
/// The id is looked up in every provider table. Ids are expected to be unique
/// across kinds; if several tables match, every match is collected.
pub fn collect_provider_reward(conn: &Connection, provider_id: &str, round: i64) -> Result<Vec<ProviderKind>> {
    let mut kinds = Vec::new();
    for kind in ProviderKind::ALL {
        if super::providers::provider_exists(conn, kind, provider_id)? {
            kinds.push(kind);
        }
    }

    match kinds.len() {
        0 => return Err(IndexerError::not_found("provider", provider_id)),
        1 => {}
        _ => log::warn!(
            "⚠️  Provider id {} matches {} kinds, collecting all",
            provider_id,
            kinds.len()
        ),
    }

    conn.execute(
        "UPDATE provider_rewards SET rewards = 0, round_last_updated = ?1 WHERE provider_id = ?2",
        params![round, provider_id],
    )?;
    Ok(kinds)
}

pub fn insert_reward_mints(conn: &Connection, mints: &[RewardMint], round: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO reward_mints (amount, block_number, client_id, provider_id, provider_type)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for m in mints {
        let block = if m.block_number > 0 { m.block_number } else { round };
        stmt.execute(params![
            m.amount,
            block,
            m.client_id,
            m.provider_id,
            m.provider_type.as_str()
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::collections::BTreeMap;

    fn create_test_pool(conn: &Connection, provider: &str, pool: &str) {
        conn.execute(
            "INSERT INTO delegate_pools (pool_id, provider_id, provider_type, created_at, updated_at)
             VALUES (?1, ?2, 'blobber', 0, 0)",
            params![pool, provider],
        )
        .unwrap();
    }

    fn reward(provider: &str, amount: i64, delegates: &[(&str, i64)]) -> StakePoolReward {
        StakePoolReward {
            provider_id: provider.to_string(),
            provider_type: ProviderKind::Blobber,
            reward: amount,
            reward_type: RewardType::BlockReward,
            allocation_id: String::new(),
            delegate_rewards: delegates.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            delegate_penalties: BTreeMap::new(),
            desc: Vec::new(),
        }
    }

    #[test]
    fn test_post_reward_credits_provider_and_pools() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        conn.execute(
            "INSERT INTO provider_rewards (provider_id, provider_type, rewards, total_rewards) VALUES ('p1', 'blobber', 11, 23)",
            [],
        )
        .unwrap();
        create_test_pool(conn, "p1", "pool_id_1");
        create_test_pool(conn, "p1", "pool_id_2");

        let posting = post_reward(conn, &reward("p1", 17, &[("pool_id_1", 15), ("pool_id_2", 2)]), 9).unwrap();
        assert_eq!(posting.delegate_rewards, 17);
        assert_eq!(posting.missing_pools, 0);

        let (rewards, total, last): (i64, i64, i64) = conn
            .query_row(
                "SELECT rewards, total_rewards, round_last_updated FROM provider_rewards WHERE provider_id = 'p1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((rewards, total, last), (28, 40, 9));

        let pool_total: i64 = conn
            .query_row("SELECT total_reward FROM delegate_pools WHERE pool_id = 'pool_id_1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pool_total, 15);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM reward_delegates WHERE block_number = 9", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_negative_reward_is_invariant_violation() {
        let store = Store::open_in_memory().unwrap();
        let err = post_reward(store.conn(), &reward("p1", -1, &[]), 1).unwrap_err();
        assert!(matches!(err, IndexerError::InvariantViolation(_)));
    }

    #[test]
    fn test_collect_unknown_provider_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = collect_provider_reward(store.conn(), "nobody", 1).unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { .. }));
    }
}
