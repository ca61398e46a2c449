//! Applies a block's merged events to the store
//!
//! Each merged event is routed by tag to one handler. Handlers write through
//! the `store` helpers and add event-driven counters (transactions, locks,
//! mint/burn...) to the block's `GlobalDelta`. Pool locks, paid fees and
//! collected rewards also feed the block's per-user aggregates, written once
//! after every handler succeeded.
//!
//! Failure policy: every handler runs. `InvalidEventData` and `NotImplemented`
//! are logged, written to the `errors` table and skipped. Any other failure is
//! logged and the first one is returned after the remaining handlers ran, so
//! the caller rolls the whole block back.

use crate::aggregation::{self, GlobalDelta};
use crate::error::{IndexerError, Result};
use crate::events::payloads::{PoolLock, RewardType, StakePoolReward};
use crate::events::{EventPayload, EventTag, MergeOutput, MergedEvent};
use crate::provider::ProviderKind;
use crate::store::providers::{AuthorizerTotal, BlobberRevenue, ProviderFlag};
use crate::store::user_aggregates::{UserAggregateBatch, UserTotalKind};
use crate::store::{allocations, chain, pools, providers, rewards};
use rusqlite::Connection;
use serde_json::Value;

/// What one block's dispatch did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DispatchReport {
    pub handled: usize,
    /// Events recorded in the errors table instead of applied
    pub skipped: usize,
    /// Blockchain-visible error events stored
    pub chain_errors: usize,
    /// Users whose aggregate row was written this round
    pub user_aggregates: usize,
    pub delta: GlobalDelta,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    aggregate_period: i64,
}

fn mismatch(event: &MergedEvent) -> IndexerError {
    IndexerError::invalid_data(
        event.tag,
        format!("unexpected payload {}", event.payload.variant_name()),
    )
}

fn error_message(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// User total a pool lock of this tag moves
fn lock_total(tag: EventTag) -> Option<UserTotalKind> {
    match tag {
        EventTag::LockReadPool | EventTag::UnlockReadPool => Some(UserTotalKind::ReadPoolTotal),
        EventTag::LockWritePool | EventTag::UnlockWritePool => Some(UserTotalKind::WritePoolTotal),
        EventTag::LockStakePool | EventTag::UnlockStakePool => Some(UserTotalKind::TotalStake),
        _ => None,
    }
}

fn lock_sign(tag: EventTag) -> i64 {
    match tag {
        EventTag::UnlockStakePool | EventTag::UnlockWritePool | EventTag::UnlockReadPool => -1,
        _ => 1,
    }
}

/// Revenue bucket a blobber reward of this type counts toward
fn revenue_for(reward_type: RewardType) -> Option<BlobberRevenue> {
    match reward_type {
        RewardType::BlockReward => Some(BlobberRevenue::Block),
        RewardType::FileDownloadReward => Some(BlobberRevenue::Read),
        RewardType::ChallengePassReward
        | RewardType::MinLockDemandReward
        | RewardType::CancellationChargeReward => Some(BlobberRevenue::Storage),
        _ => None,
    }
}

impl Dispatcher {
    pub fn new(aggregate_period: i64) -> Self {
        Self {
            aggregate_period: aggregate_period.max(1),
        }
    }

    pub fn dispatch(&self, conn: &Connection, round: i64, output: &MergeOutput) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        for event in &output.errors {
            chain::insert_error(conn, round, &event.tx_hash, &error_message(&event.data))?;
            report.chain_errors += 1;
        }

        for rejected in &output.rejected {
            log::warn!(
                "⚠️  Round {}: skipping {} (index {}): {}",
                round,
                rejected.tag.as_str(),
                rejected.index,
                rejected.reason
            );
            chain::insert_error(conn, round, &rejected.tx_hash, &rejected.reason)?;
            report.skipped += 1;
        }

        let mut users = UserAggregateBatch::new();
        let mut fatal: Option<IndexerError> = None;
        for event in &output.events {
            match self.handle(conn, round, event, &mut report.delta, &mut users) {
                Ok(()) => report.handled += 1,
                Err(e) if e.is_recoverable() => {
                    log::warn!("⚠️  Round {}: skipping {}: {}", round, event.tag.as_str(), e);
                    chain::insert_error(conn, round, &event.tx_hash, &e.to_string())?;
                    report.skipped += 1;
                }
                Err(e) => {
                    log::error!("❌ Round {}: {} failed: {}", round, event.tag.as_str(), e);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        report.user_aggregates = users.save(conn, round)?;
        Ok(report)
    }

    /// Provider rows just written: reward row, baseline snapshot and its
    /// contribution to the global metrics
    fn register(
        &self,
        conn: &Connection,
        kind: ProviderKind,
        ids: &[String],
        round: i64,
        delta: &mut GlobalDelta,
    ) -> Result<()> {
        rewards::ensure_reward_rows(conn, kind, ids, round)?;
        *delta += aggregation::seed(conn, kind, ids, round)?;
        Ok(())
    }

    fn post_rewards(&self, conn: &Connection, round: i64, items: &[StakePoolReward], delta: &mut GlobalDelta) -> Result<()> {
        for reward in items {
            let posting = rewards::post_reward(conn, reward, round)?;
            delta.mined_total += posting.delegate_rewards;

            if reward.provider_type == ProviderKind::Blobber {
                if let Some(revenue) = revenue_for(reward.reward_type) {
                    providers::add_blobber_revenue(conn, &reward.provider_id, revenue, reward.total_reward())?;
                }
            }
        }
        Ok(())
    }

    fn post_penalties(&self, conn: &Connection, round: i64, items: &[StakePoolReward]) -> Result<()> {
        for penalty in items {
            let slashed = rewards::post_penalty(conn, penalty, round)?;
            if penalty.provider_type == ProviderKind::Blobber && slashed != 0 {
                providers::add_blobber_revenue(conn, &penalty.provider_id, BlobberRevenue::Slashed, slashed)?;
            }
        }
        Ok(())
    }

    fn apply_locks(
        &self,
        conn: &Connection,
        tag: EventTag,
        locks: &[PoolLock],
        delta: &mut GlobalDelta,
        users: &mut UserAggregateBatch,
    ) -> Result<()> {
        let sign = lock_sign(tag);
        for lock in locks {
            let amount = sign * lock.amount;
            delta.client_locks += amount;
            if let Some(total) = lock_total(tag) {
                users.add(&lock.client, total, amount);
            }
            match tag {
                EventTag::LockReadPool | EventTag::UnlockReadPool => {
                    pools::adjust_read_pool(conn, &lock.client, amount)?;
                    delta.total_read_pool_locked += amount;
                }
                EventTag::LockWritePool | EventTag::UnlockWritePool => {
                    pools::adjust_write_pool(conn, &lock.pool_id, &lock.client, amount)?;
                    delta.total_write_pool_locked += amount;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle(
        &self,
        conn: &Connection,
        round: i64,
        event: &MergedEvent,
        delta: &mut GlobalDelta,
        users: &mut UserAggregateBatch,
    ) -> Result<()> {
        use EventPayload as P;
        use EventTag as T;

        let period = self.aggregate_period;

        match (event.tag, &event.payload) {
            // Provider lifecycle
            (T::AddBlobber, P::Blobbers(items)) => {
                let ids = providers::upsert_blobbers(conn, items, round, period)?;
                self.register(conn, ProviderKind::Blobber, &ids, round, delta)?;
            }
            (T::UpdateBlobber, P::Blobbers(items)) => providers::update_blobbers(conn, items)?,
            (T::AddMiner, P::Miners(items)) => {
                let ids = providers::upsert_nodes(conn, ProviderKind::Miner, items, round, period)?;
                self.register(conn, ProviderKind::Miner, &ids, round, delta)?;
            }
            (T::UpdateMiner, P::Miners(items)) => providers::update_nodes(conn, ProviderKind::Miner, items)?,
            (T::AddSharder, P::Sharders(items)) => {
                let ids = providers::upsert_nodes(conn, ProviderKind::Sharder, items, round, period)?;
                self.register(conn, ProviderKind::Sharder, &ids, round, delta)?;
            }
            (T::UpdateSharder, P::Sharders(items)) => {
                providers::update_nodes(conn, ProviderKind::Sharder, items)?
            }
            (T::AddOrOverwriteValidator, P::Validators(items)) => {
                let ids = providers::upsert_validators(conn, items, round, period)?;
                self.register(conn, ProviderKind::Validator, &ids, round, delta)?;
            }
            (T::UpdateValidator, P::Validators(items)) => providers::update_validators(conn, items)?,
            (T::AddAuthorizer, P::Authorizers(items)) => {
                let ids = providers::upsert_authorizers(conn, items, round, period)?;
                self.register(conn, ProviderKind::Authorizer, &ids, round, delta)?;
            }
            (T::UpdateAuthorizer, P::Authorizers(items)) => providers::update_authorizers(conn, items)?,

            (T::DeleteBlobber, P::Ids(ids)) => {
                providers::delete_providers(conn, ProviderKind::Blobber, ids)?;
            }
            (T::DeleteMiner, P::Ids(ids)) => {
                providers::delete_providers(conn, ProviderKind::Miner, ids)?;
            }
            (T::DeleteSharder, P::Ids(ids)) => {
                providers::delete_providers(conn, ProviderKind::Sharder, ids)?;
            }
            (T::DeleteValidator, P::Ids(ids)) => {
                providers::delete_providers(conn, ProviderKind::Validator, ids)?;
            }
            (T::DeleteAuthorizer, P::Ids(ids)) => {
                providers::delete_providers(conn, ProviderKind::Authorizer, ids)?;
            }

            (T::KillProvider, P::ProviderIds(items)) => {
                providers::set_provider_flag(conn, items, ProviderFlag::Killed)?;
            }
            (T::ShutdownProvider, P::ProviderIds(items)) => {
                providers::set_provider_flag(conn, items, ProviderFlag::Shutdown)?;
            }

            (T::UpdateBlobberTotalStake, P::StakeTotals(items)) => {
                providers::update_total_stakes(conn, ProviderKind::Blobber, items)?;
            }
            (T::UpdateMinerTotalStake, P::StakeTotals(items)) => {
                providers::update_total_stakes(conn, ProviderKind::Miner, items)?;
            }
            (T::UpdateSharderTotalStake, P::StakeTotals(items)) => {
                providers::update_total_stakes(conn, ProviderKind::Sharder, items)?;
            }
            (T::UpdateValidatorStakeTotal, P::StakeTotals(items)) => {
                providers::update_total_stakes(conn, ProviderKind::Validator, items)?;
            }
            (T::UpdateAuthorizerTotalStake, P::StakeTotals(items)) => {
                providers::update_total_stakes(conn, ProviderKind::Authorizer, items)?;
            }

            (T::BlobberHealthCheck, P::HealthChecks(items)) => {
                providers::apply_health_checks(conn, ProviderKind::Blobber, items)?;
            }
            (T::MinerHealthCheck, P::HealthChecks(items)) => {
                providers::apply_health_checks(conn, ProviderKind::Miner, items)?;
            }
            (T::SharderHealthCheck, P::HealthChecks(items)) => {
                providers::apply_health_checks(conn, ProviderKind::Sharder, items)?;
            }
            (T::ValidatorHealthCheck, P::HealthChecks(items)) => {
                providers::apply_health_checks(conn, ProviderKind::Validator, items)?;
            }
            (T::AuthorizerHealthCheck, P::HealthChecks(items)) => {
                providers::apply_health_checks(conn, ProviderKind::Authorizer, items)?;
            }

            // Blobber counters
            (T::UpdateBlobberAllocatedSavedHealth, P::BlobberAllocatedSaved(items)) => {
                providers::update_blobber_allocated_saved(conn, items)?;
            }
            (T::UpdateBlobberStat, P::BlobberStats(items)) => {
                providers::add_blobber_stats(conn, items)?;
            }
            (T::UpdateBlobberTotalOffers, P::BlobberOffers(items)) => {
                providers::add_blobber_offers(conn, items)?;
            }
            (T::UpdateBlobberOpenChallenges, P::BlobberOpenChallenges(items)) => {
                providers::add_blobber_open_challenges(conn, items)?;
            }
            (T::UpdateBlobberChallenge, P::BlobberChallenges(items)) => {
                providers::add_blobber_challenges(conn, items)?;
            }

            // Stake and rewards
            (T::StakePoolReward, P::StakePoolRewards(items)) => self.post_rewards(conn, round, items, delta)?,
            (T::StakePoolPenalty, P::StakePoolRewards(items)) => self.post_penalties(conn, round, items)?,
            (T::AddDelegatePool, P::DelegatePools(items)) => pools::upsert_delegate_pools(conn, items, round)?,
            (T::UpdateDelegatePool, P::DelegatePoolUpdates(items)) => pools::update_delegate_pools(conn, items)?,
            (T::CollectProviderReward, P::Ids(ids)) => {
                for id in ids {
                    rewards::collect_provider_reward(conn, id, round)?;
                }
            }
            (T::MintReward, P::RewardMints(items)) => rewards::insert_reward_mints(conn, items, round)?,

            // Allocations and challenges
            (T::AddAllocation, P::Allocations(items)) => allocations::upsert_allocations(conn, items, round)?,
            (T::UpdateAllocation, P::Allocations(items)) => allocations::update_allocations(conn, items, round)?,
            (T::UpdateAllocationStakes, P::AllocationStakes(items)) => {
                allocations::update_allocation_stakes(conn, items)?;
            }
            (T::UpdateAllocationStat, P::AllocationStats(items)) => {
                allocations::add_allocation_stats(conn, items)?;
            }
            (T::UpdateAllocationChallenge, P::AllocationChallenges(items)) => {
                allocations::update_allocation_challenges(conn, items)?;
            }
            (T::AddChallengeToAllocation, P::AllocationChallengeCounts(items)) => {
                allocations::add_allocation_challenge_counts(conn, items)?;
            }
            (T::AddOrOverwriteAllocationBlobberTerm, P::AllocationTerms(items)) => {
                allocations::upsert_terms(conn, items)?
            }
            (T::UpdateAllocationBlobberTerm, P::AllocationTerms(items)) => allocations::update_terms(conn, items)?,
            (T::DeleteAllocationBlobberTerm, P::AllocationTerms(items)) => {
                allocations::delete_terms(conn, items)?;
            }
            (T::AddChallenge, P::Challenges(items)) => {
                allocations::insert_challenges(conn, items)?;
            }
            (T::UpdateChallenge, P::Challenges(items)) => {
                allocations::update_challenges(conn, items)?;
            }

            // Pools
            (T::AddOrUpdateChallengePool, P::ChallengePools(items)) => pools::upsert_challenge_pools(conn, items)?,
            (T::ToChallengePool, P::ChallengePoolTransfers(items)) => {
                delta.total_challenge_pools += pools::transfer_challenge_pools(conn, items, 1)?;
            }
            (T::FromChallengePool, P::ChallengePoolTransfers(items)) => {
                delta.total_challenge_pools += pools::transfer_challenge_pools(conn, items, -1)?;
            }
            (
                T::LockStakePool
                | T::UnlockStakePool
                | T::LockWritePool
                | T::UnlockWritePool
                | T::LockReadPool
                | T::UnlockReadPool,
                P::PoolLocks(items),
            ) => self.apply_locks(conn, event.tag, items, delta, users)?,
            (T::InsertReadpool | T::UpdateReadpool, P::ReadPools(items)) => pools::upsert_read_pools(conn, items)?,

            // Chain records
            (T::AddBlock, P::Blocks(items)) => {
                chain::insert_blocks(conn, items)?;
            }
            (T::FinalizeBlock, P::Blocks(items)) => {
                delta.block_count += chain::finalize_blocks(conn, items)? as i64;
            }
            (T::AddTransactions, P::Transactions(items)) => {
                let (count, fees) = chain::insert_transactions(conn, items, round)?;
                delta.transactions_count += count;
                delta.total_txn_fee += fees;
            }
            (T::UniqueAddress, P::Ids(ids)) => delta.unique_addresses += ids.len() as i64,
            (T::AddOrOverwriteUser, P::Users(items)) => chain::upsert_users(conn, items)?,
            (T::UpdateUserPayedFees, P::UserAmounts(items)) => {
                chain::add_user_amounts(conn, chain::UserTotal::PayedFees, items, round)?;
                for item in items {
                    users.add(&item.user_id, UserTotalKind::PayedFees, item.amount);
                }
            }
            (T::UpdateUserCollectedRewards, P::UserAmounts(items)) => {
                chain::add_user_amounts(conn, chain::UserTotal::CollectedReward, items, round)?;
                for item in items {
                    users.add(&item.user_id, UserTotalKind::CollectedReward, item.amount);
                }
            }
            (T::AddWriteMarker, P::WriteMarkers(items)) => {
                chain::insert_write_markers(conn, items, round)?;
            }
            (T::AddReadMarker, P::ReadMarkers(items)) => {
                chain::insert_read_markers(conn, items, round)?;
            }

            // Supply and bridge
            (T::AddMint, P::Mints(items)) => {
                let minted: i64 = items.iter().map(|m| m.amount).sum();
                delta.total_mint += minted;
                delta.zcn_supply += minted;
            }
            (T::Burn, P::Burns(items)) => {
                delta.zcn_supply -= items.iter().map(|b| b.amount).sum::<i64>();
            }
            (T::AuthorizerBurn, P::Burns(items)) => {
                let burns: Vec<(String, i64)> = items.iter().map(|b| (b.burner.clone(), b.amount)).collect();
                providers::add_authorizer_totals(conn, AuthorizerTotal::Burn, &burns)?;
            }
            (T::AddBridgeMint, P::BridgeMints(items)) => {
                let mut signed = Vec::new();
                for mint in items {
                    chain::set_mint_nonce(conn, &mint.user_id, mint.mint_nonce, round)?;
                    signed.extend(mint.signers.iter().map(|s| (s.clone(), mint.amount)));
                }
                providers::add_authorizer_totals(conn, AuthorizerTotal::Mint, &signed)?;
            }
            (T::AddBurnTicket, P::BurnTickets(items)) => chain::upsert_burn_tickets(conn, items, round)?,

            (T::None, _) => {
                return Err(IndexerError::NotImplemented(format!(
                    "no handler for tag None (index {})",
                    event.index
                )))
            }

            _ => return Err(mismatch(event)),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{merge_block, Event};
    use crate::store::Store;
    use serde_json::json;

    fn dispatch(store: &Store, round: i64, events: &[Event]) -> Result<DispatchReport> {
        let output = merge_block("hash", events);
        Dispatcher::new(10).dispatch(store.conn(), round, &output)
    }

    fn create_test_blobber_event(round: i64, id: &str, stake: i64) -> Event {
        Event::new(
            round,
            EventTag::AddBlobber,
            id,
            json!({"id": id, "total_stake": stake, "capacity": 1 << 30, "write_price": 1}),
        )
    }

    #[test]
    fn test_transactions_feed_counters() {
        let store = Store::open_in_memory().unwrap();
        let events = vec![
            Event::new(1, EventTag::AddTransactions, "t1", json!({"hash": "t1", "fee": 3})),
            Event::new(1, EventTag::AddTransactions, "t2", json!({"hash": "t2", "fee": 4})),
            Event::new(1, EventTag::UniqueAddress, "c1", json!("c1")),
        ];
        let report = dispatch(&store, 1, &events).unwrap();
        assert_eq!(report.delta.transactions_count, 2);
        assert_eq!(report.delta.total_txn_fee, 7);
        assert_eq!(report.delta.unique_addresses, 1);
    }

    #[test]
    fn test_registration_applies_contribution() {
        let store = Store::open_in_memory().unwrap();
        let report = dispatch(
            &store,
            1,
            &[
                create_test_blobber_event(1, "b1", 10),
                create_test_blobber_event(1, "b2", 20),
            ],
        )
        .unwrap();
        assert_eq!(report.delta.blobber_count, 2);
        assert_eq!(report.delta.total_staked, 30);

        // Re-registering an existing blobber adds nothing
        let report = dispatch(&store, 2, &[create_test_blobber_event(2, "b1", 10)]).unwrap();
        assert!(report.delta.is_zero());
    }

    #[test]
    fn test_invalid_payload_is_recorded_and_skipped() {
        // Test: a bad payload lands in the errors table, siblings still apply
        let store = Store::open_in_memory().unwrap();
        let events = vec![
            Event::new(3, EventTag::AddMint, "", json!({"amount": "many"})).with_tx_hash("bad"),
            Event::new(3, EventTag::AddMint, "", json!({"amount": 5})),
            Event::error(3, "failed-tx", "insufficient balance"),
        ];
        let report = dispatch(&store, 3, &events).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.chain_errors, 1);
        assert_eq!(report.delta.total_mint, 5);

        let q = store.queries();
        assert_eq!(q.errors_by_tx("bad").unwrap().len(), 1);
        assert_eq!(q.errors_by_tx("failed-tx").unwrap()[0].error, "insufficient balance");
    }

    #[test]
    fn test_none_tag_not_implemented() {
        let store = Store::open_in_memory().unwrap();
        let report = dispatch(&store, 1, &[Event::new(1, EventTag::None, "x", Value::Null)]).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.handled, 0);
    }

    #[test]
    fn test_missing_allocation_fails_block() {
        // Test: NotFound is fatal, but sibling handlers still ran
        let store = Store::open_in_memory().unwrap();
        let events = vec![
            Event::new(
                2,
                EventTag::AddOrOverwriteAllocationBlobberTerm,
                "a-missing",
                json!({"allocation_id": "a-missing", "blobber_id": "b1"}),
            ),
            Event::new(2, EventTag::UniqueAddress, "c1", json!("c1")),
        ];
        let err = dispatch(&store, 2, &events).unwrap_err();
        assert!(matches!(err, IndexerError::NotFound { entity: "allocation", .. }));
    }

    #[test]
    fn test_blobber_revenue_attribution() {
        let store = Store::open_in_memory().unwrap();
        dispatch(&store, 1, &[create_test_blobber_event(1, "b1", 10)]).unwrap();

        let rewards = vec![
            Event::new(
                2,
                EventTag::StakePoolReward,
                "b1",
                json!({"provider_id": "b1", "provider_type": "blobber", "reward": 5,
                       "reward_type": "file_download_reward", "delegate_rewards": {"p1": 3}}),
            ),
        ];
        let report = dispatch(&store, 2, &rewards).unwrap();
        assert_eq!(report.delta.mined_total, 3);

        let read_income: i64 = store
            .conn()
            .query_row("SELECT total_read_income FROM blobbers WHERE id = 'b1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(read_income, 8);
    }

    #[test]
    fn test_pool_locks_adjust_counters() {
        let store = Store::open_in_memory().unwrap();
        let events = vec![
            Event::new(1, EventTag::LockWritePool, "a1", json!({"client": "u1", "pool_id": "a1", "amount": 40})),
            Event::new(1, EventTag::UnlockWritePool, "a1", json!({"client": "u1", "pool_id": "a1", "amount": 15})),
            Event::new(1, EventTag::LockStakePool, "b1", json!({"client": "u1", "pool_id": "b1", "amount": 5})),
        ];
        let report = dispatch(&store, 1, &events).unwrap();
        assert_eq!(report.delta.client_locks, 30);
        assert_eq!(report.delta.total_write_pool_locked, 25);
        assert_eq!(report.delta.total_read_pool_locked, 0);
    }

    #[test]
    fn test_user_aggregates_follow_locks_fees_and_rewards() {
        let store = Store::open_in_memory().unwrap();
        let first = vec![
            Event::new(1, EventTag::LockReadPool, "u1", json!({"client": "u1", "amount": 12})),
            Event::new(1, EventTag::LockWritePool, "a1", json!({"client": "u1", "pool_id": "a1", "amount": 40})),
            Event::new(1, EventTag::LockStakePool, "b1", json!({"client": "u2", "pool_id": "b1", "amount": 5})),
            Event::new(1, EventTag::UpdateUserPayedFees, "u1", json!({"user_id": "u1", "amount": 3})),
        ];
        let report = dispatch(&store, 1, &first).unwrap();
        assert_eq!(report.user_aggregates, 2);

        let second = vec![
            Event::new(2, EventTag::UnlockWritePool, "a1", json!({"client": "u1", "pool_id": "a1", "amount": 15})),
            Event::new(2, EventTag::UnlockStakePool, "b1", json!({"client": "u2", "pool_id": "b1", "amount": 5})),
            Event::new(2, EventTag::UpdateUserCollectedRewards, "u1", json!({"user_id": "u1", "amount": 9})),
        ];
        dispatch(&store, 2, &second).unwrap();

        let q = store.queries();
        let u1 = q.user_aggregate("u1").unwrap().unwrap();
        assert_eq!(
            (u1.round, u1.read_pool_total, u1.write_pool_total, u1.payed_fees, u1.collected_reward),
            (2, 12, 25, 3, 9)
        );
        let u2 = q.user_aggregate("u2").unwrap().unwrap();
        assert_eq!(u2.total_stake, 0);
        assert_eq!(q.user_aggregates_in_range("u2", 1, 1).unwrap()[0].total_stake, 5);
    }

    #[test]
    fn test_failed_block_writes_no_user_aggregates() {
        let store = Store::open_in_memory().unwrap();
        let events = vec![
            Event::new(1, EventTag::LockReadPool, "u1", json!({"client": "u1", "amount": 12})),
            Event::new(
                1,
                EventTag::UpdateAllocationBlobberTerm,
                "missing",
                json!({"allocation_id": "missing", "blobber_id": "b1"}),
            ),
        ];
        assert!(dispatch(&store, 1, &events).is_err());
        assert!(store.queries().user_aggregate("u1").unwrap().is_none());
    }
}
