//! Typed event payloads
//!
//! Events arrive with untyped JSON `data`. At the merger boundary the data is
//! decoded into one `EventPayload` variant per tag family; handlers only ever
//! see the concrete variant. A payload may be a single object or an array of
//! objects of the same shape; both decode into a `Vec`.

use super::tags::EventTag;
use crate::error::{IndexerError, Result};
use crate::provider::ProviderKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Shape check applied after serde decoding
pub trait PayloadItem: Serialize + DeserializeOwned + Clone {
    fn check(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

fn require(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        Err(format!("missing {}", field))
    } else {
        Ok(())
    }
}

/// Fields shared by every provider kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderFields {
    pub id: String,
    pub delegate_wallet: String,
    pub min_stake: i64,
    pub max_stake: i64,
    pub num_delegates: i64,
    pub service_charge: f64,
    pub unstake_total: i64,
    pub total_stake: i64,
    pub is_killed: bool,
    pub is_shutdown: bool,
    pub last_health_check: i64,
    pub downtime: i64,
    pub creation_round: i64,
}

impl ProviderFields {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)?;
        if !(0.0..=1.0).contains(&self.service_charge) {
            return Err(format!("service_charge {} outside [0,1]", self.service_charge));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Blobber {
    #[serde(flatten)]
    pub provider: ProviderFields,
    pub base_url: String,
    pub read_price: i64,
    pub write_price: i64,
    pub capacity: i64,
    pub allocated: i64,
    pub saved_data: i64,
    pub read_data: i64,
    pub offers_total: i64,
    pub open_challenges: i64,
    pub challenges_passed: i64,
    pub challenges_completed: i64,
    pub not_available: bool,
}

impl PayloadItem for Blobber {
    fn check(&self) -> std::result::Result<(), String> {
        self.provider.check()
    }
}

/// Miner or sharder; both consensus roles carry the same fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    #[serde(flatten)]
    pub provider: ProviderFields,
    pub n2n_host: String,
    pub host: String,
    pub port: i64,
    pub path: String,
    pub short_name: String,
    pub build_tag: String,
    pub fees: i64,
}

impl PayloadItem for Node {
    fn check(&self) -> std::result::Result<(), String> {
        self.provider.check()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Validator {
    #[serde(flatten)]
    pub provider: ProviderFields,
    pub base_url: String,
    pub public_key: String,
}

impl PayloadItem for Validator {
    fn check(&self) -> std::result::Result<(), String> {
        self.provider.check()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authorizer {
    #[serde(flatten)]
    pub provider: ProviderFields,
    pub url: String,
    pub fee: i64,
    pub total_mint: i64,
    pub total_burn: i64,
}

impl PayloadItem for Authorizer {
    fn check(&self) -> std::result::Result<(), String> {
        self.provider.check()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderId {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
}

impl PayloadItem for ProviderId {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakeTotal {
    pub id: String,
    pub total_stake: i64,
}

impl PayloadItem for StakeTotal {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheck {
    pub id: String,
    pub last_health_check: i64,
    /// Seconds of downtime observed since the previous check
    pub downtime: i64,
}

impl PayloadItem for HealthCheck {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    #[default]
    BlockReward,
    FeeReward,
    ValidationReward,
    FileDownloadReward,
    ChallengePassReward,
    ChallengeSlashPenalty,
    CancellationChargeReward,
    MinLockDemandReward,
}

impl RewardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::BlockReward => "block_reward",
            RewardType::FeeReward => "fee_reward",
            RewardType::ValidationReward => "validation_reward",
            RewardType::FileDownloadReward => "file_download_reward",
            RewardType::ChallengePassReward => "challenge_pass_reward",
            RewardType::ChallengeSlashPenalty => "challenge_slash_penalty",
            RewardType::CancellationChargeReward => "cancellation_charge_reward",
            RewardType::MinLockDemandReward => "min_lock_demand_reward",
        }
    }
}

/// Reward (or penalty) paid into a provider's stake pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakePoolReward {
    pub provider_id: String,
    pub provider_type: ProviderKind,
    #[serde(default)]
    pub reward: i64,
    #[serde(default)]
    pub reward_type: RewardType,
    #[serde(default)]
    pub allocation_id: String,
    /// pool id -> amount credited to the delegate pool
    #[serde(default)]
    pub delegate_rewards: BTreeMap<String, i64>,
    /// pool id -> amount slashed from the delegate pool
    #[serde(default)]
    pub delegate_penalties: BTreeMap<String, i64>,
    #[serde(default)]
    pub desc: Vec<String>,
}

impl StakePoolReward {
    /// Provider reward plus everything credited to its delegates
    pub fn total_reward(&self) -> i64 {
        self.reward + self.delegate_rewards.values().sum::<i64>()
    }
}

impl PayloadItem for StakePoolReward {
    fn check(&self) -> std::result::Result<(), String> {
        require("provider_id", &self.provider_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    #[default]
    Active,
    Pending,
    Deleted,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Active => "active",
            PoolStatus::Pending => "pending",
            PoolStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PoolStatus::Active),
            "pending" => Some(PoolStatus::Pending),
            "deleted" => Some(PoolStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatePool {
    pub pool_id: String,
    pub provider_id: String,
    pub provider_type: ProviderKind,
    #[serde(default)]
    pub delegate_id: String,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub reward: i64,
    #[serde(default)]
    pub total_reward: i64,
    #[serde(default)]
    pub total_penalty: i64,
    #[serde(default)]
    pub status: PoolStatus,
    #[serde(default)]
    pub round_created: i64,
    #[serde(default)]
    pub staked_at: i64,
}

impl PayloadItem for DelegatePool {
    fn check(&self) -> std::result::Result<(), String> {
        require("pool_id", &self.pool_id)?;
        require("provider_id", &self.provider_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatePoolUpdate {
    pub pool_id: String,
    pub provider_id: String,
    pub provider_type: ProviderKind,
    #[serde(default)]
    pub status: Option<PoolStatus>,
    #[serde(default)]
    pub balance: Option<i64>,
}

impl PayloadItem for DelegatePoolUpdate {
    fn check(&self) -> std::result::Result<(), String> {
        require("pool_id", &self.pool_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allocation {
    pub allocation_id: String,
    pub transaction_id: String,
    pub data_shards: i64,
    pub parity_shards: i64,
    pub size: i64,
    pub expiration: i64,
    pub owner: String,
    pub owner_public_key: String,
    pub read_price_min: i64,
    pub read_price_max: i64,
    pub write_price_min: i64,
    pub write_price_max: i64,
    pub start_time: i64,
    pub finalized: bool,
    pub cancelled: bool,
    pub used_size: i64,
    pub moved_to_challenge: i64,
    pub moved_back: i64,
    pub moved_to_validators: i64,
    pub write_pool: i64,
    pub min_lock_demand: i64,
    pub file_options: i64,
    pub num_writes: i64,
    pub num_reads: i64,
    pub total_challenges: i64,
    pub open_challenges: i64,
    pub successful_challenges: i64,
    pub failed_challenges: i64,
    pub latest_closed_challenge_txn: String,
}

impl PayloadItem for Allocation {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationStakes {
    pub allocation_id: String,
    pub write_pool: i64,
    pub min_lock_demand: i64,
}

impl PayloadItem for AllocationStakes {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

/// Usage deltas for an allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationStat {
    pub allocation_id: String,
    pub used_size: i64,
    pub num_writes: i64,
    pub num_reads: i64,
    pub moved_to_challenge: i64,
    pub moved_back: i64,
    pub moved_to_validators: i64,
}

impl PayloadItem for AllocationStat {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationChallenges {
    pub allocation_id: String,
    pub open_challenges: i64,
    pub successful_challenges: i64,
    pub failed_challenges: i64,
    pub latest_closed_challenge_txn: String,
}

impl PayloadItem for AllocationChallenges {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

/// Challenge counter deltas for an allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationChallengeCount {
    pub allocation_id: String,
    pub total_challenges: i64,
    pub open_challenges: i64,
}

impl PayloadItem for AllocationChallengeCount {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationBlobberTerm {
    pub allocation_id: String,
    pub blobber_id: String,
    pub read_price: i64,
    pub write_price: i64,
    pub min_lock_demand: f64,
    pub max_offer_duration: i64,
    pub alloc_blobber_idx: i64,
}

impl PayloadItem for AllocationBlobberTerm {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)?;
        require("blobber_id", &self.blobber_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Challenge {
    pub challenge_id: String,
    pub created_at: i64,
    pub allocation_id: String,
    pub blobber_id: String,
    pub validators_id: String,
    pub seed: i64,
    pub allocation_root: String,
    pub responded: i64,
    pub passed: bool,
    pub round_created: i64,
    pub round_responded: i64,
    pub timestamp: i64,
}

impl PayloadItem for Challenge {
    fn check(&self) -> std::result::Result<(), String> {
        require("challenge_id", &self.challenge_id)
    }
}

/// Challenge outcome deltas for a blobber
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberChallenges {
    pub id: String,
    pub challenges_passed: i64,
    pub challenges_completed: i64,
}

impl PayloadItem for BlobberChallenges {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberOpenChallenges {
    pub id: String,
    pub open_challenges: i64,
}

impl PayloadItem for BlobberOpenChallenges {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberOffers {
    pub id: String,
    pub offers_total: i64,
}

impl PayloadItem for BlobberOffers {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberAllocatedSaved {
    pub id: String,
    pub allocated: i64,
    pub saved_data: i64,
    pub last_health_check: i64,
}

impl PayloadItem for BlobberAllocatedSaved {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

/// Storage usage deltas for a blobber
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobberStat {
    pub id: String,
    pub saved_data: i64,
    pub read_data: i64,
}

impl PayloadItem for BlobberStat {
    fn check(&self) -> std::result::Result<(), String> {
        require("id", &self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengePool {
    pub allocation_id: String,
    pub balance: i64,
    pub start_time: i64,
    pub expiration: i64,
    pub finalized: bool,
}

impl PayloadItem for ChallengePool {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengePoolTransfer {
    pub allocation_id: String,
    pub amount: i64,
}

impl PayloadItem for ChallengePoolTransfer {
    fn check(&self) -> std::result::Result<(), String> {
        require("allocation_id", &self.allocation_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transaction {
    pub hash: String,
    pub block_hash: String,
    pub round: i64,
    pub client_id: String,
    pub to_client_id: String,
    pub value: i64,
    pub fee: i64,
    pub nonce: i64,
    pub status: i64,
    pub txn_type: i64,
    pub transaction_data: String,
    pub created_at: i64,
}

impl PayloadItem for Transaction {
    fn check(&self) -> std::result::Result<(), String> {
        require("hash", &self.hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Block {
    pub hash: String,
    pub version: String,
    pub creation_date: i64,
    pub round: i64,
    pub miner_id: String,
    pub round_random_seed: i64,
    pub merkle_tree_root: String,
    pub state_hash: String,
    pub receipt_merkle_tree_root: String,
    pub num_txns: i64,
    pub magic_block_hash: String,
    pub prev_hash: String,
    pub signature: String,
    pub chain_id: String,
    pub running_txn_count: i64,
    pub round_timeout_count: i64,
}

impl PayloadItem for Block {
    fn check(&self) -> std::result::Result<(), String> {
        require("hash", &self.hash)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub user_id: String,
    pub txn_hash: String,
    pub balance: i64,
    pub round: i64,
    pub nonce: i64,
    pub mint_nonce: i64,
}

impl PayloadItem for User {
    fn check(&self) -> std::result::Result<(), String> {
        require("user_id", &self.user_id)
    }
}

/// Per-user amount delta (paid fees, collected rewards)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAmount {
    pub user_id: String,
    pub amount: i64,
}

impl PayloadItem for UserAmount {
    fn check(&self) -> std::result::Result<(), String> {
        require("user_id", &self.user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteMarker {
    pub client_id: String,
    pub blobber_id: String,
    pub allocation_id: String,
    pub transaction_id: String,
    pub allocation_root: String,
    pub previous_allocation_root: String,
    pub file_meta_root: String,
    pub size: i64,
    pub timestamp: i64,
    pub signature: String,
    pub block_number: i64,
    pub lookup_hash: String,
    pub name: String,
    pub content_hash: String,
    pub operation: String,
}

impl PayloadItem for WriteMarker {
    fn check(&self) -> std::result::Result<(), String> {
        require("transaction_id", &self.transaction_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadMarker {
    pub client_id: String,
    pub blobber_id: String,
    pub allocation_id: String,
    pub transaction_id: String,
    pub owner_id: String,
    pub timestamp: i64,
    pub read_counter: i64,
    pub read_size: f64,
    pub signature: String,
    pub payer_id: String,
    pub auth_ticket: String,
    pub block_number: i64,
}

impl PayloadItem for ReadMarker {
    fn check(&self) -> std::result::Result<(), String> {
        require("transaction_id", &self.transaction_id)
    }
}

/// Lock or unlock against a read, write or stake pool.
///
/// `pool_id` is the allocation for write pools and the provider for stake
/// pools; read pools are per client and ignore it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLock {
    pub client: String,
    pub pool_id: String,
    pub provider_type: Option<ProviderKind>,
    pub amount: i64,
}

impl PayloadItem for PoolLock {
    fn check(&self) -> std::result::Result<(), String> {
        require("client", &self.client)?;
        if self.amount < 0 {
            return Err(format!("negative lock amount {}", self.amount));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadPool {
    pub user_id: String,
    pub balance: i64,
}

impl PayloadItem for ReadPool {
    fn check(&self) -> std::result::Result<(), String> {
        require("user_id", &self.user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mint {
    pub minter: String,
    pub receiver: String,
    pub amount: i64,
}

impl PayloadItem for Mint {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnEvent {
    pub burner: String,
    pub amount: i64,
}

impl PayloadItem for BurnEvent {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeMint {
    pub user_id: String,
    pub mint_nonce: i64,
    pub amount: i64,
    pub signers: Vec<String>,
}

impl PayloadItem for BridgeMint {
    fn check(&self) -> std::result::Result<(), String> {
        require("user_id", &self.user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurnTicket {
    pub ethereum_address: String,
    pub hash: String,
    pub nonce: i64,
    pub amount: i64,
}

impl PayloadItem for BurnTicket {
    fn check(&self) -> std::result::Result<(), String> {
        require("hash", &self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardMint {
    pub amount: i64,
    #[serde(default)]
    pub block_number: i64,
    #[serde(default)]
    pub client_id: String,
    pub provider_id: String,
    pub provider_type: ProviderKind,
}

impl PayloadItem for RewardMint {}

impl PayloadItem for String {
    fn check(&self) -> std::result::Result<(), String> {
        require("value", self)
    }
}

/// Summation used by `additive_by_index` merging
pub trait Additive {
    /// Id the item's deltas belong to; only items with equal keys are summed
    fn key(&self) -> &str;

    fn add(&mut self, other: &Self);
}

impl Additive for StakeTotal {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.total_stake += other.total_stake;
    }
}

impl Additive for BlobberOffers {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.offers_total += other.offers_total;
    }
}

impl Additive for StakePoolReward {
    fn key(&self) -> &str {
        &self.provider_id
    }

    fn add(&mut self, other: &Self) {
        self.reward += other.reward;
        for (pool, amount) in &other.delegate_rewards {
            *self.delegate_rewards.entry(pool.clone()).or_insert(0) += amount;
        }
        for (pool, amount) in &other.delegate_penalties {
            *self.delegate_penalties.entry(pool.clone()).or_insert(0) += amount;
        }
        self.desc.extend(other.desc.iter().cloned());
    }
}

impl Additive for BlobberChallenges {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.challenges_passed += other.challenges_passed;
        self.challenges_completed += other.challenges_completed;
    }
}

impl Additive for BlobberOpenChallenges {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.open_challenges += other.open_challenges;
    }
}

impl Additive for BlobberStat {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.saved_data += other.saved_data;
        self.read_data += other.read_data;
    }
}

impl Additive for AllocationChallengeCount {
    fn key(&self) -> &str {
        &self.allocation_id
    }

    fn add(&mut self, other: &Self) {
        self.total_challenges += other.total_challenges;
        self.open_challenges += other.open_challenges;
    }
}

impl Additive for AllocationStat {
    fn key(&self) -> &str {
        &self.allocation_id
    }

    fn add(&mut self, other: &Self) {
        self.used_size += other.used_size;
        self.num_writes += other.num_writes;
        self.num_reads += other.num_reads;
        self.moved_to_challenge += other.moved_to_challenge;
        self.moved_back += other.moved_back;
        self.moved_to_validators += other.moved_to_validators;
    }
}

impl Additive for HealthCheck {
    fn key(&self) -> &str {
        &self.id
    }

    fn add(&mut self, other: &Self) {
        self.downtime += other.downtime;
        self.last_health_check = self.last_health_check.max(other.last_health_check);
    }
}

impl Additive for UserAmount {
    fn key(&self) -> &str {
        &self.user_id
    }

    fn add(&mut self, other: &Self) {
        self.amount += other.amount;
    }
}

/// Fold `more` into `acc`, summing items that share a key. Keys keep the
/// order in which they first appeared.
fn fold_into<T: Additive>(acc: &mut Vec<T>, more: Vec<T>) {
    for item in more {
        match acc.iter_mut().find(|existing| existing.key() == item.key()) {
            Some(existing) => existing.add(&item),
            None => acc.push(item),
        }
    }
}

macro_rules! payloads {
    ($($variant:ident($item:ty)),+ $(,)?) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum EventPayload {
            $($variant(Vec<$item>),)+
            /// Tags that carry nothing beyond their index
            Empty,
        }

        impl EventPayload {
            pub fn len(&self) -> usize {
                match self {
                    $(EventPayload::$variant(items) => items.len(),)+
                    EventPayload::Empty => 0,
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn variant_name(&self) -> &'static str {
                match self {
                    $(EventPayload::$variant(_) => stringify!($variant),)+
                    EventPayload::Empty => "Empty",
                }
            }

            /// Encode back to event `data`
            pub fn to_json(&self) -> Result<Value> {
                Ok(match self {
                    $(EventPayload::$variant(items) => serde_json::to_value(items)?,)+
                    EventPayload::Empty => Value::Null,
                })
            }

            /// Concatenate `other` onto `self` (append strategy)
            pub fn extend(&mut self, other: EventPayload) -> std::result::Result<(), String> {
                match (self, other) {
                    $((EventPayload::$variant(a), EventPayload::$variant(b)) => {
                        a.extend(b);
                        Ok(())
                    })+
                    (EventPayload::Empty, EventPayload::Empty) => Ok(()),
                    (a, b) => Err(format!(
                        "cannot append {} to {}",
                        b.variant_name(),
                        a.variant_name()
                    )),
                }
            }
        }
    };
}

payloads! {
    Blobbers(Blobber),
    Miners(Node),
    Sharders(Node),
    Validators(Validator),
    Authorizers(Authorizer),
    Ids(String),
    ProviderIds(ProviderId),
    StakeTotals(StakeTotal),
    HealthChecks(HealthCheck),
    StakePoolRewards(StakePoolReward),
    DelegatePools(DelegatePool),
    DelegatePoolUpdates(DelegatePoolUpdate),
    Allocations(Allocation),
    AllocationStakes(AllocationStakes),
    AllocationStats(AllocationStat),
    AllocationChallenges(AllocationChallenges),
    AllocationChallengeCounts(AllocationChallengeCount),
    AllocationTerms(AllocationBlobberTerm),
    Challenges(Challenge),
    BlobberChallenges(BlobberChallenges),
    BlobberOpenChallenges(BlobberOpenChallenges),
    BlobberOffers(BlobberOffers),
    BlobberAllocatedSaved(BlobberAllocatedSaved),
    BlobberStats(BlobberStat),
    ChallengePools(ChallengePool),
    ChallengePoolTransfers(ChallengePoolTransfer),
    Transactions(Transaction),
    Blocks(Block),
    Users(User),
    UserAmounts(UserAmount),
    WriteMarkers(WriteMarker),
    ReadMarkers(ReadMarker),
    PoolLocks(PoolLock),
    ReadPools(ReadPool),
    Mints(Mint),
    Burns(BurnEvent),
    BridgeMints(BridgeMint),
    BurnTickets(BurnTicket),
    RewardMints(RewardMint),
}

impl EventPayload {
    /// Sum `other` into `self` (additive strategy); only defined for delta payloads
    pub fn absorb(&mut self, other: EventPayload) -> std::result::Result<(), String> {
        match (self, other) {
            (EventPayload::BlobberOffers(a), EventPayload::BlobberOffers(b)) => fold_into(a, b),
            (EventPayload::StakeTotals(a), EventPayload::StakeTotals(b)) => fold_into(a, b),
            (EventPayload::StakePoolRewards(a), EventPayload::StakePoolRewards(b)) => {
                fold_into(a, b)
            }
            (EventPayload::BlobberChallenges(a), EventPayload::BlobberChallenges(b)) => {
                fold_into(a, b)
            }
            (EventPayload::BlobberOpenChallenges(a), EventPayload::BlobberOpenChallenges(b)) => {
                fold_into(a, b)
            }
            (EventPayload::BlobberStats(a), EventPayload::BlobberStats(b)) => fold_into(a, b),
            (
                EventPayload::AllocationChallengeCounts(a),
                EventPayload::AllocationChallengeCounts(b),
            ) => fold_into(a, b),
            (EventPayload::AllocationStats(a), EventPayload::AllocationStats(b)) => {
                fold_into(a, b)
            }
            (EventPayload::HealthChecks(a), EventPayload::HealthChecks(b)) => fold_into(a, b),
            (EventPayload::UserAmounts(a), EventPayload::UserAmounts(b)) => fold_into(a, b),
            (a, b) => {
                return Err(format!(
                    "{} cannot be summed with {}",
                    a.variant_name(),
                    b.variant_name()
                ))
            }
        }
        Ok(())
    }
}

fn items<T: PayloadItem>(tag: EventTag, data: &Value) -> Result<Vec<T>> {
    let decoded: Vec<T> = match data {
        Value::Array(_) => serde_json::from_value(data.clone()),
        other => serde_json::from_value(other.clone()).map(|item| vec![item]),
    }
    .map_err(|e| IndexerError::invalid_data(tag, e.to_string()))?;

    for item in &decoded {
        item.check()
            .map_err(|reason| IndexerError::invalid_data(tag, reason))?;
    }
    Ok(decoded)
}

/// Decode an event's `data` into the payload family bound to `tag`
pub fn decode(tag: EventTag, index: &str, data: &Value) -> Result<EventPayload> {
    use EventTag as T;

    let payload = match tag {
        T::AddBlobber | T::UpdateBlobber => EventPayload::Blobbers(items(tag, data)?),
        T::AddMiner | T::UpdateMiner => EventPayload::Miners(items(tag, data)?),
        T::AddSharder | T::UpdateSharder => EventPayload::Sharders(items(tag, data)?),
        T::AddOrOverwriteValidator | T::UpdateValidator => {
            EventPayload::Validators(items(tag, data)?)
        }
        T::AddAuthorizer | T::UpdateAuthorizer => EventPayload::Authorizers(items(tag, data)?),

        T::DeleteBlobber
        | T::DeleteMiner
        | T::DeleteSharder
        | T::DeleteValidator
        | T::DeleteAuthorizer
        | T::UniqueAddress => EventPayload::Ids(items(tag, data)?),

        // Only the index identifies the provider
        T::CollectProviderReward => {
            if index.is_empty() {
                return Err(IndexerError::invalid_data(tag, "missing provider id index"));
            }
            EventPayload::Ids(vec![index.to_string()])
        }

        T::KillProvider | T::ShutdownProvider => EventPayload::ProviderIds(items(tag, data)?),

        T::UpdateBlobberTotalStake
        | T::UpdateMinerTotalStake
        | T::UpdateSharderTotalStake
        | T::UpdateValidatorStakeTotal
        | T::UpdateAuthorizerTotalStake => EventPayload::StakeTotals(items(tag, data)?),

        T::MinerHealthCheck
        | T::SharderHealthCheck
        | T::BlobberHealthCheck
        | T::AuthorizerHealthCheck
        | T::ValidatorHealthCheck => EventPayload::HealthChecks(items(tag, data)?),

        T::StakePoolReward | T::StakePoolPenalty => {
            EventPayload::StakePoolRewards(items(tag, data)?)
        }
        T::AddDelegatePool => EventPayload::DelegatePools(items(tag, data)?),
        T::UpdateDelegatePool => EventPayload::DelegatePoolUpdates(items(tag, data)?),

        T::AddAllocation | T::UpdateAllocation => EventPayload::Allocations(items(tag, data)?),
        T::UpdateAllocationStakes => EventPayload::AllocationStakes(items(tag, data)?),
        T::UpdateAllocationStat => EventPayload::AllocationStats(items(tag, data)?),
        T::UpdateAllocationChallenge => EventPayload::AllocationChallenges(items(tag, data)?),
        T::AddChallengeToAllocation => EventPayload::AllocationChallengeCounts(items(tag, data)?),
        T::AddOrOverwriteAllocationBlobberTerm
        | T::UpdateAllocationBlobberTerm
        | T::DeleteAllocationBlobberTerm => EventPayload::AllocationTerms(items(tag, data)?),

        T::AddChallenge | T::UpdateChallenge => EventPayload::Challenges(items(tag, data)?),
        T::UpdateBlobberChallenge => EventPayload::BlobberChallenges(items(tag, data)?),
        T::UpdateBlobberOpenChallenges => EventPayload::BlobberOpenChallenges(items(tag, data)?),
        T::UpdateBlobberTotalOffers => EventPayload::BlobberOffers(items(tag, data)?),
        T::UpdateBlobberAllocatedSavedHealth => {
            EventPayload::BlobberAllocatedSaved(items(tag, data)?)
        }
        T::UpdateBlobberStat => EventPayload::BlobberStats(items(tag, data)?),

        T::AddOrUpdateChallengePool => EventPayload::ChallengePools(items(tag, data)?),
        T::ToChallengePool | T::FromChallengePool => {
            EventPayload::ChallengePoolTransfers(items(tag, data)?)
        }

        T::AddTransactions => EventPayload::Transactions(items(tag, data)?),
        T::AddBlock | T::FinalizeBlock => EventPayload::Blocks(items(tag, data)?),
        T::AddOrOverwriteUser => EventPayload::Users(items(tag, data)?),
        T::UpdateUserPayedFees | T::UpdateUserCollectedRewards => {
            EventPayload::UserAmounts(items(tag, data)?)
        }
        T::AddWriteMarker => EventPayload::WriteMarkers(items(tag, data)?),
        T::AddReadMarker => EventPayload::ReadMarkers(items(tag, data)?),

        T::LockStakePool
        | T::UnlockStakePool
        | T::LockWritePool
        | T::UnlockWritePool
        | T::LockReadPool
        | T::UnlockReadPool => EventPayload::PoolLocks(items(tag, data)?),
        T::InsertReadpool | T::UpdateReadpool => EventPayload::ReadPools(items(tag, data)?),

        T::AddMint => EventPayload::Mints(items(tag, data)?),
        T::Burn | T::AuthorizerBurn => EventPayload::Burns(items(tag, data)?),
        T::AddBridgeMint => EventPayload::BridgeMints(items(tag, data)?),
        T::AddBurnTicket => EventPayload::BurnTickets(items(tag, data)?),
        T::MintReward => EventPayload::RewardMints(items(tag, data)?),

        T::None => EventPayload::Empty,
    };

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_single_and_array() {
        // Test: object and array data both decode into a Vec
        let single = decode(
            EventTag::AddTransactions,
            "h1",
            &json!({"hash": "h1", "fee": 3}),
        )
        .unwrap();
        assert_eq!(single.len(), 1);

        let many = decode(
            EventTag::AddTransactions,
            "b",
            &json!([{"hash": "h1"}, {"hash": "h2", "fee": 4}]),
        )
        .unwrap();
        match many {
            EventPayload::Transactions(txs) => {
                assert_eq!(txs.len(), 2);
                assert_eq!(txs[1].fee, 4);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        // Test: wrong field types and missing keys are InvalidEventData
        let err = decode(EventTag::AddMint, "", &json!({"amount": "lots"})).unwrap_err();
        assert!(matches!(err, IndexerError::InvalidEventData { .. }));

        let err = decode(EventTag::AddBlobber, "", &json!({"capacity": 10})).unwrap_err();
        assert!(err.to_string().contains("missing id"));

        let err = decode(
            EventTag::KillProvider,
            "",
            &json!({"id": "b1", "type": "spaceship"}),
        )
        .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_collect_reward_uses_index() {
        let payload = decode(EventTag::CollectProviderReward, "p1", &Value::Null).unwrap();
        assert_eq!(payload, EventPayload::Ids(vec!["p1".to_string()]));
    }

    #[test]
    fn test_blobber_flattened_provider_fields() {
        let payload = decode(
            EventTag::AddBlobber,
            "b1",
            &json!({"id": "b1", "total_stake": 50, "capacity": 1024, "service_charge": 0.1}),
        )
        .unwrap();
        match payload {
            EventPayload::Blobbers(b) => {
                assert_eq!(b[0].provider.id, "b1");
                assert_eq!(b[0].provider.total_stake, 50);
                assert_eq!(b[0].capacity, 1024);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_absorb_stake_pool_reward() {
        // Test: rewards sum and delegate maps merge element-wise
        let a = StakePoolReward {
            provider_id: "p1".into(),
            provider_type: ProviderKind::Blobber,
            reward: 5,
            reward_type: RewardType::BlockReward,
            allocation_id: String::new(),
            delegate_rewards: BTreeMap::from([("d1".to_string(), 3)]),
            delegate_penalties: BTreeMap::new(),
            desc: vec!["a".into()],
        };
        let mut b = a.clone();
        b.reward = 7;
        b.delegate_rewards.insert("d2".into(), 1);
        b.delegate_penalties.insert("d1".into(), 2);

        let mut acc = EventPayload::StakePoolRewards(vec![a]);
        acc.absorb(EventPayload::StakePoolRewards(vec![b])).unwrap();
        match acc {
            EventPayload::StakePoolRewards(r) => {
                assert_eq!(r.len(), 1);
                assert_eq!(r[0].reward, 12);
                assert_eq!(r[0].delegate_rewards["d1"], 6);
                assert_eq!(r[0].delegate_rewards["d2"], 1);
                assert_eq!(r[0].delegate_penalties["d1"], 2);
                assert_eq!(r[0].desc.len(), 2);
                assert_eq!(r[0].total_reward(), 19);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_absorb_rejects_non_delta_payload() {
        let mut users = EventPayload::Users(vec![]);
        assert!(users.absorb(EventPayload::Users(vec![])).is_err());
    }

    #[test]
    fn test_health_check_add_keeps_latest() {
        let mut a = HealthCheck {
            id: "m1".into(),
            last_health_check: 100,
            downtime: 5,
        };
        a.add(&HealthCheck {
            id: "m1".into(),
            last_health_check: 90,
            downtime: 7,
        });
        assert_eq!(a.downtime, 12);
        assert_eq!(a.last_health_check, 100);
    }
}
