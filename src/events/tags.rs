//! Closed event tag set and the per-tag merge strategy table
//!
//! Tags travel as integers on the wire. The numeric codes are stable: new tags
//! are appended, never renumbered.

use serde::{Deserialize, Serialize};

/// How events sharing a tag are collapsed within one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Last event for a given index wins
    OverwriteByIndex,
    /// Numeric fields of events sharing an index are summed
    AdditiveByIndex,
    /// All payloads are concatenated into one event
    Append,
}

macro_rules! event_tags {
    ($($name:ident = $code:literal => $strategy:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "i32", into = "i32")]
        #[repr(i32)]
        pub enum EventTag {
            $($name = $code),+
        }

        impl EventTag {
            pub const ALL: &'static [EventTag] = &[$(EventTag::$name),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(EventTag::$name => stringify!($name)),+
                }
            }

            pub fn strategy(&self) -> MergeStrategy {
                match self {
                    $(EventTag::$name => MergeStrategy::$strategy),+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(EventTag::$name),)+
                    _ => None,
                }
            }
        }
    };
}

event_tags! {
    None = 0 => Append,
    AddBlobber = 1 => OverwriteByIndex,
    UpdateBlobber = 2 => OverwriteByIndex,
    UpdateBlobberAllocatedSavedHealth = 3 => OverwriteByIndex,
    UpdateBlobberTotalStake = 4 => AdditiveByIndex,
    UpdateBlobberTotalOffers = 5 => AdditiveByIndex,
    DeleteBlobber = 6 => Append,
    AddAuthorizer = 7 => OverwriteByIndex,
    UpdateAuthorizer = 8 => OverwriteByIndex,
    DeleteAuthorizer = 9 => Append,
    AddTransactions = 10 => Append,
    AddOrOverwriteUser = 11 => OverwriteByIndex,
    AddWriteMarker = 12 => Append,
    AddBlock = 13 => OverwriteByIndex,
    FinalizeBlock = 14 => OverwriteByIndex,
    AddOrOverwriteValidator = 15 => OverwriteByIndex,
    UpdateValidator = 16 => OverwriteByIndex,
    AddReadMarker = 17 => Append,
    AddMiner = 18 => OverwriteByIndex,
    UpdateMiner = 19 => OverwriteByIndex,
    DeleteMiner = 20 => Append,
    AddSharder = 21 => OverwriteByIndex,
    UpdateSharder = 22 => OverwriteByIndex,
    DeleteSharder = 23 => Append,
    StakePoolReward = 24 => AdditiveByIndex,
    StakePoolPenalty = 25 => AdditiveByIndex,
    AddDelegatePool = 26 => OverwriteByIndex,
    UpdateDelegatePool = 27 => OverwriteByIndex,
    AddAllocation = 28 => Append,
    UpdateAllocationStakes = 29 => OverwriteByIndex,
    UpdateAllocation = 30 => OverwriteByIndex,
    MintReward = 31 => Append,
    AddChallenge = 32 => Append,
    UpdateChallenge = 33 => OverwriteByIndex,
    UpdateBlobberChallenge = 34 => AdditiveByIndex,
    UpdateAllocationChallenge = 35 => OverwriteByIndex,
    AddChallengeToAllocation = 36 => AdditiveByIndex,
    AddOrOverwriteAllocationBlobberTerm = 37 => OverwriteByIndex,
    UpdateAllocationBlobberTerm = 38 => OverwriteByIndex,
    DeleteAllocationBlobberTerm = 39 => Append,
    AddOrUpdateChallengePool = 40 => OverwriteByIndex,
    UpdateAllocationStat = 41 => AdditiveByIndex,
    UpdateBlobberStat = 42 => AdditiveByIndex,
    CollectProviderReward = 43 => Append,
    LockStakePool = 44 => Append,
    UnlockStakePool = 45 => Append,
    LockWritePool = 46 => Append,
    UnlockWritePool = 47 => Append,
    LockReadPool = 48 => Append,
    UnlockReadPool = 49 => Append,
    ToChallengePool = 50 => Append,
    FromChallengePool = 51 => Append,
    UpdateValidatorStakeTotal = 52 => OverwriteByIndex,
    UpdateMinerTotalStake = 53 => OverwriteByIndex,
    UpdateSharderTotalStake = 54 => OverwriteByIndex,
    UpdateAuthorizerTotalStake = 55 => OverwriteByIndex,
    UniqueAddress = 56 => OverwriteByIndex,
    MinerHealthCheck = 57 => AdditiveByIndex,
    SharderHealthCheck = 58 => AdditiveByIndex,
    BlobberHealthCheck = 59 => AdditiveByIndex,
    AuthorizerHealthCheck = 60 => AdditiveByIndex,
    ValidatorHealthCheck = 61 => AdditiveByIndex,
    UpdateUserPayedFees = 62 => AdditiveByIndex,
    UpdateUserCollectedRewards = 63 => AdditiveByIndex,
    AddBurnTicket = 64 => OverwriteByIndex,
    AuthorizerBurn = 65 => Append,
    AddBridgeMint = 66 => Append,
    KillProvider = 67 => Append,
    ShutdownProvider = 68 => Append,
    InsertReadpool = 69 => OverwriteByIndex,
    UpdateReadpool = 70 => OverwriteByIndex,
    UpdateBlobberOpenChallenges = 71 => AdditiveByIndex,
    AddMint = 72 => Append,
    Burn = 73 => Append,
    DeleteValidator = 74 => Append,
}

impl From<EventTag> for i32 {
    fn from(tag: EventTag) -> i32 {
        tag as i32
    }
}

impl TryFrom<i32> for EventTag {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        EventTag::from_code(code).ok_or_else(|| format!("unknown event tag {}", code))
    }
}

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
