use super::{impl_provider, GlobalDelta, ProviderSnapshot, SnapshotBase};
use crate::provider::ProviderKind;
use rusqlite::types::Value;
use rusqlite::Row;

/// Validators carry only the common provider state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatorSnapshot {
    pub base: SnapshotBase,
}

impl_provider!(ValidatorSnapshot);

impl ProviderSnapshot for ValidatorSnapshot {
    const KIND: ProviderKind = ProviderKind::Validator;
    const EXTRA_COLUMNS: &'static [&'static str] = &[];
    const AGGREGATE_COLUMNS: &'static [(&'static str, &'static str)] = &[];

    fn base(&self) -> &SnapshotBase {
        &self.base
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            base: SnapshotBase::from_row(row)?,
        })
    }

    fn extra_values(&self) -> Vec<Value> {
        Vec::new()
    }

    fn aggregate_values(_prev: &Self, _curr: &Self) -> Vec<Value> {
        Vec::new()
    }

    fn online_contribution(&self) -> GlobalDelta {
        GlobalDelta {
            validator_count: 1,
            total_staked: self.base.total_stake,
            total_rewards: self.base.total_rewards,
            validator_total_rewards: self.base.total_rewards,
            ..Default::default()
        }
    }
}
