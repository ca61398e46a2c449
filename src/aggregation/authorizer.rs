use super::{avg, impl_provider, GlobalDelta, ProviderSnapshot, SnapshotBase};
use crate::provider::ProviderKind;
use rusqlite::types::Value;
use rusqlite::Row;

/// Bridge authorizer state; mint and burn are running totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizerSnapshot {
    pub base: SnapshotBase,
    pub fee: i64,
    pub total_mint: i64,
    pub total_burn: i64,
}

impl_provider!(AuthorizerSnapshot);

impl ProviderSnapshot for AuthorizerSnapshot {
    const KIND: ProviderKind = ProviderKind::Authorizer;
    const EXTRA_COLUMNS: &'static [&'static str] = &["fee", "total_mint", "total_burn"];
    const AGGREGATE_COLUMNS: &'static [(&'static str, &'static str)] = &[
        ("fee", "INTEGER"),
        ("total_mint", "INTEGER"),
        ("total_burn", "INTEGER"),
    ];

    fn base(&self) -> &SnapshotBase {
        &self.base
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            base: SnapshotBase::from_row(row)?,
            fee: row.get(11)?,
            total_mint: row.get(12)?,
            total_burn: row.get(13)?,
        })
    }

    fn extra_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.fee),
            Value::Integer(self.total_mint),
            Value::Integer(self.total_burn),
        ]
    }

    fn aggregate_values(prev: &Self, curr: &Self) -> Vec<Value> {
        vec![
            Value::Integer(avg(prev.fee, curr.fee)),
            Value::Integer(curr.total_mint),
            Value::Integer(curr.total_burn),
        ]
    }

    fn online_contribution(&self) -> GlobalDelta {
        GlobalDelta {
            authorizer_count: 1,
            total_staked: self.base.total_stake,
            total_rewards: self.base.total_rewards,
            authorizer_total_rewards: self.base.total_rewards,
            authorizer_total_mint: self.total_mint,
            authorizer_total_burn: self.total_burn,
            ..Default::default()
        }
    }
}
