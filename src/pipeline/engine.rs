//! Pipeline Engine - applies one assembled block to the store
//!
//! ```text
//! BlockEvents
//!     ↓ merge_block()
//! MergeOutput
//!     ↓ (one transaction, bounded by the query timeout)
//! PartitionManager::on_round → Dispatcher::dispatch → aggregate_round
//!     ↓
//! GlobalSnapshot(round) = previous + event counters + contribution deltas
//! ```
//!
//! A block either commits completely or leaves no trace, so a failed block can
//! be retried as is.

use super::assembler::BlockEvents;
use super::config::IndexerConfig;
use super::dispatcher::{DispatchReport, Dispatcher};
use crate::aggregation::{self, AggregationSettings, GlobalSnapshot};
use crate::error::Result;
use crate::events::merge_block;
use crate::store::{PartitionManager, Store};
use std::time::Duration;

/// Outcome of a committed (or dry-run) block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSummary {
    pub round: i64,
    pub events: usize,
    pub merged: usize,
    pub dispatch: DispatchReport,
    pub partitions_created: usize,
    pub snapshot: GlobalSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockStatus {
    Committed(BlockSummary),
    /// The round is at or below the last committed round
    AlreadyApplied,
}

pub struct PipelineEngine {
    store: Store,
    dispatcher: Dispatcher,
    aggregation: AggregationSettings,
    partitions: PartitionManager,
    query_timeout: Duration,
    last_round: Option<i64>,
}

impl PipelineEngine {
    /// Wrap a migrated store; resumes after the newest global snapshot
    pub fn new(store: Store, config: &IndexerConfig) -> Result<Self> {
        let last_round = GlobalSnapshot::last_round(store.conn())?;
        if let Some(round) = last_round {
            log::info!("📍 Resuming after committed round {}", round);
        }
        Ok(Self {
            store,
            dispatcher: Dispatcher::new(config.aggregate_period),
            aggregation: config.aggregation(),
            partitions: config.partition_manager(),
            query_timeout: config.query_timeout(),
            last_round,
        })
    }

    pub fn last_committed_round(&self) -> Option<i64> {
        self.last_round
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Apply `block` in one transaction and commit it
    pub fn process_block(&mut self, block: &BlockEvents) -> Result<BlockStatus> {
        if let Some(last) = self.last_round {
            if block.round <= last {
                log::warn!(
                    "⚠️  Round {} already committed (last round {}), skipping",
                    block.round,
                    last
                );
                return Ok(BlockStatus::AlreadyApplied);
            }
        }

        let summary = self.apply(block, true)?;
        self.last_round = Some(block.round);

        log::debug!(
            "✅ Round {} committed: {} events → {} merged, {} skipped",
            summary.round,
            summary.events,
            summary.merged,
            summary.dispatch.skipped
        );
        Ok(BlockStatus::Committed(summary))
    }

    /// Apply `block` and roll everything back
    pub fn dry_run(&mut self, block: &BlockEvents) -> Result<BlockSummary> {
        self.apply(block, false)
    }

    fn apply(&mut self, block: &BlockEvents, commit: bool) -> Result<BlockSummary> {
        let output = merge_block(&block.block_hash, &block.events);
        let round = block.round;
        let events = block.events.len();
        let merged = output.events.len();

        let dispatcher = &self.dispatcher;
        let settings = &self.aggregation;
        let partitions = &self.partitions;

        self.store.run_in_transaction(self.query_timeout, commit, |tx| {
            let report = partitions.on_round(tx, round)?;
            for name in &report.dropped {
                log::info!("   ├─ Dropped expired partition {}", name);
            }
            for name in &report.moved {
                log::info!("   ├─ Moved partition {} to slow tablespace", name);
            }

            let dispatch = dispatcher.dispatch(tx, round, &output)?;
            let mut delta = dispatch.delta;
            delta += aggregation::aggregate_round(tx, round, settings, partitions)?;

            let previous = GlobalSnapshot::load_latest(tx)?;
            let snapshot = GlobalSnapshot::next(previous.as_ref(), round, &delta);
            snapshot.save(tx)?;

            Ok(BlockSummary {
                round,
                events,
                merged,
                dispatch,
                partitions_created: report.created.len(),
                snapshot,
            })
        })
    }
}
