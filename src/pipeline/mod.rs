//! # Block Pipeline
//!
//! Turns the chain's event stream into committed rounds:
//!
//! 1. Producers submit two packets per round through an `EventSink`
//! 2. `BlockAssembler` joins them and releases rounds in ascending order
//! 3. `PipelineEngine` merges the round's events and, inside one transaction,
//!    rolls partitions, dispatches every event, aggregates the round's bucket
//!    and writes the global snapshot
//! 4. Failed rounds are retried with exponential backoff; later rounds wait
//!
//! ## Module Organization
//!
//! - `assembler` - two-packet block assembly
//! - `backoff` - retry delays
//! - `config` - environment configuration
//! - `dispatcher` - tag → store handler routing
//! - `engine` - per-round transaction
//! - `ingestion` - single-writer channel task

pub mod assembler;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod ingestion;

pub use assembler::{BlockAssembler, BlockEvents, EventPacket};
pub use backoff::ExponentialBackoff;
pub use config::{ConfigError, IndexerConfig};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use engine::{BlockStatus, BlockSummary, PipelineEngine};
pub use ingestion::{
    start_pipeline_ingestion, EventSink, IngestionStats, PipelineHandle, PipelineMessage, RetrySettings,
};
