//! Event indexing and analytics core for a storage-and-consensus blockchain.
//!
//! Smart-contract execution emits tagged events per round. This crate merges
//! them per block, applies them to a relational read model of providers,
//! allocations, pools, users, blocks and transactions, and maintains
//! round-robin provider snapshots, partitioned aggregates and a per-round
//! global snapshot.

pub mod aggregation;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod provider;
pub mod replay;
pub mod store;

pub use error::{IndexerError, Result};
pub use provider::ProviderKind;
