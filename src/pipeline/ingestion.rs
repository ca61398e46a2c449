//! Pipeline ingestion - single-writer task draining the packet channel
//!
//! Producers submit half-blocks through an `EventSink`. The ingestion task
//! assembles them into rounds and applies each round through the
//! `PipelineEngine`, strictly in order. A round that fails stays at the head of
//! the queue and is retried with exponential backoff; nothing behind it is
//! applied until it commits, and no packets are taken off the channel while it
//! waits.

use super::assembler::{BlockAssembler, BlockEvents, EventPacket};
use super::backoff::ExponentialBackoff;
use super::config::IndexerConfig;
use super::engine::{BlockStatus, PipelineEngine};
use crate::error::{IndexerError, Result};
use crate::events::Event;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Duration, Instant};

const STATS_INTERVAL_SECS: u64 = 10;

#[derive(Debug)]
pub enum PipelineMessage {
    Packet(EventPacket),
    /// Release the current round even if its second packet never arrived
    Flush,
}

/// Inbound event stream
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one of the two packets of `round`
    async fn submit_partial(&self, round: i64, block_hash: &str, events: Vec<Event>) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}

/// Producer side of the bounded packet channel
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineMessage>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<PipelineMessage>) -> Self {
        Self { tx }
    }

    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<PipelineMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    async fn send(&self, message: PipelineMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| IndexerError::ChannelClosed)
    }
}

#[async_trait]
impl EventSink for PipelineHandle {
    async fn submit_partial(&self, round: i64, block_hash: &str, events: Vec<Event>) -> Result<()> {
        self.send(PipelineMessage::Packet(EventPacket {
            round,
            block_hash: block_hash.to_string(),
            events,
        }))
        .await
    }

    async fn flush(&self) -> Result<()> {
        self.send(PipelineMessage::Flush).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    /// Failed attempts tolerated after the channel closed before giving up
    pub shutdown_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 10_000,
            shutdown_attempts: 3,
        }
    }
}

impl From<&IndexerConfig> for RetrySettings {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            initial_ms: config.retry_initial_ms,
            max_ms: config.retry_max_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionStats {
    pub packets: u64,
    pub blocks_committed: u64,
    /// Rounds that were already committed before they arrived
    pub blocks_skipped: u64,
    pub events: u64,
    pub retries: u64,
    /// Rounds never applied because ingestion stopped first
    pub unapplied_rounds: usize,
}

fn lock(engine: &Mutex<PipelineEngine>) -> Result<MutexGuard<'_, PipelineEngine>> {
    engine
        .lock()
        .map_err(|_| IndexerError::InvariantViolation("pipeline engine lock poisoned".to_string()))
}

/// Apply queued rounds in order; the failing round stays at the head
fn apply_pending(
    engine: &Mutex<PipelineEngine>,
    pending: &mut VecDeque<BlockEvents>,
    backoff: &mut ExponentialBackoff,
    stats: &mut IngestionStats,
) -> std::result::Result<(), (i64, IndexerError)> {
    let mut guard = lock(engine).map_err(|e| (-1, e))?;
    while let Some(block) = pending.front() {
        match guard.process_block(block) {
            Ok(BlockStatus::Committed(summary)) => {
                stats.blocks_committed += 1;
                stats.events += summary.events as u64;
            }
            Ok(BlockStatus::AlreadyApplied) => stats.blocks_skipped += 1,
            Err(e) => return Err((block.round, e)),
        }
        pending.pop_front();
        backoff.reset();
    }
    Ok(())
}

/// Release everything the assembler can still produce
fn drain_assembler(assembler: &mut BlockAssembler, pending: &mut VecDeque<BlockEvents>) {
    loop {
        let blocks = assembler.flush();
        if blocks.is_empty() {
            break;
        }
        pending.extend(blocks);
    }
}

/// Start the single-writer ingestion loop
///
/// Runs until the channel is closed and every assembled round has been
/// applied, or until a round keeps failing after shutdown.
pub async fn start_pipeline_ingestion(
    mut rx: mpsc::Receiver<PipelineMessage>,
    engine: Arc<Mutex<PipelineEngine>>,
    retry: RetrySettings,
) -> IngestionStats {
    let mut stats = IngestionStats::default();

    let next_round = match lock(&engine) {
        Ok(guard) => guard.last_committed_round().map(|r| r + 1),
        Err(e) => {
            log::error!("❌ Cannot start ingestion: {}", e);
            return stats;
        }
    };

    log::info!("🚀 Starting pipeline ingestion");
    log::info!(
        "   ├─ Next round: {}",
        next_round.map_or_else(|| "first received".to_string(), |r| r.to_string())
    );
    log::info!("   └─ Retry backoff: {}ms..{}ms", retry.initial_ms, retry.max_ms);

    let mut assembler = BlockAssembler::new(next_round);
    let mut pending: VecDeque<BlockEvents> = VecDeque::new();
    let mut backoff = ExponentialBackoff::new(retry.initial_ms, retry.max_ms);
    let mut retry_at: Option<Instant> = None;
    let mut closed = false;
    let mut shutdown_failures = 0u32;

    let mut stats_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));
    let mut window_start = Instant::now();
    let mut window_blocks = 0u64;

    loop {
        if retry_at.is_none() && !pending.is_empty() {
            let before = stats.blocks_committed;
            match apply_pending(&engine, &mut pending, &mut backoff, &mut stats) {
                Ok(()) => {}
                Err((round, e)) => {
                    let delay = backoff.next_delay();
                    stats.retries += 1;
                    if closed {
                        shutdown_failures += 1;
                    }
                    log::warn!(
                        "⚠️  Round {} failed (attempt {}): {} - retrying in {}ms",
                        round,
                        backoff.attempts(),
                        e,
                        delay.as_millis()
                    );
                    retry_at = Some(Instant::now() + delay);
                }
            }
            window_blocks += stats.blocks_committed - before;
        }

        if closed {
            if pending.is_empty() {
                break;
            }
            if shutdown_failures >= retry.shutdown_attempts {
                log::error!(
                    "❌ Giving up on round {} after {} attempts during shutdown",
                    pending.front().map_or(-1, |b| b.round),
                    backoff.attempts()
                );
                break;
            }
        }

        // A failing head round stops intake so producers block on the bounded
        // channel; once every sender is gone the rest is drained for shutdown
        let accepting = !closed && (retry_at.is_none() || rx.is_closed());

        tokio::select! {
            message = rx.recv(), if accepting => match message {
                Some(PipelineMessage::Packet(packet)) => {
                    stats.packets += 1;
                    pending.extend(assembler.push(packet));
                }
                Some(PipelineMessage::Flush) => pending.extend(assembler.flush()),
                None => {
                    log::warn!("⚠️  Packet channel closed, draining pipeline");
                    closed = true;
                    drain_assembler(&mut assembler, &mut pending);
                }
            },

            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                retry_at = None;
            }

            _ = stats_timer.tick() => {
                let elapsed = window_start.elapsed().as_secs_f64();
                if window_blocks > 0 || !pending.is_empty() {
                    log::info!(
                        "📊 Ingestion rate: {:.1} blocks/sec (committed: {}) | pending: {} | buffered rounds: {} | channel: {}/{}",
                        window_blocks as f64 / elapsed.max(f64::EPSILON),
                        stats.blocks_committed,
                        pending.len(),
                        assembler.pending_rounds(),
                        rx.len(),
                        rx.max_capacity()
                    );
                }
                window_start = Instant::now();
                window_blocks = 0;
            }
        }
    }

    stats.unapplied_rounds = pending.len() + assembler.pending_rounds();
    if stats.unapplied_rounds > 0 {
        log::error!("❌ Ingestion stopped with {} unapplied rounds", stats.unapplied_rounds);
    }
    log::info!(
        "✅ Pipeline ingestion stopped ({} blocks committed, {} retries)",
        stats.blocks_committed,
        stats.retries
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventTag;
    use crate::store::Store;
    use serde_json::json;

    fn create_test_engine() -> Arc<Mutex<PipelineEngine>> {
        let store = Store::open_in_memory().unwrap();
        Arc::new(Mutex::new(PipelineEngine::new(store, &IndexerConfig::default()).unwrap()))
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            initial_ms: 5,
            max_ms: 20,
            shutdown_attempts: 3,
        }
    }

    fn create_test_txn(round: i64, hash: &str, fee: i64) -> Event {
        Event::new(round, EventTag::AddTransactions, hash, json!({"hash": hash, "fee": fee}))
    }

    #[tokio::test]
    async fn test_ingestion_commits_rounds_in_order() {
        // Test: packets for two rounds, second round first
        let engine = create_test_engine();
        let (handle, rx) = PipelineHandle::channel(16);
        let task = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), fast_retry()));

        handle.submit_partial(1, "h1", vec![create_test_txn(1, "a", 1)]).await.unwrap();
        handle.submit_partial(2, "h2", vec![create_test_txn(2, "c", 4)]).await.unwrap();
        handle.submit_partial(2, "h2", vec![]).await.unwrap();
        handle.submit_partial(1, "h1", vec![create_test_txn(1, "b", 2)]).await.unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.blocks_committed, 2);
        assert_eq!(stats.unapplied_rounds, 0);

        let guard = engine.lock().unwrap();
        let q = guard.store().queries();
        assert_eq!(q.global_at(1).unwrap().unwrap().total_txn_fee, 3);
        assert_eq!(q.global_at(2).unwrap().unwrap().total_txn_fee, 7);
    }

    #[tokio::test]
    async fn test_flush_releases_single_packet_round() {
        let engine = create_test_engine();
        let (handle, rx) = PipelineHandle::channel(16);
        let task = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), fast_retry()));

        handle.submit_partial(5, "h5", vec![create_test_txn(5, "a", 1)]).await.unwrap();
        handle.flush().await.unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.blocks_committed, 1);
        assert_eq!(engine.lock().unwrap().last_committed_round(), Some(5));
    }

    #[tokio::test]
    async fn test_failed_round_retried_until_it_commits() {
        // Test: a round blocked on a missing allocation commits once it exists
        let engine = create_test_engine();
        let (handle, rx) = PipelineHandle::channel(16);
        let task = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), fast_retry()));

        let term = Event::new(
            1,
            EventTag::AddOrOverwriteAllocationBlobberTerm,
            "a1",
            json!({"allocation_id": "a1", "blobber_id": "b1", "write_price": 3}),
        );
        handle.submit_partial(1, "h1", vec![term]).await.unwrap();
        handle.submit_partial(1, "h1", vec![]).await.unwrap();
        handle.submit_partial(2, "h2", vec![create_test_txn(2, "t", 1)]).await.unwrap();
        handle.submit_partial(2, "h2", vec![]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        {
            let guard = engine.lock().unwrap();
            assert_eq!(guard.last_committed_round(), None);
            crate::store::allocations::upsert_allocations(
                guard.store().conn(),
                &[crate::events::payloads::Allocation {
                    allocation_id: "a1".to_string(),
                    owner: "u1".to_string(),
                    ..Default::default()
                }],
                1,
            )
            .unwrap();
        }
        drop(handle);

        let stats = task.await.unwrap();
        assert!(stats.retries >= 1);
        assert_eq!(stats.blocks_committed, 2);

        let guard = engine.lock().unwrap();
        assert_eq!(guard.last_committed_round(), Some(2));
        assert_eq!(guard.store().queries().allocation_terms("a1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_shutdown_attempts() {
        let engine = create_test_engine();
        let (handle, rx) = PipelineHandle::channel(16);
        let task = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), fast_retry()));

        let term = Event::new(
            1,
            EventTag::UpdateAllocationBlobberTerm,
            "missing",
            json!({"allocation_id": "missing", "blobber_id": "b1"}),
        );
        handle.submit_partial(1, "h1", vec![term]).await.unwrap();
        handle.submit_partial(1, "h1", vec![]).await.unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.blocks_committed, 0);
        assert_eq!(stats.unapplied_rounds, 1);
    }

    #[tokio::test]
    async fn test_producer_blocks_while_round_is_stuck() {
        // Test: channel of 2, round 1 waits for an allocation that does not exist yet
        let engine = create_test_engine();
        let (handle, rx) = PipelineHandle::channel(2);
        let task = tokio::spawn(start_pipeline_ingestion(rx, engine.clone(), fast_retry()));

        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let producer = {
            let handle = handle.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                for round in 1..=50 {
                    let events = if round == 1 {
                        vec![Event::new(
                            1,
                            EventTag::AddOrOverwriteAllocationBlobberTerm,
                            "a1",
                            json!({"allocation_id": "a1", "blobber_id": "b1"}),
                        )]
                    } else {
                        vec![create_test_txn(round, &format!("t{}", round), 1)]
                    };
                    handle.submit_partial(round, "h", events).await.unwrap();
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    handle.submit_partial(round, "h", vec![]).await.unwrap();
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Two packets assembled into round 1, two more in the channel buffer
        assert!(accepted.load(std::sync::atomic::Ordering::SeqCst) <= 4);
        assert!(!producer.is_finished());

        {
            let guard = engine.lock().unwrap();
            crate::store::allocations::upsert_allocations(
                guard.store().conn(),
                &[crate::events::payloads::Allocation {
                    allocation_id: "a1".to_string(),
                    owner: "u1".to_string(),
                    ..Default::default()
                }],
                1,
            )
            .unwrap();
        }

        producer.await.unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 100);
        assert_eq!(stats.blocks_committed, 50);
        assert_eq!(stats.unapplied_rounds, 0);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let (handle, rx) = PipelineHandle::channel(1);
        drop(rx);
        let err = handle.submit_partial(1, "h", vec![]).await.unwrap_err();
        assert!(matches!(err, IndexerError::ChannelClosed));
    }
}
