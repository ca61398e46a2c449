//! Indexer Runtime
//!
//! - Opens the SQLite database and applies the schema
//! - Creates the PipelineEngine (resuming after the last committed round)
//! - Spawns the single-writer ingestion task
//! - Optionally replays a JSONL packet file into the pipeline
//!
//! Usage:
//!   cargo run --release --bin indexer_runtime
//!
//! Environment variables: see `IndexerConfig::from_env`

use chain_indexer::pipeline::{
    start_pipeline_ingestion, EventSink, IndexerConfig, PipelineEngine, PipelineHandle, RetrySettings,
};
use chain_indexer::replay::replay_file;
use chain_indexer::store::Store;
use dotenv::dotenv;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Indexer Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = IndexerConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Aggregate period: {} rounds", config.aggregate_period);
    info!(
        "   ├─ Partitions: {} rounds each, keep {}",
        config.partition_change_period, config.partition_keep_count
    );
    info!(
        "   ├─ Slow tablespace: {}",
        config.slow_tablespace.as_deref().unwrap_or("disabled")
    );
    info!("   ├─ Channel buffer: {} packets", config.channel_buffer);
    info!("   └─ Query timeout: {}ms", config.query_timeout_ms);

    info!("🔧 Initializing database...");
    let store = Store::open(&config.db_path, &config.store_options())?;
    info!("✅ Database initialized");

    let engine = Arc::new(Mutex::new(PipelineEngine::new(store, &config)?));
    info!("✅ PipelineEngine created");

    let (handle, rx) = PipelineHandle::channel(config.channel_buffer);

    let engine_ingestion = engine.clone();
    let retry = RetrySettings::from(&config);
    let ingestion = tokio::spawn(async move { start_pipeline_ingestion(rx, engine_ingestion, retry).await });
    info!("   └─ ✅ Ingestion task spawned");

    if let Some(path) = config.replay_path.clone() {
        let sink = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = replay_file(&path, &sink).await {
                error!("❌ Replay of {} failed: {}", path, e);
            }
        });
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // Release a half-received round, then close the channel
    if let Err(e) = handle.flush().await {
        warn!("⚠️  Final flush not delivered: {}", e);
    }
    drop(handle);

    let stats = ingestion.await?;
    info!("📊 Ingestion summary");
    info!("   ├─ Packets: {}", stats.packets);
    info!("   ├─ Blocks committed: {}", stats.blocks_committed);
    info!("   ├─ Blocks already applied: {}", stats.blocks_skipped);
    info!("   ├─ Retries: {}", stats.retries);
    info!("   └─ Unapplied rounds: {}", stats.unapplied_rounds);

    info!("✅ Indexer runtime stopped");
    Ok(())
}
