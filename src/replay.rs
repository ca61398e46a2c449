//! JSONL packet replay
//!
//! One `EventPacket` per line:
//!
//! ```text
//! {"round":12,"block_hash":"ab…","events":[{"block_number":12,"tag":10,"index":"t1","data":{…}}]}
//! ```
//!
//! Used to feed recorded chain output through the pipeline.

use crate::error::Result;
use crate::pipeline::{EventPacket, EventSink};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub packets: u64,
    pub events: u64,
    /// Lines that did not parse as a packet
    pub malformed: u64,
}

impl EventPacket {
    /// Parse a packet from a JSONL line
    pub fn from_jsonl(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Sequential reader over a packet file
pub struct PacketReader {
    lines: Lines<BufReader<File>>,
    line_no: u64,
    malformed: u64,
}

impl PacketReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        log::info!("📖 Replaying packets from: {}", path.as_ref().display());
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            malformed: 0,
        })
    }

    /// Next packet; blank and malformed lines are skipped
    pub async fn next_packet(&mut self) -> Result<Option<EventPacket>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match EventPacket::from_jsonl(line) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => {
                    self.malformed += 1;
                    log::warn!("⚠️  Skipping malformed packet on line {}: {}", self.line_no, e);
                }
            }
        }
        Ok(None)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

/// Read every packet of a file
pub async fn read_packets(path: impl AsRef<Path>) -> Result<Vec<EventPacket>> {
    let mut reader = PacketReader::open(path).await?;
    let mut packets = Vec::new();
    while let Some(packet) = reader.next_packet().await? {
        packets.push(packet);
    }
    Ok(packets)
}

/// Submit every packet of a file to `sink`, in file order
pub async fn replay_file<S: EventSink + ?Sized>(path: impl AsRef<Path>, sink: &S) -> Result<ReplayStats> {
    let mut reader = PacketReader::open(path).await?;
    let mut stats = ReplayStats::default();

    while let Some(packet) = reader.next_packet().await? {
        stats.packets += 1;
        stats.events += packet.events.len() as u64;
        sink.submit_partial(packet.round, &packet.block_hash, packet.events)
            .await?;
    }
    stats.malformed = reader.malformed();

    log::info!(
        "✅ Replay complete: {} packets, {} events ({} malformed lines)",
        stats.packets,
        stats.events,
        stats.malformed
    );
    Ok(stats)
}
