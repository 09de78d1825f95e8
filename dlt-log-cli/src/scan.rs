//! `scan` command: frame a capture and count what comes out

use anyhow::Result;
use dlt_log_engine::{DecodedMessage, Framer, FramerConfig, FramerStats, SyncMode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Serialize)]
pub struct ScanStats {
    pub framer: FramerStats,
    pub control_messages: u64,
    pub verbose_messages: u64,
    /// Messages per ECU id
    pub ecus: BTreeMap<String, u64>,
    /// Log messages per level name
    pub log_levels: BTreeMap<String, u64>,
}

pub fn scan_file(path: &Path, mode: SyncMode) -> Result<ScanStats> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut framer = Framer::new(mode, &FramerConfig::default());
    let mut stats = ScanStats::default();
    let mut buffer = vec![0u8; READ_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        for message in framer.feed(&buffer[..n]) {
            stats.count(&message);
        }
    }
    for message in framer.finish() {
        stats.count(&message);
    }
    stats.framer = framer.stats();
    Ok(stats)
}

impl ScanStats {
    fn count(&mut self, message: &DecodedMessage) {
        if message.is_control() {
            self.control_messages += 1;
        }
        if message.is_verbose() {
            self.verbose_messages += 1;
        }
        *self.ecus.entry(message.ecu().to_string()).or_default() += 1;
        if let Some(info) = message.info.filter(|_| message.log_level().is_some()) {
            *self.log_levels.entry(info.subtype_name().to_string()).or_default() += 1;
        }
    }
}

pub fn print_stats(path: &Path, stats: &ScanStats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("{}", path.display());
    println!("  Bytes:     {}", stats.framer.bytes_received);
    println!("  Messages:  {}", stats.framer.messages);
    println!("  Control:   {}", stats.control_messages);
    println!("  Verbose:   {}", stats.verbose_messages);
    println!(
        "  Skipped:   {} bytes ({} resyncs, {} errors)",
        stats.framer.bytes_skipped, stats.framer.resyncs, stats.framer.errors
    );
    for (ecu, count) in &stats.ecus {
        println!("  ECU {:<4} {}", ecu, count);
    }
    for (level, count) in &stats.log_levels {
        println!("  {:<8} {}", level, count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_counts_garbage() {
        // htyp v1, no extras, length 8, 4 payload bytes
        let message = [0x20u8, 0, 0, 8, 1, 2, 3, 4];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"DLS\x01");
        bytes.extend_from_slice(&message);
        bytes.extend_from_slice(&[9, 9, 9]);
        bytes.extend_from_slice(b"DLS\x01");
        bytes.extend_from_slice(&message);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("capture.bin");
        std::fs::write(&path, &bytes).unwrap();

        let stats = scan_file(&path, SyncMode::Serial).unwrap();
        assert_eq!(stats.framer.messages, 2);
        assert_eq!(stats.framer.bytes_skipped, 3);
        assert_eq!(stats.framer.resyncs, 1);
        assert_eq!(stats.control_messages, 0);
    }
}
