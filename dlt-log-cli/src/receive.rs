//! `receive` command: live ECU connections feeding the log file

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use dlt_log_engine::events::{self, EngineEvent};
use dlt_log_engine::{ConnectionManager, ControlOutcome, WriteToken};
use std::thread;
use std::time::{Duration, Instant};

/// Pause between two polls
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Auto-reconnect tick period
const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub fn run(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    if config.ecus.is_empty() {
        bail!("no [[ecus]] configured");
    }

    let (sender, receiver) = events::channel();
    let mut manager = ConnectionManager::new(&config.engine, WriteToken::new())
        .context("Failed to open the live log file")?
        .with_events(sender);
    for ecu in &config.ecus {
        manager.add_ecu(ecu.clone());
    }
    manager.connect_all()?;

    let started = Instant::now();
    let mut last_tick = Instant::now();
    while duration.map_or(true, |d| started.elapsed() < d) {
        for (node, outcome) in manager.poll()? {
            let ecu = manager.tree().ecu(node).map(|e| e.id.to_string()).unwrap_or_default();
            report(&ecu, &outcome);
        }

        for event in receiver.try_iter() {
            if let EngineEvent::ConnectionChanged { ecu, state, online } = event {
                log::info!("ECU {} is {:?} (online: {})", ecu, state, online);
            }
        }

        if last_tick.elapsed() >= TICK_INTERVAL {
            manager.tick()?;
            last_tick = Instant::now();
        }
        thread::sleep(POLL_INTERVAL);
    }

    manager.disconnect_all();
    let stats = manager.stats();
    println!(
        "Received {} bytes, {} messages ({} errors, {} resyncs, {} corrupted control messages)",
        stats.bytes_received, stats.messages, stats.errors, stats.syncs_found, stats.corrupted_control
    );
    if let Some(writer) = manager.log_writer() {
        println!("Log file: {}", writer.path().display());
        for file in writer.rotated_files() {
            println!("Rotated: {}", file.display());
        }
    }
    Ok(())
}

fn report(ecu: &str, outcome: &ControlOutcome) {
    match outcome {
        ControlOutcome::SoftwareVersion(version) => log::info!("ECU {} software version: {}", ecu, version),
        ControlOutcome::Timezone { offset_seconds, is_dst } => {
            log::info!("ECU {} timezone offset {} s (dst: {})", ecu, offset_seconds, is_dst)
        }
        ControlOutcome::LogInfo { contexts, .. } => log::info!("ECU {} reported {} contexts", ecu, contexts),
        ControlOutcome::Corrupted { service_id } => {
            log::warn!("ECU {} sent a corrupted response to service 0x{:X}", ecu, service_id)
        }
        other => log::debug!("ECU {}: {:?}", ecu, other),
    }
}
