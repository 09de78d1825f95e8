//! `index` command: index files in parallel and summarize the results

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use dlt_log_engine::events::{self, EngineEvent};
use dlt_log_engine::{IndexRequest, Indexer, WriteToken};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub messages: usize,
    pub filtered: usize,
    pub markers: usize,
    pub log_info_responses: usize,
    pub versions: BTreeMap<String, String>,
    pub default_filters: BTreeMap<String, usize>,
    pub elapsed_ms: u128,
}

/// Index every file on the rayon pool; the first failure aborts the command
pub fn index_files(files: &[PathBuf], config: &AppConfig) -> Result<Vec<FileSummary>> {
    files
        .par_iter()
        .map(|path| index_file(path, config).with_context(|| format!("Failed to index {:?}", path)))
        .collect()
}

fn index_file(path: &Path, config: &AppConfig) -> Result<FileSummary> {
    if !path.is_file() {
        bail!("not a file");
    }
    let started = Instant::now();
    let (sender, receiver) = events::channel();

    // no live writer shares these files
    let mut indexer = Indexer::new(path, &config.engine, WriteToken::new()).with_events(sender);
    indexer.set_filters(config.filters.clone());
    indexer.set_default_filters(config.default_filters.clone());

    let mut state = indexer.run_blocking(IndexRequest::full())?;
    if !config.default_filters.is_empty() {
        state = indexer.run_blocking(IndexRequest::default_filters())?;
    }

    for event in receiver.try_iter() {
        match event {
            EngineEvent::VersionDetected { ecu, version } => {
                log::info!("{:?}: ECU {} runs {}", path, ecu, version)
            }
            EngineEvent::PhaseFinished(phase) => log::debug!("{:?}: {:?} finished", path, phase),
            _ => {}
        }
    }

    let markers = state
        .filtered
        .arrival_order()
        .iter()
        .filter(|m| state.filtered.marker(**m).is_some())
        .count();

    Ok(FileSummary {
        path: path.to_path_buf(),
        messages: state.message_count(),
        filtered: state.filtered.len(),
        markers,
        log_info_responses: state.log_info_messages.len(),
        versions: state.versions.iter().map(|(ecu, v)| (ecu.to_string(), v.clone())).collect(),
        default_filters: state.default_filters.iter().map(|(name, f)| (name.clone(), f.len())).collect(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}

pub fn print_summaries(summaries: &[FileSummary], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summaries)?);
        return Ok(());
    }

    for summary in summaries {
        println!("{}", summary.path.display());
        println!("  Messages:  {}", summary.messages);
        println!("  Filtered:  {} ({} marked)", summary.filtered, summary.markers);
        if summary.log_info_responses > 0 {
            println!("  GetLogInfo responses: {}", summary.log_info_responses);
        }
        for (ecu, version) in &summary.versions {
            println!("  Version {}: {}", ecu, version);
        }
        for (name, count) in &summary.default_filters {
            println!("  Default filter '{}': {}", name, count);
        }
        println!("  Took {} ms", summary.elapsed_ms);
    }
    Ok(())
}
