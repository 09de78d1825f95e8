//! Concurrent file indexer
//!
//! Builds the absolute index (one entry per record) over a log file and the
//! filtered index on top of it. Runs happen on one background thread at a
//! time and publish their result by swapping the shared [`IndexState`] when
//! they complete. A cancelled or failed run leaves the previous state alone.
//!
//! The indexer must hold the [`WriteToken`] while it reads the file. When the
//! live writer holds it, `start` defers the request and `tick` retries it.
//!
//! # Example
//!
//! ```no_run
//! use dlt_log_engine::indexer::{IndexRequest, Indexer};
//! use dlt_log_engine::{EngineConfig, WriteToken};
//!
//! let config = EngineConfig::new().with_sort_by_time(true);
//! let mut indexer = Indexer::new("trace.dlt", &config, WriteToken::new());
//! let state = indexer.run_blocking(IndexRequest::full()).unwrap();
//! println!("{} messages, {} shown", state.message_count(), state.filtered.len());
//! ```

pub mod cache;
mod index;

pub use cache::FilterIndexCache;
pub use index::{FilteredIndex, IndexEntry, IndexState};

use crate::config::{EngineConfig, FramerConfig, IndexerConfig};
use crate::control::{self, ControlCodec};
use crate::events::{self, EngineEvent, EventSender, Phase};
use crate::filter::{FilterRule, FilterSet, MessageTexts, NamedFilterSet};
use crate::framer::{decode_record, Framer, SyncMode};
use crate::lock::WriteToken;
use crate::protocol::header::StorageHeader;
use crate::protocol::service;
use crate::tree::EcuTree;
use crate::types::{DecodedMessage, DltId, EngineError, Result};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Entries replayed between two cancellation checks
const REPLAY_BATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexMode {
    None,
    /// Re-apply filters to the existing absolute index
    FilterOnly,
    /// Scan the file, then filter
    IndexAndFilter,
    /// Compute every named default filter set
    DefaultFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRequest {
    pub mode: IndexMode,
    /// Continue from the end of the previous index instead of rebuilding
    pub update: bool,
}

impl IndexRequest {
    pub fn full() -> Self {
        Self { mode: IndexMode::IndexAndFilter, update: false }
    }

    pub fn update() -> Self {
        Self { mode: IndexMode::IndexAndFilter, update: true }
    }

    pub fn filter() -> Self {
        Self { mode: IndexMode::FilterOnly, update: false }
    }

    pub fn default_filters() -> Self {
        Self { mode: IndexMode::DefaultFilter, update: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The write token is busy; retried on the next `tick`
    Deferred,
    /// Nothing to do
    Idle,
}

pub struct Indexer {
    path: PathBuf,
    config: IndexerConfig,
    framer: FramerConfig,
    token: WriteToken,
    events: Option<EventSender>,
    state: Arc<Mutex<Arc<IndexState>>>,
    filter_cache: Arc<Mutex<FilterIndexCache>>,
    filters: Vec<FilterRule>,
    active_filter: Option<String>,
    default_filters: Vec<NamedFilterSet>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    pending: Option<IndexRequest>,
}

impl Indexer {
    pub fn new(path: impl Into<PathBuf>, config: &EngineConfig, token: WriteToken) -> Self {
        Self {
            path: path.into(),
            config: config.indexer.clone(),
            framer: config.framer.clone(),
            token,
            events: None,
            state: Arc::new(Mutex::new(Arc::new(IndexState::default()))),
            filter_cache: Arc::new(Mutex::new(FilterIndexCache::new())),
            filters: Vec::new(),
            active_filter: None,
            default_filters: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            pending: None,
        }
    }

    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the active filter rules (used by the next run)
    pub fn set_filters(&mut self, rules: Vec<FilterRule>) {
        self.filters = rules;
        self.active_filter = None;
    }

    /// Make one of the default filter sets the active one
    pub fn select_default_filter(&mut self, name: &str) -> bool {
        let Some(set) = self.default_filters.iter().find(|s| s.name == name) else {
            return false;
        };
        self.filters = set.rules.clone();
        self.active_filter = Some(set.name.clone());
        true
    }

    /// Replace the default filter sets; cached results are dropped
    pub fn set_default_filters(&mut self, sets: Vec<NamedFilterSet>) {
        self.default_filters = sets;
        self.filter_cache.lock().clear();
    }

    pub fn set_filters_enabled(&mut self, enabled: bool) {
        self.config.filters_enabled = enabled;
    }

    pub fn set_sort_by_time(&mut self, enabled: bool) {
        self.config.sort_by_time = enabled;
    }

    /// Snapshot of the last published result
    pub fn state(&self) -> Arc<IndexState> {
        Arc::clone(&self.state.lock())
    }

    pub fn filter_cache_len(&self) -> usize {
        self.filter_cache.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start a run in the background. A running job is cancelled and awaited first.
    pub fn start(&mut self, request: IndexRequest) -> Result<StartOutcome> {
        if request.mode == IndexMode::None {
            return Ok(StartOutcome::Idle);
        }
        self.stop();

        let Some(guard) = self.token.try_acquire() else {
            debug!("Write token busy, deferring {:?}", request.mode);
            self.pending = Some(request);
            return Ok(StartOutcome::Deferred);
        };

        self.stop = Arc::new(AtomicBool::new(false));
        let job = self.job(request);
        let shared = Arc::clone(&self.state);
        let sender = self.events.clone();

        let worker = thread::Builder::new()
            .name("dlt-indexer".into())
            .spawn(move || {
                let _guard = guard;
                let outcome = job.run();
                complete(outcome, &shared, sender.as_ref());
            })?;
        self.worker = Some(worker);
        Ok(StartOutcome::Started)
    }

    /// Reap a finished worker and retry a deferred request
    pub fn tick(&mut self) -> Result<StartOutcome> {
        if self.worker.as_ref().is_some_and(|w| w.is_finished()) {
            self.join();
        }
        match self.pending.take() {
            Some(request) if self.worker.is_none() => self.start(request),
            Some(request) => {
                self.pending = Some(request);
                Ok(StartOutcome::Deferred)
            }
            None => Ok(StartOutcome::Idle),
        }
    }

    /// Cancel any running or deferred run and wait for it to end.
    /// Does nothing when idle.
    pub fn stop(&mut self) {
        self.pending = None;
        if self.worker.is_some() {
            self.stop.store(true, Ordering::Relaxed);
            self.join();
        }
    }

    /// Wait for the running job without cancelling it
    pub fn wait(&mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Indexer thread panicked");
            }
        }
    }

    /// Run on the calling thread; fails with `Busy` when the write token is held
    pub fn run_blocking(&mut self, request: IndexRequest) -> Result<Arc<IndexState>> {
        if request.mode == IndexMode::None {
            return Ok(self.state());
        }
        self.stop();
        let guard = self.token.try_acquire().ok_or(EngineError::Busy)?;
        self.stop = Arc::new(AtomicBool::new(false));
        let outcome = self.job(request).run();
        complete(outcome, &self.state, self.events.as_ref());
        drop(guard);
        Ok(self.state())
    }

    fn job(&self, request: IndexRequest) -> Job {
        Job {
            path: self.path.clone(),
            request,
            config: self.config.clone(),
            framer: self.framer.clone(),
            previous: self.state(),
            filters: self.filters.clone(),
            active_filter: self.active_filter.clone(),
            default_filters: self.default_filters.clone(),
            filter_cache: Arc::clone(&self.filter_cache),
            stop: Arc::clone(&self.stop),
            events: self.events.clone(),
        }
    }

    /// Read and decode one indexed message
    pub fn read_message(&self, number: u64) -> Result<DecodedMessage> {
        let state = self.state();
        let entry = state
            .entry(number)
            .ok_or_else(|| EngineError::InvalidFrame(format!("message {} not indexed", number)))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut record = vec![0u8; entry.length as usize];
        file.read_exact(&mut record)?;
        decode_stored(&record)
    }

    /// Replay the GetLogInfo responses of the last run into `tree`
    pub fn load_contexts(&self, codec: &mut ControlCodec, tree: &mut EcuTree) -> Result<usize> {
        let state = self.state();
        let mut messages = Vec::with_capacity(state.log_info_messages.len());
        for &number in &state.log_info_messages {
            messages.push(self.read_message(number)?);
        }
        let applied = codec.load_contexts(tree, &messages);
        info!("Loaded contexts from {} GetLogInfo responses", applied);
        Ok(applied)
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_stored(record: &[u8]) -> Result<DecodedMessage> {
    let body = record
        .get(StorageHeader::SIZE..)
        .ok_or_else(|| EngineError::InvalidFrame("record shorter than storage header".into()))?;
    decode_record(body, StorageHeader::parse(record))
}

enum RunOutcome {
    Done(IndexState, Vec<Phase>),
    Failed(Vec<Phase>),
    Cancelled,
}

/// Publish a run result, then announce the finished phases in order
fn complete(outcome: RunOutcome, shared: &Mutex<Arc<IndexState>>, sender: Option<&EventSender>) {
    match outcome {
        RunOutcome::Done(state, phases) => {
            *shared.lock() = Arc::new(state);
            for phase in phases {
                events::emit(sender, EngineEvent::PhaseFinished(phase));
            }
        }
        RunOutcome::Failed(phases) => {
            for phase in phases {
                events::emit(sender, EngineEvent::PhaseFinished(phase));
            }
        }
        RunOutcome::Cancelled => {
            info!("Indexing cancelled");
            events::emit(sender, EngineEvent::Cancelled);
        }
    }
}

/// Per-message bookkeeping shared by scans and replays
struct Collector<'a> {
    active: Option<FilterSet>,
    filtered: FilteredIndex,
    log_info_messages: Vec<u64>,
    versions: Vec<(DltId, String)>,
    seen_versions: HashSet<DltId>,
    events: Option<&'a EventSender>,
}

impl<'a> Collector<'a> {
    fn new(active: Option<FilterSet>, events: Option<&'a EventSender>) -> Self {
        Self {
            active,
            filtered: FilteredIndex::new(),
            log_info_messages: Vec::new(),
            versions: Vec::new(),
            seen_versions: HashSet::new(),
            events,
        }
    }

    /// Continue from a previous state instead of starting empty
    fn resume(mut self, previous: &IndexState) -> Self {
        self.filtered = previous.filtered.clone();
        self.filtered.clear_sort();
        self.log_info_messages = previous.log_info_messages.clone();
        self.versions = previous.versions.clone();
        self.seen_versions = previous.versions.iter().map(|(ecu, _)| *ecu).collect();
        self
    }

    fn observe(&mut self, number: u64, message: &DecodedMessage) {
        if message.is_control_response() {
            match message.service_id() {
                Some(service::GET_LOG_INFO) => self.log_info_messages.push(number),
                Some(service::GET_SOFTWARE_VERSION) => {
                    if let Some(version) = control::software_version(message) {
                        let ecu = message.ecu();
                        if self.seen_versions.insert(ecu) {
                            debug!("ECU {} reports version {}", ecu, version);
                            events::emit(self.events, EngineEvent::VersionDetected { ecu, version: version.clone() });
                            self.versions.push((ecu, version));
                        }
                    }
                }
                _ => {}
            }
        }

        match &self.active {
            None => self.filtered.push(number, None),
            Some(set) => {
                let verdict = set.evaluate(message);
                if verdict.included {
                    self.filtered.push(number, verdict.marker);
                } else if let Some(color) = verdict.marker {
                    self.filtered.mark(number, color);
                }
            }
        }
    }

    fn apply(self, state: &mut IndexState) {
        state.filtered = self.filtered;
        state.log_info_messages = self.log_info_messages;
        state.versions = self.versions;
    }
}

/// Everything a run needs, owned so it can move to the worker thread
struct Job {
    path: PathBuf,
    request: IndexRequest,
    config: IndexerConfig,
    framer: FramerConfig,
    previous: Arc<IndexState>,
    filters: Vec<FilterRule>,
    active_filter: Option<String>,
    default_filters: Vec<NamedFilterSet>,
    filter_cache: Arc<Mutex<FilterIndexCache>>,
    stop: Arc<AtomicBool>,
    events: Option<EventSender>,
}

impl Job {
    fn emit(&self, event: EngineEvent) {
        events::emit(self.events.as_ref(), event);
    }

    fn cancelled(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn phases(&self) -> Vec<Phase> {
        match self.request.mode {
            IndexMode::IndexAndFilter => vec![Phase::Index, Phase::Filter],
            IndexMode::FilterOnly => vec![Phase::Filter],
            IndexMode::DefaultFilter => vec![Phase::DefaultFilter],
            IndexMode::None => Vec::new(),
        }
    }

    /// Active filter set, or None when every message passes
    fn active_set(&self) -> Option<FilterSet> {
        if !self.config.filters_enabled {
            return None;
        }
        let set = FilterSet::named(self.active_filter.clone().unwrap_or_default(), &self.filters);
        if set.is_empty() {
            None
        } else {
            Some(set)
        }
    }

    fn run(self) -> RunOutcome {
        info!(
            "Indexing {} ({:?}{})",
            self.path.display(),
            self.request.mode,
            if self.request.update { ", update" } else { "" }
        );
        self.emit(EngineEvent::ProgressText(format!("Indexing {}", self.path.display())));

        let result = fs::metadata(&self.path).map_err(EngineError::from).and_then(|metadata| {
            let size = metadata.len();
            match self.request.mode {
                IndexMode::IndexAndFilter => self.index_and_filter(size),
                IndexMode::FilterOnly => self.filter_only(size),
                IndexMode::DefaultFilter => self.default_filter(size),
                IndexMode::None => Ok(Some((*self.previous).clone())),
            }
        });

        match result {
            Ok(Some(state)) => {
                info!(
                    "Indexed {}: {} messages, {} filtered",
                    self.path.display(),
                    state.message_count(),
                    state.filtered.len()
                );
                RunOutcome::Done(state, self.phases())
            }
            Ok(None) => RunOutcome::Cancelled,
            Err(e) => {
                warn!("Indexing {} failed: {}", self.path.display(), e);
                self.emit(EngineEvent::ProgressMax(0));
                self.emit(EngineEvent::Progress(0));
                RunOutcome::Failed(self.phases())
            }
        }
    }

    fn index_and_filter(&self, size: u64) -> Result<Option<IndexState>> {
        let previous = &self.previous;
        let resume = self.request.update && !previous.entries.is_empty() && previous.indexed_end() <= size;
        if self.request.update && !resume && !previous.entries.is_empty() {
            info!("{} is shorter than its index, rebuilding", self.path.display());
        }

        let mut state = if resume { (**previous).clone() } else { IndexState::default() };
        let mut collector = Collector::new(self.active_set(), self.events.as_ref());
        if resume {
            collector = collector.resume(previous);
        }

        let cached = match (&self.config.cache_dir, resume) {
            (Some(dir), false) => cache::load(dir, &self.path, size),
            _ => None,
        };

        let completed = match cached {
            Some(entries) => {
                info!("Using cached index for {} ({} entries)", self.path.display(), entries.len());
                state.entries = Arc::new(entries);
                let entries = Arc::clone(&state.entries);
                self.replay(&entries, &mut |number: u64, message: &DecodedMessage| collector.observe(number, message))?
            }
            None => {
                let start = state.indexed_end();
                // an updated file may still be growing, so only a full scan owns its tail
                let at_end = !resume;
                let completed = self.scan(&mut state, start, size, at_end, &mut |number: u64, message: &DecodedMessage| {
                    collector.observe(number, message)
                })?;
                if completed && !resume {
                    if let Some(dir) = &self.config.cache_dir {
                        if let Err(e) = cache::store(dir, &self.path, size, &state.entries) {
                            warn!("Could not store index cache: {}", e);
                        }
                    }
                }
                completed
            }
        };
        if !completed {
            return Ok(None);
        }

        collector.apply(&mut state);
        self.sort(&mut state);
        Ok(Some(state))
    }

    fn filter_only(&self, size: u64) -> Result<Option<IndexState>> {
        let mut state = (*self.previous).clone();

        let cached = self
            .active_filter
            .as_ref()
            .and_then(|name| self.filter_cache.lock().get(name, &self.path, size).cloned());
        if let Some(filtered) = cached {
            debug!("Reusing cached filter index '{}'", self.active_filter.as_deref().unwrap_or_default());
            state.filtered = filtered;
            self.sort(&mut state);
            return Ok(Some(state));
        }

        let mut collector = Collector::new(self.active_set(), self.events.as_ref()).resume(&state);
        collector.filtered = FilteredIndex::new();
        let entries = Arc::clone(&state.entries);
        if !self.replay(&entries, &mut |number: u64, message: &DecodedMessage| collector.observe(number, message))? {
            return Ok(None);
        }

        if let Some(name) = &self.active_filter {
            self.filter_cache.lock().insert(name, &self.path, size, collector.filtered.clone());
        }
        state.filtered = collector.filtered;
        self.sort(&mut state);
        Ok(Some(state))
    }

    fn default_filter(&self, size: u64) -> Result<Option<IndexState>> {
        let mut state = (*self.previous).clone();
        let mut pending = Vec::new();
        {
            let cache = self.filter_cache.lock();
            for set in &self.default_filters {
                match cache.get(&set.name, &self.path, size) {
                    Some(hit) => {
                        state.default_filters.insert(set.name.clone(), hit.clone());
                    }
                    None => pending.push((set.compile(), FilteredIndex::new())),
                }
            }
        }

        if !pending.is_empty() {
            let entries = Arc::clone(&state.entries);
            let completed = self.replay(&entries, &mut |number: u64, message: &DecodedMessage| {
                let texts = MessageTexts::new(message);
                for (set, filtered) in pending.iter_mut() {
                    let verdict = set.evaluate_with(message, &texts);
                    if verdict.included {
                        filtered.push(number, verdict.marker);
                    }
                }
            })?;
            if !completed {
                return Ok(None);
            }

            let mut cache = self.filter_cache.lock();
            for (set, filtered) in pending {
                cache.insert(set.name(), &self.path, size, filtered.clone());
                state.default_filters.insert(set.name().to_string(), filtered);
            }
        }

        self.sort(&mut state);
        Ok(Some(state))
    }

    fn sort(&self, state: &mut IndexState) {
        let entries = Arc::clone(&state.entries);
        let views = std::iter::once(&mut state.filtered).chain(state.default_filters.values_mut());
        for filtered in views {
            if self.config.sort_by_time {
                filtered.sort_by_time(&entries);
            } else {
                filtered.clear_sort();
            }
        }
    }

    /// Frame the file from `start`, appending entries. With `at_end` the end
    /// of the file is treated as the end of input, so records behind a
    /// truncated one are recovered. Returns false when cancelled.
    fn scan(
        &self,
        state: &mut IndexState,
        start: u64,
        size: u64,
        at_end: bool,
        on_message: &mut dyn FnMut(u64, &DecodedMessage),
    ) -> Result<bool> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut framer = Framer::new(SyncMode::Storage, &self.framer).with_offset(start);
        let mut buffer = vec![0u8; self.config.chunk_size];
        let entries = Arc::make_mut(&mut state.entries);

        self.emit(EngineEvent::ProgressMax(size.saturating_sub(start)));
        let mut read_total = 0u64;
        let mut next_progress = self.config.progress_interval;

        loop {
            if self.cancelled() {
                return Ok(false);
            }
            let n = file.read(&mut buffer)?;
            if n == 0 {
                if !at_end {
                    break;
                }
                framer.end_of_input();
            } else {
                framer.push(&buffer[..n]);
            }
            while let Some((frame, message)) = framer.next_frame() {
                let number = entries.len() as u64;
                entries.push(IndexEntry {
                    offset: frame.offset,
                    length: frame.length as u32,
                    time: message.time().unwrap_or_default(),
                });
                on_message(number, &message);
            }
            if n == 0 {
                break;
            }

            read_total += n as u64;
            if read_total >= next_progress {
                self.emit(EngineEvent::Progress(read_total));
                next_progress = read_total + self.config.progress_interval;
            }
        }
        self.emit(EngineEvent::Progress(read_total));

        let stats = framer.stats();
        debug!(
            "Scan of {} done: {} messages, {} bytes skipped, {} errors, {} resyncs",
            self.path.display(),
            stats.messages,
            stats.bytes_skipped,
            stats.errors,
            stats.resyncs
        );
        Ok(true)
    }

    /// Decode already indexed records. Returns false when cancelled.
    fn replay(&self, entries: &[IndexEntry], on_message: &mut dyn FnMut(u64, &DecodedMessage)) -> Result<bool> {
        let mut reader = BufReader::with_capacity(self.config.chunk_size, File::open(&self.path)?);
        let mut position = 0u64;
        let mut record = Vec::new();

        self.emit(EngineEvent::ProgressMax(entries.len() as u64));
        for (number, entry) in entries.iter().enumerate() {
            if number % REPLAY_BATCH == 0 {
                if self.cancelled() {
                    return Ok(false);
                }
                self.emit(EngineEvent::Progress(number as u64));
            }

            if entry.offset >= position {
                reader.seek_relative((entry.offset - position) as i64)?;
            } else {
                reader.seek(SeekFrom::Start(entry.offset))?;
            }
            record.resize(entry.length as usize, 0);
            reader.read_exact(&mut record)?;
            position = entry.end();

            match decode_stored(&record) {
                Ok(message) => on_message(number as u64, &message),
                Err(e) => trace!("Skipping message {}: {}", number, e),
            }
        }
        self.emit(EngineEvent::Progress(entries.len() as u64));
        Ok(true)
    }
}
