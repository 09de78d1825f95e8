//! Live ECU connections
//!
//! The [`ConnectionManager`] owns the ECU tree and one connection per ECU.
//! It is driven from a single event context: `poll` moves bytes, `tick`
//! runs the auto-reconnect policy. Neither blocks; connects happen on a
//! short-lived thread and report back through a channel.
//!
//! Received bytes are framed per connection. Complete messages go to the
//! live log file (when the write token is free; otherwise the bytes wait in
//! the connection's buffer) and control responses go to the control codec.

pub mod link;

pub use link::{Connector, Link, SystemConnector};

use crate::config::{ConnectionConfig, EngineConfig, FramerConfig};
use crate::control::{ControlCodec, ControlOutcome, ControlRequest, EncodedRequest};
use crate::events::{self, EngineEvent, EventSender};
use crate::framer::{Framer, FramerStats, SyncMode};
use crate::lock::WriteToken;
use crate::logfile::LogWriter;
use crate::protocol::header::StorageHeader;
use crate::protocol::service;
use crate::tree::{ConnectionState, EcuNode, EcuTree, NodeId, Validity};
use crate::types::{DecodedMessage, DltId, EngineError, Result};
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

/// Link reads per connection and poll
const MAX_READS_PER_POLL: usize = 16;

/// Aggregate receive statistics over all connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub messages: u64,
    pub errors: u64,
    pub syncs_found: u64,
    pub bytes_skipped: u64,
    pub corrupted_control: u64,
}

struct Connection {
    /// Bumped on every connect/close so stale connect results are ignored
    generation: u64,
    link: Option<Box<dyn Link>>,
    framer: Framer,
    /// Received bytes not yet framed (held while the write token is busy)
    pending: Vec<u8>,
    total_bytes: u64,
    last_total_bytes: u64,
    ticks: u32,
    try_to_connect: bool,
    /// Counters of framers replaced on reconnect
    retired: FramerStats,
}

impl Connection {
    fn new(ecu: &EcuNode, framer_config: &FramerConfig) -> Self {
        Self {
            generation: 0,
            link: None,
            framer: Framer::new(sync_mode(ecu), framer_config),
            pending: Vec::new(),
            total_bytes: 0,
            last_total_bytes: 0,
            ticks: 0,
            try_to_connect: false,
            retired: FramerStats::default(),
        }
    }

    fn framer_stats(&self) -> FramerStats {
        let live = self.framer.stats();
        FramerStats {
            bytes_received: self.retired.bytes_received + live.bytes_received,
            bytes_skipped: self.retired.bytes_skipped + live.bytes_skipped,
            errors: self.retired.errors + live.errors,
            resyncs: self.retired.resyncs + live.resyncs,
            messages: self.retired.messages + live.messages,
        }
    }
}

fn sync_mode(ecu: &EcuNode) -> SyncMode {
    if ecu.interface.is_serial() || ecu.send_serial_header {
        SyncMode::Serial
    } else {
        SyncMode::Raw
    }
}

enum ConnectResult {
    Connected { node: NodeId, generation: u64, link: Box<dyn Link> },
    Failed { node: NodeId, generation: u64, error: String },
}

pub struct ConnectionManager {
    tree: EcuTree,
    codec: ControlCodec,
    config: ConnectionConfig,
    framer_config: FramerConfig,
    connector: Arc<dyn Connector>,
    connections: BTreeMap<NodeId, Connection>,
    results_tx: Sender<ConnectResult>,
    results_rx: Receiver<ConnectResult>,
    writer: Option<LogWriter>,
    token: WriteToken,
    events: Option<EventSender>,
}

impl ConnectionManager {
    /// Create a manager; opens the live log file when one is configured
    pub fn new(config: &EngineConfig, token: WriteToken) -> Result<Self> {
        let writer = match &config.connection.log_file {
            Some(path) => Some(LogWriter::open(path, config.connection.max_file_size_mb)?),
            None => None,
        };
        let (results_tx, results_rx) = mpsc::channel();
        Ok(Self {
            tree: EcuTree::new(),
            codec: ControlCodec::new(&config.connection),
            config: config.connection.clone(),
            framer_config: config.framer.clone(),
            connector: Arc::new(SystemConnector),
            connections: BTreeMap::new(),
            results_tx,
            results_rx,
            writer,
            token,
            events: None,
        })
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn tree(&self) -> &EcuTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut EcuTree {
        &mut self.tree
    }

    pub fn codec(&self) -> &ControlCodec {
        &self.codec
    }

    /// Tree and codec together, e.g. for loading contexts from a file
    pub fn tree_and_codec(&mut self) -> (&mut EcuTree, &mut ControlCodec) {
        (&mut self.tree, &mut self.codec)
    }

    pub fn log_writer(&self) -> Option<&LogWriter> {
        self.writer.as_ref()
    }

    pub fn add_ecu(&mut self, ecu: EcuNode) -> NodeId {
        let connection = Connection::new(&ecu, &self.framer_config);
        info!("Adding ECU {} ({})", ecu.id, ecu.interface);
        let node = self.tree.add_ecu(ecu);
        self.connections.insert(node, connection);
        node
    }

    pub fn remove_ecu(&mut self, node: NodeId) {
        self.disconnect(node);
        self.connections.remove(&node);
        self.tree.remove(node);
    }

    fn ecu_id(&self, node: NodeId) -> Result<DltId> {
        self.tree.ecu(node).map(|e| e.id).ok_or(EngineError::UnknownEcu)
    }

    /// Start connecting; the result arrives through `poll`
    pub fn connect(&mut self, node: NodeId) -> Result<()> {
        let ecu = self.tree.ecu(node).ok_or(EngineError::UnknownEcu)?;
        if ecu.state != ConnectionState::Disconnected {
            return Ok(());
        }
        let interface = ecu.interface.clone();
        let id = ecu.id;
        let connection = self.connections.get_mut(&node).ok_or(EngineError::UnknownEcu)?;
        connection.generation += 1;
        connection.try_to_connect = true;
        let generation = connection.generation;

        debug!("Connecting ECU {} ({})", id, interface);
        let connector = Arc::clone(&self.connector);
        let results = self.results_tx.clone();
        thread::Builder::new().name(format!("dlt-connect-{}", id)).spawn(move || {
            let result = match connector.connect(&interface) {
                Ok(link) => ConnectResult::Connected { node, generation, link },
                Err(e) => ConnectResult::Failed { node, generation, error: e.to_string() },
            };
            let _ = results.send(result);
        })?;

        self.set_state(node, ConnectionState::Connecting, false);
        Ok(())
    }

    /// Explicit disconnect; auto-reconnect will not bring the ECU back
    pub fn disconnect(&mut self, node: NodeId) {
        if let Some(connection) = self.connections.get_mut(&node) {
            connection.try_to_connect = false;
        }
        self.close(node);
    }

    pub fn connect_all(&mut self) -> Result<()> {
        let nodes: Vec<NodeId> = self.connections.keys().copied().collect();
        for node in nodes {
            self.connect(node)?;
        }
        Ok(())
    }

    pub fn disconnect_all(&mut self) {
        let nodes: Vec<NodeId> = self.connections.keys().copied().collect();
        for node in nodes {
            self.disconnect(node);
        }
    }

    /// Drop the link and invalidate the ECU's state; keeps `try_to_connect`
    fn close(&mut self, node: NodeId) {
        let Some(connection) = self.connections.get_mut(&node) else { return };
        connection.generation += 1;
        let had_link = connection.link.take().is_some();

        let was_disconnected = self
            .tree
            .ecu(node)
            .map(|e| e.state == ConnectionState::Disconnected)
            .unwrap_or(true);
        if was_disconnected && !had_link {
            return;
        }
        if let Ok(id) = self.ecu_id(node) {
            info!("ECU {} disconnected", id);
        }
        self.set_state(node, ConnectionState::Disconnected, false);
        self.tree.invalidate_all(node);
    }

    fn set_state(&mut self, node: NodeId, state: ConnectionState, online: bool) {
        let Some(ecu) = self.tree.ecu_mut(node) else { return };
        if ecu.state == state && ecu.online == online {
            return;
        }
        ecu.state = state;
        ecu.online = online;
        let event = EngineEvent::ConnectionChanged { ecu: ecu.id, state, online };
        events::emit(self.events.as_ref(), event);
    }

    /// Move bytes: finish connects, read links, frame, log and route control responses.
    /// Returns the control outcomes that were not ignored.
    pub fn poll(&mut self) -> Result<Vec<(NodeId, ControlOutcome)>> {
        self.drain_connect_results();
        self.read_links();
        self.process_pending()
    }

    fn drain_connect_results(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            match result {
                ConnectResult::Connected { node, generation, mut link } => {
                    let Some(connection) = self.connections.get_mut(&node) else { continue };
                    if connection.generation != generation {
                        trace!("Dropping stale connection result");
                        continue;
                    }
                    let dropped = connection.framer.finish().count();
                    if dropped > 0 {
                        trace!("Dropping {} records left over from the previous link", dropped);
                    }
                    let finished = connection.framer_stats();
                    connection.retired = finished;
                    connection.framer.reset();

                    let online = link.online().unwrap_or(false);
                    connection.link = Some(link);
                    connection.last_total_bytes = connection.total_bytes;

                    if let Some(ecu) = self.tree.ecu_mut(node) {
                        ecu.last_error = None;
                        info!("ECU {} connected ({})", ecu.id, ecu.interface);
                    }
                    self.set_state(node, ConnectionState::Connected, online);
                    self.on_connected(node, online);
                }
                ConnectResult::Failed { node, generation, error } => {
                    let Some(connection) = self.connections.get_mut(&node) else { continue };
                    if connection.generation != generation {
                        continue;
                    }
                    if let Some(ecu) = self.tree.ecu_mut(node) {
                        warn!("Connecting ECU {} failed: {}", ecu.id, error);
                        ecu.last_error = Some(error);
                    }
                    self.set_state(node, ConnectionState::Disconnected, false);
                    self.tree.invalidate_all(node);
                }
            }
        }
    }

    fn on_connected(&mut self, node: NodeId, online: bool) {
        let Some(ecu) = self.tree.ecu(node) else { return };
        let update = online && ecu.update_data_if_online;
        if update {
            if let Err(e) = self.send_updates(node) {
                warn!("Sending configuration failed: {}", e);
            }
        }
        if self.config.request_log_info_on_connect && !update {
            if let Err(e) = self.send_control(node, &ControlRequest::GetLogInfo, None, None) {
                warn!("Requesting log info failed: {}", e);
            }
        }
    }

    fn read_links(&mut self) {
        let mut buffer = vec![0u8; self.config.read_size];
        let mut failed = Vec::new();
        let mut came_online = Vec::new();

        for (node, connection) in self.connections.iter_mut() {
            let Some(link) = connection.link.as_mut() else { continue };
            for _ in 0..MAX_READS_PER_POLL {
                match link.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        connection.pending.extend_from_slice(&buffer[..n]);
                        connection.total_bytes += n as u64;
                    }
                    Err(e) => {
                        failed.push((*node, e.to_string()));
                        break;
                    }
                }
            }
            if let (Some(ecu), Some(link)) = (self.tree.ecu(*node), connection.link.as_mut()) {
                if ecu.interface.is_serial() {
                    let online = link.online().unwrap_or(false);
                    if online != ecu.online {
                        came_online.push((*node, online));
                    }
                }
            }
        }

        for (node, online) in came_online {
            self.set_state(node, ConnectionState::Connected, online);
            let update = online && self.tree.ecu(node).is_some_and(|e| e.update_data_if_online);
            if update {
                if let Err(e) = self.send_updates(node) {
                    warn!("Sending configuration failed: {}", e);
                }
            }
        }

        for (node, error) in failed {
            if let Some(ecu) = self.tree.ecu_mut(node) {
                warn!("ECU {} read error: {}", ecu.id, error);
                ecu.last_error = Some(error);
            }
            self.close(node);
        }
    }

    fn process_pending(&mut self) -> Result<Vec<(NodeId, ControlOutcome)>> {
        let mut outcomes = Vec::new();
        if self.connections.values().all(|c| c.pending.is_empty()) {
            return Ok(outcomes);
        }
        let Some(_guard) = self.token.try_acquire() else {
            trace!("Write token busy, holding received bytes");
            return Ok(outcomes);
        };

        let mut appended = 0;
        let mut write_error = None;
        for (node, connection) in self.connections.iter_mut() {
            if connection.pending.is_empty() {
                continue;
            }
            let pending = std::mem::take(&mut connection.pending);
            connection.framer.push(&pending);

            let configured = self.tree.ecu(*node).map(|e| e.id).unwrap_or(DltId::EMPTY);
            while let Some(message) = connection.framer.next_message() {
                if message.is_control_response() {
                    let outcome = self.codec.handle_response(&mut self.tree, *node, &message);
                    if outcome != ControlOutcome::Ignored {
                        outcomes.push((*node, outcome));
                    }
                }
                if message.is_control() && !self.config.write_control {
                    continue;
                }
                if let Some(writer) = self.writer.as_mut() {
                    let record = live_record(&message, configured);
                    if let Err(e) = writer.write_record(&record) {
                        write_error.get_or_insert(e);
                        continue;
                    }
                    appended += 1;
                }
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        if appended > 0 {
            events::emit(self.events.as_ref(), EngineEvent::MessagesAppended(appended));
        }
        match write_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Auto-reconnect tick: recycle silent connections and retry wanted ones
    pub fn tick(&mut self) -> Result<()> {
        let nodes: Vec<NodeId> = self.connections.keys().copied().collect();
        for node in nodes {
            let Some(ecu) = self.tree.ecu(node) else { continue };
            let (id, auto_reconnect, connected, timeout) =
                (ecu.id, ecu.auto_reconnect, ecu.is_connected(), ecu.auto_reconnect_timeout.max(1));
            let Some(connection) = self.connections.get_mut(&node) else { continue };

            connection.ticks += 1;
            if connection.ticks < timeout {
                continue;
            }

            if auto_reconnect && connected && connection.total_bytes == connection.last_total_bytes {
                match self.token.try_acquire() {
                    Some(_guard) => {
                        info!("ECU {} silent since last check, reconnecting", id);
                        connection.try_to_connect = true;
                        self.close(node);
                    }
                    None => {
                        // the check stays due and runs again on the next tick
                        debug!("Write token busy, skipping reconnect check for {}", id);
                        continue;
                    }
                }
            }

            let Some(connection) = self.connections.get_mut(&node) else { continue };
            connection.ticks = 0;
            connection.last_total_bytes = connection.total_bytes;
            let retry = connection.try_to_connect;
            let disconnected = self.tree.ecu(node).is_some_and(|e| e.state == ConnectionState::Disconnected);
            if retry && disconnected {
                self.connect(node)?;
            }
        }
        Ok(())
    }

    /// Encode and send a control request to a connected ECU
    pub fn send_control(
        &mut self,
        node: NodeId,
        request: &ControlRequest,
        app_id: Option<DltId>,
        ctx_id: Option<DltId>,
    ) -> Result<EncodedRequest> {
        let ecu = self.tree.ecu(node).ok_or(EngineError::UnknownEcu)?;
        if !ecu.is_connected() {
            return Err(EngineError::NotConnected(ecu.id));
        }
        let encoded = self.codec.encode(ecu, request, app_id, ctx_id)?;
        let id = ecu.id;

        let connection = self.connections.get_mut(&node).ok_or(EngineError::UnknownEcu)?;
        let link = connection.link.as_mut().ok_or(EngineError::NotConnected(id))?;
        if let Err(e) = link.write_all(&encoded.wire()) {
            warn!("Sending {} to ECU {} failed: {}", service::name(encoded.service_id), id, e);
            if let Some(ecu) = self.tree.ecu_mut(node) {
                ecu.last_error = Some(e.to_string());
            }
            self.close(node);
            return Err(e.into());
        }

        if self.config.write_control {
            if let (Some(writer), Some(_guard)) = (self.writer.as_mut(), self.token.try_acquire()) {
                writer.write_record(&encoded.record())?;
                writer.flush()?;
            }
        }
        Ok(encoded)
    }

    /// Send a custom injection message
    pub fn inject(
        &mut self,
        node: NodeId,
        service_id: u32,
        data: Vec<u8>,
        app_id: Option<DltId>,
        ctx_id: Option<DltId>,
    ) -> Result<EncodedRequest> {
        self.send_control(node, &ControlRequest::Injection { service_id, data }, app_id, ctx_id)
    }

    /// Append a marker record to the live log file
    pub fn write_marker(&mut self) -> Result<()> {
        let marker = self.codec.encode_marker()?;
        let Some(writer) = self.writer.as_mut() else {
            return Err(EngineError::Config("no live log file configured".into()));
        };
        let _guard = self.token.try_acquire().ok_or(EngineError::Busy)?;
        writer.write_record(&marker.record())?;
        writer.flush()?;
        Ok(())
    }

    /// Push the ECU's configured defaults and request its contexts
    pub fn send_updates(&mut self, node: NodeId) -> Result<()> {
        let ecu = self.tree.ecu(node).ok_or(EngineError::UnknownEcu)?.clone();
        if ecu.send_default_log_level {
            self.send_control(node, &ControlRequest::SetDefaultLogLevel(ecu.log_level), None, None)?;
            self.send_control(node, &ControlRequest::SetDefaultTraceStatus(ecu.trace_status), None, None)?;
            self.send_control(node, &ControlRequest::SetVerboseMode(ecu.verbose_mode), None, None)?;
        }
        self.send_control(node, &ControlRequest::SetTimingPackets(ecu.timing_packets), None, None)?;
        if ecu.send_get_log_info {
            self.send_control(node, &ControlRequest::GetLogInfo, None, None)?;
        }
        if let Some(ecu) = self.tree.ecu_mut(node) {
            ecu.validity = Validity::Valid;
        }
        Ok(())
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            corrupted_control: self.codec.corrupted(),
            ..Default::default()
        };
        for connection in self.connections.values() {
            let framer = connection.framer_stats();
            stats.bytes_received += connection.total_bytes;
            stats.messages += framer.messages;
            stats.errors += framer.errors;
            stats.syncs_found += framer.resyncs;
            stats.bytes_skipped += framer.bytes_skipped;
        }
        stats
    }

    /// Bytes received but not yet framed, per ECU
    pub fn pending_bytes(&self, node: NodeId) -> usize {
        self.connections.get(&node).map(|c| c.pending.len()).unwrap_or(0)
    }
}

/// File record for a live message: reception time and the message's ECU id
fn live_record(message: &DecodedMessage, configured: DltId) -> Vec<u8> {
    let ecu = match message.ecu_id {
        Some(id) if !id.is_empty() => id,
        _ => configured,
    };
    message.to_record(&StorageHeader::now(ecu))
}
