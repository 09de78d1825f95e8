mod common;

use common::*;
use dlt_log_engine::connection::{Connector, Link};
use dlt_log_engine::protocol::service;
use dlt_log_engine::tree::{ConnectionState, Interface, Validity};
use dlt_log_engine::{
    ConnectionManager, ControlOutcome, ControlRequest, DltId, EcuNode, EngineConfig, EngineError, Framer,
    NodeId, SyncMode, WriteToken,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Both ends of an in-memory link
#[derive(Clone, Default)]
struct Wire {
    inbound: Arc<Mutex<VecDeque<u8>>>,
    outbound: Arc<Mutex<Vec<u8>>>,
    broken: Arc<AtomicBool>,
    dsr: Arc<AtomicBool>,
}

impl Wire {
    fn send(&self, bytes: &[u8]) {
        self.inbound.lock().extend(bytes.iter().copied());
    }

    fn sent(&self) -> Vec<u8> {
        self.outbound.lock().clone()
    }
}

struct MemoryLink {
    wire: Wire,
}

impl Link for MemoryLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.wire.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "link broken"));
        }
        let mut inbound = self.wire.inbound.lock();
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.wire.outbound.lock().extend_from_slice(data);
        Ok(())
    }

    fn online(&mut self) -> io::Result<bool> {
        Ok(self.wire.dsr.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct MemoryConnector {
    wire: Wire,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl Connector for MemoryConnector {
    fn connect(&self, _interface: &Interface) -> io::Result<Box<dyn Link>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(Box::new(MemoryLink { wire: self.wire.clone() }))
    }
}

fn manager(config: &EngineConfig, token: WriteToken) -> (ConnectionManager, Arc<MemoryConnector>) {
    init_logging();
    let connector = Arc::new(MemoryConnector::default());
    connector.wire.dsr.store(true, Ordering::SeqCst);
    let manager = ConnectionManager::new(config, token)
        .unwrap()
        .with_connector(connector.clone());
    (manager, connector)
}

/// Poll until the ECU reaches `state`
fn wait_for(manager: &mut ConnectionManager, node: NodeId, state: ConnectionState) {
    for _ in 0..400 {
        manager.poll().unwrap();
        if manager.tree().ecu(node).map(|e| e.state) == Some(state) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("ECU never reached {:?}", state);
}

fn file_messages(path: &Path) -> Vec<dlt_log_engine::DecodedMessage> {
    let bytes = fs::read(path).unwrap();
    let mut framer = Framer::new(SyncMode::Storage, &Default::default());
    framer.feed(&bytes).collect()
}

fn sent_service_ids(bytes: &[u8]) -> Vec<u32> {
    let mut framer = Framer::new(SyncMode::Raw, &Default::default());
    framer.feed(bytes).filter_map(|m| m.service_id()).collect()
}

#[test]
fn test_received_messages_are_logged_with_storage_header() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("live.dlt");
    let config = EngineConfig::default().with_log_file(&log);
    let (mut manager, connector) = manager(&config, WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));

    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    connector.wire.send(&log_message("ECU1", "APP1", "CTX1", 4, "hello"));
    connector.wire.send(&log_message("ECU1", "APP1", "CTX1", 3, "world"));
    manager.poll().unwrap();

    let messages = file_messages(&log);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].storage.unwrap().ecu_id, DltId::new("ECU1"));
    assert!(messages[1].payload_text().contains("world"));

    let stats = manager.stats();
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.errors, 0);
}

#[test]
fn test_control_responses_update_tree() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    let body = log_info_body("APP1", &[("CTX1", 4, 0, "ctx")], "app");
    connector.wire.send(&control_response("ECU1", service::GET_LOG_INFO, &body));
    let outcomes = manager.poll().unwrap();

    assert_eq!(outcomes, vec![(node, ControlOutcome::LogInfo { status: 7, contexts: 1 })]);
    assert_eq!(manager.tree().context_ids(node), vec![(DltId::new("APP1"), DltId::new("CTX1"))]);
}

#[test]
fn test_bytes_are_held_while_token_is_busy() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("live.dlt");
    let config = EngineConfig::default().with_log_file(&log);
    let token = WriteToken::new();
    let (mut manager, connector) = manager(&config, token.clone());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    let guard = token.try_acquire().unwrap();
    connector.wire.send(&log_message("ECU1", "APP1", "CTX1", 4, "held"));
    manager.poll().unwrap();
    assert!(manager.pending_bytes(node) > 0);
    assert_eq!(fs::metadata(&log).unwrap().len(), 0);

    drop(guard);
    manager.poll().unwrap();
    assert_eq!(manager.pending_bytes(node), 0);
    let messages = file_messages(&log);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].payload_text().contains("held"));
}

#[test]
fn test_auto_reconnect_skips_while_token_is_held() {
    let token = WriteToken::new();
    let (mut manager, connector) = manager(&EngineConfig::default(), token.clone());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490).with_auto_reconnect(true));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    let guard = token.try_acquire().unwrap();
    manager.tick().unwrap();
    assert_eq!(manager.tree().ecu(node).unwrap().state, ConnectionState::Connected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    drop(guard);
    manager.tick().unwrap();
    assert_ne!(manager.tree().ecu(node).unwrap().state, ConnectionState::Connected);
    wait_for(&mut manager, node, ConnectionState::Connected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_skipped_reconnect_check_runs_on_next_tick() {
    let token = WriteToken::new();
    let (mut manager, connector) = manager(&EngineConfig::default(), token.clone());
    let mut ecu = EcuNode::tcp("ECU1", "localhost", 3490).with_auto_reconnect(true);
    ecu.auto_reconnect_timeout = 3;
    let node = manager.add_ecu(ecu);
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    manager.tick().unwrap();
    manager.tick().unwrap();
    let guard = token.try_acquire().unwrap();
    manager.tick().unwrap();
    assert_eq!(manager.tree().ecu(node).unwrap().state, ConnectionState::Connected);

    drop(guard);
    manager.tick().unwrap();
    assert_ne!(manager.tree().ecu(node).unwrap().state, ConnectionState::Connected);
    wait_for(&mut manager, node, ConnectionState::Connected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn test_traffic_keeps_connection_alive() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490).with_auto_reconnect(true));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    connector.wire.send(&log_message("ECU1", "APP1", "CTX1", 4, "alive"));
    manager.poll().unwrap();
    manager.tick().unwrap();

    assert_eq!(manager.tree().ecu(node).unwrap().state, ConnectionState::Connected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_connect_is_retried() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    connector.refuse.store(true, Ordering::SeqCst);
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));

    manager.connect(node).unwrap();
    for _ in 0..400 {
        manager.poll().unwrap();
        if manager.tree().ecu(node).unwrap().last_error.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let ecu = manager.tree().ecu(node).unwrap();
    assert_eq!(ecu.state, ConnectionState::Disconnected);
    assert!(ecu.last_error.as_deref().unwrap_or_default().contains("refused"));

    connector.refuse.store(false, Ordering::SeqCst);
    manager.tick().unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);
    assert!(manager.tree().ecu(node).unwrap().last_error.is_none());
}

#[test]
fn test_explicit_disconnect_invalidates_and_stays_down() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490).with_auto_reconnect(true));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);
    manager.tree_mut().upsert_context(node, DltId::new("APP1"), DltId::new("CTX1"), 4, 0, None);

    manager.disconnect(node);
    manager.tick().unwrap();
    manager.poll().unwrap();

    let ecu = manager.tree().ecu(node).unwrap();
    assert_eq!(ecu.state, ConnectionState::Disconnected);
    assert_eq!(ecu.validity, Validity::Invalid);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[test]
fn test_read_error_disconnects() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));
    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    connector.wire.broken.store(true, Ordering::SeqCst);
    manager.poll().unwrap();

    let ecu = manager.tree().ecu(node).unwrap();
    assert_eq!(ecu.state, ConnectionState::Disconnected);
    assert!(ecu.last_error.is_some());
}

#[test]
fn test_send_control_and_log_it() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("live.dlt");
    let config = EngineConfig::default().with_log_file(&log).with_write_control(true);
    let (mut manager, connector) = manager(&config, WriteToken::new());
    let node = manager.add_ecu(EcuNode::tcp("ECU1", "localhost", 3490));

    let err = manager.send_control(node, &ControlRequest::GetLogInfo, None, None).unwrap_err();
    assert!(matches!(err, EngineError::NotConnected(_)));

    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);
    manager.send_control(node, &ControlRequest::GetSoftwareVersion, None, None).unwrap();
    manager.inject(node, 0x1000, vec![1, 2, 3], None, None).unwrap();

    assert_eq!(sent_service_ids(&connector.wire.sent()), vec![service::GET_SOFTWARE_VERSION, 0x1000]);
    let logged = file_messages(&log);
    assert_eq!(logged.len(), 2);
    assert!(logged.iter().all(|m| m.is_control()));
}

#[test]
fn test_send_updates_sequence() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    let mut ecu = EcuNode::tcp("ECU1", "localhost", 3490);
    ecu.send_default_log_level = true;
    ecu.send_get_log_info = true;
    ecu.update_data_if_online = true;
    let node = manager.add_ecu(ecu);

    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);

    assert_eq!(
        sent_service_ids(&connector.wire.sent()),
        vec![
            service::SET_DEFAULT_LOG_LEVEL,
            service::SET_DEFAULT_TRACE_STATUS,
            service::SET_VERBOSE_MODE,
            service::SET_TIMING_PACKETS,
            service::GET_LOG_INFO,
        ]
    );
    assert_eq!(manager.tree().ecu(node).unwrap().validity, Validity::Valid);
}

#[test]
fn test_serial_handshake_triggers_updates() {
    let (mut manager, connector) = manager(&EngineConfig::default(), WriteToken::new());
    connector.wire.dsr.store(false, Ordering::SeqCst);
    let mut ecu = EcuNode::serial("ECU1", "/dev/ttyUSB0", 115_200);
    ecu.update_data_if_online = true;
    let node = manager.add_ecu(ecu);

    manager.connect(node).unwrap();
    wait_for(&mut manager, node, ConnectionState::Connected);
    assert!(!manager.tree().ecu(node).unwrap().online);
    assert!(connector.wire.sent().is_empty());

    connector.wire.dsr.store(true, Ordering::SeqCst);
    manager.poll().unwrap();

    assert!(manager.tree().ecu(node).unwrap().online);
    assert_eq!(sent_service_ids(&connector.wire.sent()), vec![service::SET_TIMING_PACKETS]);
}

#[test]
fn test_marker_needs_free_token() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("live.dlt");
    let token = WriteToken::new();
    let (mut manager, _connector) = manager(&EngineConfig::default().with_log_file(&log), token.clone());

    let guard = token.try_acquire().unwrap();
    assert!(matches!(manager.write_marker(), Err(EngineError::Busy)));
    drop(guard);

    manager.write_marker().unwrap();
    let logged = file_messages(&log);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].service_id(), Some(service::MARKER));
}
