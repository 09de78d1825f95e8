//! Record builders shared by the integration tests
#![allow(dead_code)]

use dlt_log_engine::protocol::header::{ExtendedHeader, HeaderFields, StorageHeader};
use dlt_log_engine::types::{Endianness, MessageInfo, MessageType, CONTROL_RESPONSE};
use dlt_log_engine::{DltId, MessageTime};
use std::fs;
use std::path::{Path, PathBuf};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Message (standard header onwards) with a little endian payload
pub fn message(ecu: &str, app: &str, ctx: &str, info: MessageInfo, payload: &[u8]) -> Vec<u8> {
    let fields = HeaderFields {
        counter: 0,
        ecu_id: Some(DltId::new(ecu)),
        session_id: None,
        uptime: Some(100),
        extended: Some(ExtendedHeader {
            info,
            argument_count: 1,
            app_id: DltId::new(app),
            ctx_id: DltId::new(ctx),
        }),
        endianness: Endianness::Little,
    };
    let mut out = fields.encode(payload.len()).unwrap();
    out.extend_from_slice(payload);
    out
}

/// Non-verbose log message: message id 0 followed by `text`
pub fn log_message(ecu: &str, app: &str, ctx: &str, level: u8, text: &str) -> Vec<u8> {
    let info = MessageInfo { message_type: MessageType::Log, subtype: level, verbose: false };
    let mut payload = 0u32.to_le_bytes().to_vec();
    payload.extend_from_slice(text.as_bytes());
    message(ecu, app, ctx, info, &payload)
}

/// Control response carrying `service_id` followed by `body`
pub fn control_response(ecu: &str, service_id: u32, body: &[u8]) -> Vec<u8> {
    let info = MessageInfo { message_type: MessageType::Control, subtype: CONTROL_RESPONSE, verbose: false };
    let mut payload = service_id.to_le_bytes().to_vec();
    payload.extend_from_slice(body);
    message(ecu, "APP", "CON", info, &payload)
}

/// File record: storage header + message
pub fn record(seconds: u32, ecu: &str, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    StorageHeader::new(MessageTime::new(seconds, 0), DltId::new(ecu)).write(&mut out);
    out.extend_from_slice(message);
    out
}

pub fn log_record(seconds: u32, ecu: &str, level: u8, text: &str) -> Vec<u8> {
    record(seconds, ecu, &log_message(ecu, "APP1", "CTX1", level, text))
}

pub fn write_file(dir: &Path, name: &str, records: &[Vec<u8>]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, records.concat()).unwrap();
    path
}

pub fn append_file(path: &Path, records: &[Vec<u8>]) {
    use std::io::Write;
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(&records.concat()).unwrap();
}

/// GetLogInfo status 7 body: one application with the given contexts
pub fn log_info_body(app: &str, contexts: &[(&str, i8, i8, &str)], app_description: &str) -> Vec<u8> {
    let mut body = vec![7u8];
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(DltId::new(app).as_bytes());
    body.extend_from_slice(&(contexts.len() as u16).to_le_bytes());
    for (ctx, level, trace, description) in contexts {
        body.extend_from_slice(DltId::new(ctx).as_bytes());
        body.push(*level as u8);
        body.push(*trace as u8);
        body.extend_from_slice(&(description.len() as u16).to_le_bytes());
        body.extend_from_slice(description.as_bytes());
    }
    body.extend_from_slice(&(app_description.len() as u16).to_le_bytes());
    body.extend_from_slice(app_description.as_bytes());
    body.extend_from_slice(b"remo");
    body
}
