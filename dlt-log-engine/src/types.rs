//! Core types for the DLT log engine
//!
//! This module defines the fundamental values that flow between the framer,
//! the control codec, the filter engine and the indexer: four-character DLT
//! identifiers, message type information and the decoded message itself.

use crate::protocol::header::{StandardHeader, StorageHeader};
use crate::protocol::service;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type used throughout the engine
pub type Timestamp = DateTime<Utc>;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur inside the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Truncated payload while reading {0}")]
    Truncated(&'static str),

    #[error("Invalid control service: 0x{0:X}")]
    InvalidService(u32),

    #[error("ECU not connected: {0}")]
    NotConnected(DltId),

    #[error("Unknown ECU node")]
    UnknownEcu,

    #[error("Log file is locked by a live writer")]
    Busy,

    #[error("Index cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A four-character DLT identifier (ECU, application or context id)
///
/// Shorter ids are zero padded, as on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DltId([u8; 4]);

impl DltId {
    /// The all-zero id
    pub const EMPTY: DltId = DltId([0; 4]);

    /// Build an id from a string, truncating to four bytes
    pub fn new(id: &str) -> Self {
        let mut bytes = [0u8; 4];
        for (slot, byte) in bytes.iter_mut().zip(id.bytes()) {
            *slot = byte;
        }
        DltId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        DltId(bytes)
    }

    /// Read an id from the first four bytes of `buf`
    pub fn from_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
        Some(DltId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl fmt::Display for DltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(4);
        f.pad(&String::from_utf8_lossy(&self.0[..end]))
    }
}

impl fmt::Debug for DltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DltId({:?})", self.to_string())
    }
}

impl From<&str> for DltId {
    fn from(id: &str) -> Self {
        DltId::new(id)
    }
}

impl From<String> for DltId {
    fn from(id: String) -> Self {
        DltId::new(&id)
    }
}

impl From<DltId> for String {
    fn from(id: DltId) -> Self {
        id.to_string()
    }
}

/// Byte order of a message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the host
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endianness::Little => LittleEndian::read_u16(buf),
            Endianness::Big => BigEndian::read_u16(buf),
        }
    }

    pub fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endianness::Little => LittleEndian::read_u32(buf),
            Endianness::Big => BigEndian::read_u32(buf),
        }
    }
}

/// Message type (MSTP field of the extended header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Log,
    AppTrace,
    NwTrace,
    Control,
    Reserved(u8),
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => MessageType::Log,
            1 => MessageType::AppTrace,
            2 => MessageType::NwTrace,
            3 => MessageType::Control,
            other => MessageType::Reserved(other),
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Log => 0,
            MessageType::AppTrace => 1,
            MessageType::NwTrace => 2,
            MessageType::Control => 3,
            MessageType::Reserved(other) => other & 0x07,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Log => "log",
            MessageType::AppTrace => "app_trace",
            MessageType::NwTrace => "nw_trace",
            MessageType::Control => "control",
            MessageType::Reserved(_) => "reserved",
        }
    }
}

/// Control message subtypes (MTIN for control messages)
pub const CONTROL_REQUEST: u8 = 1;
pub const CONTROL_RESPONSE: u8 = 2;

/// Decoded message-info byte of the extended header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInfo {
    pub message_type: MessageType,
    /// MTIN: log level for log messages, request/response for control
    pub subtype: u8,
    pub verbose: bool,
}

impl MessageInfo {
    pub fn from_msin(msin: u8) -> Self {
        Self {
            verbose: msin & 0x01 != 0,
            message_type: MessageType::from_bits((msin >> 1) & 0x07),
            subtype: (msin >> 4) & 0x0F,
        }
    }

    pub fn to_msin(self) -> u8 {
        (self.subtype << 4) | (self.message_type.to_bits() << 1) | u8::from(self.verbose)
    }

    pub fn control_request() -> Self {
        Self {
            message_type: MessageType::Control,
            subtype: CONTROL_REQUEST,
            verbose: false,
        }
    }

    pub fn control_response() -> Self {
        Self {
            message_type: MessageType::Control,
            subtype: CONTROL_RESPONSE,
            verbose: false,
        }
    }

    pub fn subtype_name(&self) -> &'static str {
        match (self.message_type, self.subtype) {
            (MessageType::Log, 1) => "fatal",
            (MessageType::Log, 2) => "error",
            (MessageType::Log, 3) => "warn",
            (MessageType::Log, 4) => "info",
            (MessageType::Log, 5) => "debug",
            (MessageType::Log, 6) => "verbose",
            (MessageType::AppTrace, 1) => "variable",
            (MessageType::AppTrace, 2) => "function_in",
            (MessageType::AppTrace, 3) => "function_out",
            (MessageType::AppTrace, 4) => "state",
            (MessageType::AppTrace, 5) => "vfb",
            (MessageType::NwTrace, 1) => "ipc",
            (MessageType::NwTrace, 2) => "can",
            (MessageType::NwTrace, 3) => "flexray",
            (MessageType::NwTrace, 4) => "most",
            (MessageType::Control, CONTROL_REQUEST) => "request",
            (MessageType::Control, CONTROL_RESPONSE) => "response",
            (MessageType::Control, 3) => "time",
            _ => "",
        }
    }
}

/// Storage time of a message (seconds + microseconds since epoch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageTime {
    pub seconds: u32,
    pub microseconds: u32,
}

impl MessageTime {
    pub fn new(seconds: u32, microseconds: u32) -> Self {
        Self { seconds, microseconds }
    }

    /// Current wall clock time
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds: now.timestamp() as u32,
            microseconds: now.timestamp_subsec_micros(),
        }
    }

    /// Convert to DateTime<Utc>
    pub fn timestamp(&self) -> Option<Timestamp> {
        DateTime::from_timestamp(i64::from(self.seconds), self.microseconds.saturating_mul(1000))
    }
}

/// A complete DLT record as produced by the framer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Storage header (only present for file-framed records)
    pub storage: Option<StorageHeader>,
    /// Raw header type byte
    pub htyp: u8,
    /// Message counter
    pub counter: u8,
    /// ECU id from the standard header extra field
    pub ecu_id: Option<DltId>,
    pub session_id: Option<u32>,
    /// Uptime timestamp in 0.1 ms units
    pub uptime: Option<u32>,
    /// Extended header message info, if an extended header is present
    pub info: Option<MessageInfo>,
    pub argument_count: u8,
    pub app_id: Option<DltId>,
    pub ctx_id: Option<DltId>,
    /// Byte order of the payload
    pub endianness: Endianness,
    /// Standard header, extra fields and extended header bytes
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl DecodedMessage {
    /// ECU id of the message: the header extra field, else the storage header id
    pub fn ecu(&self) -> DltId {
        self.ecu_id
            .or_else(|| self.storage.as_ref().map(|s| s.ecu_id))
            .unwrap_or(DltId::EMPTY)
    }

    pub fn app(&self) -> DltId {
        self.app_id.unwrap_or(DltId::EMPTY)
    }

    pub fn ctx(&self) -> DltId {
        self.ctx_id.unwrap_or(DltId::EMPTY)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.info.map(|info| info.message_type)
    }

    pub fn is_verbose(&self) -> bool {
        self.info.map(|info| info.verbose).unwrap_or(false)
    }

    pub fn is_control(&self) -> bool {
        self.message_type() == Some(MessageType::Control)
    }

    pub fn is_control_response(&self) -> bool {
        matches!(
            self.info,
            Some(MessageInfo { message_type: MessageType::Control, subtype: CONTROL_RESPONSE, .. })
        )
    }

    /// Log level (1 = fatal .. 6 = verbose) for log messages
    pub fn log_level(&self) -> Option<u8> {
        match self.info {
            Some(MessageInfo { message_type: MessageType::Log, subtype, .. }) => Some(subtype),
            _ => None,
        }
    }

    /// Storage time, if the record was framed from a file
    pub fn time(&self) -> Option<MessageTime> {
        self.storage.as_ref().map(|s| s.time)
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        self.time().and_then(|t| t.timestamp())
    }

    /// Leading service id of a control payload, in payload byte order
    pub fn service_id(&self) -> Option<u32> {
        if !self.is_control() || self.payload.len() < 4 {
            return None;
        }
        Some(self.endianness.read_u32(&self.payload))
    }

    /// Standard header view of the raw header bytes
    pub fn standard_header(&self) -> Option<StandardHeader> {
        StandardHeader::parse(&self.header)
    }

    /// Length of the record without its storage header
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    /// Serialize as a file record behind the given storage header
    pub fn to_record(&self, storage: &StorageHeader) -> Vec<u8> {
        let mut record = Vec::with_capacity(StorageHeader::SIZE + self.wire_len());
        storage.write(&mut record);
        record.extend_from_slice(&self.header);
        record.extend_from_slice(&self.payload);
        record
    }

    /// One-line header rendering used for header text filters
    pub fn header_text(&self) -> String {
        let (kind, subtype, mode) = match self.info {
            Some(info) => (
                info.message_type.name(),
                info.subtype_name(),
                if info.verbose { "verbose" } else { "non-verbose" },
            ),
            None => ("", "", "non-verbose"),
        };
        format!(
            "{} {} {} {} {} {} {}",
            self.ecu(),
            self.app(),
            self.ctx(),
            kind,
            subtype,
            mode,
            self.argument_count
        )
    }

    /// Human readable payload used for payload text filters
    pub fn payload_text(&self) -> String {
        if let Some(sid) = self.service_id() {
            let rest = crate::payload::printable(&self.payload[4..]);
            return format!("[{}] {}", service::name(sid), rest).trim_end().to_string();
        }
        if self.is_verbose() {
            return crate::payload::render_verbose(
                &self.payload,
                self.argument_count,
                self.endianness,
            );
        }
        crate::payload::render_non_verbose(&self.payload, self.endianness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlt_id_padding_and_display() {
        let id = DltId::new("AB");
        assert_eq!(id.as_bytes(), b"AB\0\0");
        assert_eq!(id.to_string(), "AB");
        assert_eq!(DltId::new("TOOLONG").to_string(), "TOOL");
        assert!(DltId::EMPTY.is_empty());
        assert_eq!(format!("{:<4}|", DltId::new("A")), "A   |");
    }

    #[test]
    fn test_message_info_round_trip() {
        let info = MessageInfo::from_msin(0x41);
        assert_eq!(info.message_type, MessageType::Log);
        assert_eq!(info.subtype, 4);
        assert!(info.verbose);
        assert_eq!(info.to_msin(), 0x41);

        assert_eq!(MessageInfo::control_request().to_msin(), 0x16);
        assert_eq!(MessageInfo::control_response().to_msin(), 0x26);
    }

    #[test]
    fn test_message_time_ordering() {
        let a = MessageTime::new(10, 999_999);
        let b = MessageTime::new(11, 0);
        assert!(a < b);
        assert!(a.timestamp().is_some());
    }
}
