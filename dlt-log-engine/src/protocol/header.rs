//! Storage, standard and extended header layouts
//!
//! Byte order:
//! - storage header seconds/microseconds are little endian, as written by DLT tooling
//! - standard header length and the extra fields are always network order
//! - the MSBF flag only governs the payload

use crate::types::{DltId, EngineError, Endianness, MessageInfo, MessageTime, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Storage header magic "DLT\x01"
pub const STORAGE_PATTERN: [u8; 4] = *b"DLT\x01";
/// Serial sync marker "DLS\x01"
pub const SERIAL_PATTERN: [u8; 4] = *b"DLS\x01";

// htyp bit flags
pub const HTYP_UEH: u8 = 0x01;
pub const HTYP_MSBF: u8 = 0x02;
pub const HTYP_WEID: u8 = 0x04;
pub const HTYP_WSID: u8 = 0x08;
pub const HTYP_WTMS: u8 = 0x10;
pub const HTYP_VERSION_MASK: u8 = 0xE0;
pub const HTYP_PROTOCOL_VERSION1: u8 = 0x20;

pub const STANDARD_HEADER_SIZE: usize = 4;
pub const EXTENDED_HEADER_SIZE: usize = 10;

/// File storage header prepended to every record in a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageHeader {
    pub time: MessageTime,
    pub ecu_id: DltId,
}

impl StorageHeader {
    pub const SIZE: usize = 16;

    pub fn new(time: MessageTime, ecu_id: DltId) -> Self {
        Self { time, ecu_id }
    }

    /// Storage header stamped with the current time
    pub fn now(ecu_id: DltId) -> Self {
        Self::new(MessageTime::now(), ecu_id)
    }

    /// Parse a storage header; returns None if the pattern does not match
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[..4] != STORAGE_PATTERN {
            return None;
        }
        Some(Self {
            time: MessageTime::new(LittleEndian::read_u32(&buf[4..8]), LittleEndian::read_u32(&buf[8..12])),
            ecu_id: DltId::from_slice(&buf[12..16])?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&STORAGE_PATTERN);
        out.extend_from_slice(&self.time.seconds.to_le_bytes());
        out.extend_from_slice(&self.time.microseconds.to_le_bytes());
        out.extend_from_slice(self.ecu_id.as_bytes());
    }
}

/// The 4-byte standard header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardHeader {
    pub htyp: u8,
    pub counter: u8,
    /// Length of standard header + extras + extended header + payload
    pub length: u16,
}

impl StandardHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < STANDARD_HEADER_SIZE {
            return None;
        }
        Some(Self {
            htyp: buf[0],
            counter: buf[1],
            length: BigEndian::read_u16(&buf[2..4]),
        })
    }

    pub fn has_extended_header(&self) -> bool {
        self.htyp & HTYP_UEH != 0
    }

    pub fn is_big_endian(&self) -> bool {
        self.htyp & HTYP_MSBF != 0
    }

    pub fn has_ecu_id(&self) -> bool {
        self.htyp & HTYP_WEID != 0
    }

    pub fn has_session_id(&self) -> bool {
        self.htyp & HTYP_WSID != 0
    }

    pub fn has_timestamp(&self) -> bool {
        self.htyp & HTYP_WTMS != 0
    }

    pub fn version(&self) -> u8 {
        (self.htyp & HTYP_VERSION_MASK) >> 5
    }

    pub fn endianness(&self) -> Endianness {
        if self.is_big_endian() {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    /// Size of the optional extra fields following the standard header
    pub fn extra_size(&self) -> usize {
        4 * (usize::from(self.has_ecu_id()) + usize::from(self.has_session_id()) + usize::from(self.has_timestamp()))
    }

    /// Minimum record length implied by the htyp flags
    pub fn header_size(&self) -> usize {
        let extended = if self.has_extended_header() { EXTENDED_HEADER_SIZE } else { 0 };
        STANDARD_HEADER_SIZE + self.extra_size() + extended
    }
}

/// The 10-byte extended header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub info: MessageInfo,
    pub argument_count: u8,
    pub app_id: DltId,
    pub ctx_id: DltId,
}

impl ExtendedHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < EXTENDED_HEADER_SIZE {
            return None;
        }
        Some(Self {
            info: MessageInfo::from_msin(buf[0]),
            argument_count: buf[1],
            app_id: DltId::from_slice(&buf[2..6])?,
            ctx_id: DltId::from_slice(&buf[6..10])?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.info.to_msin());
        out.push(self.argument_count);
        out.extend_from_slice(self.app_id.as_bytes());
        out.extend_from_slice(self.ctx_id.as_bytes());
    }
}

/// Everything needed to serialize the header part of a record
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFields {
    pub counter: u8,
    pub ecu_id: Option<DltId>,
    pub session_id: Option<u32>,
    pub uptime: Option<u32>,
    pub extended: Option<ExtendedHeader>,
    pub endianness: Endianness,
}

impl HeaderFields {
    pub fn htyp(&self) -> u8 {
        let mut htyp = HTYP_PROTOCOL_VERSION1;
        if self.extended.is_some() {
            htyp |= HTYP_UEH;
        }
        if self.endianness == Endianness::Big {
            htyp |= HTYP_MSBF;
        }
        if self.ecu_id.is_some() {
            htyp |= HTYP_WEID;
        }
        if self.session_id.is_some() {
            htyp |= HTYP_WSID;
        }
        if self.uptime.is_some() {
            htyp |= HTYP_WTMS;
        }
        htyp
    }

    /// Serialize the standard header, extras and extended header for a
    /// payload of `payload_len` bytes. Fails when the message does not fit
    /// the 16-bit length field.
    pub fn encode(&self, payload_len: usize) -> Result<Vec<u8>> {
        let htyp = self.htyp();
        let header_len = StandardHeader { htyp, counter: 0, length: 0 }.header_size();
        let length = u16::try_from(header_len + payload_len).map_err(|_| {
            EngineError::InvalidFrame(format!(
                "message of {} bytes exceeds the length field",
                header_len + payload_len
            ))
        })?;

        let mut out = Vec::with_capacity(header_len);
        out.push(htyp);
        out.push(self.counter);
        out.extend_from_slice(&length.to_be_bytes());
        if let Some(ecu) = self.ecu_id {
            out.extend_from_slice(ecu.as_bytes());
        }
        if let Some(session) = self.session_id {
            out.extend_from_slice(&session.to_be_bytes());
        }
        if let Some(uptime) = self.uptime {
            out.extend_from_slice(&uptime.to_be_bytes());
        }
        if let Some(extended) = &self.extended {
            extended.write(&mut out);
        }
        Ok(out)
    }
}
