//! Byte stream framer
//!
//! Turns a byte stream (file, TCP or serial) into complete DLT records. The
//! framer owns a buffer that survives across `feed` calls, so records split
//! over several reads are reassembled. Corrupt data is skipped byte-wise until
//! the next plausible record start.
//!
//! Counting rules:
//! - `errors` is bumped once per rejected candidate (bad length or version)
//! - `bytes_skipped` is bumped once per discarded byte
//! - `resyncs` is bumped when a valid record follows at least one discarded byte
//!
//! After `finish` a candidate that would need more input is rejected like any
//! other bad candidate, so records behind a truncated one are still found.

use crate::config::FramerConfig;
use crate::protocol::header::{
    ExtendedHeader, StandardHeader, StorageHeader, EXTENDED_HEADER_SIZE, SERIAL_PATTERN,
    STANDARD_HEADER_SIZE, STORAGE_PATTERN,
};
use crate::types::{DecodedMessage, DltId, EngineError, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BytesMut};
use log::trace;
use serde::{Deserialize, Serialize};

/// How record boundaries are recognized in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// File records: "DLT\x01" + storage header + message
    Storage,
    /// Serial records: "DLS\x01" + optional storage header + message
    Serial,
    /// Back-to-back messages without any marker (plain TCP)
    Raw,
}

impl SyncMode {
    fn marker(self) -> Option<&'static [u8; 4]> {
        match self {
            SyncMode::Storage => Some(&STORAGE_PATTERN),
            SyncMode::Serial => Some(&SERIAL_PATTERN),
            SyncMode::Raw => None,
        }
    }
}

/// Location of a record in the stream, including any storage header or marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub offset: u64,
    pub length: usize,
}

/// Framer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramerStats {
    pub bytes_received: u64,
    pub bytes_skipped: u64,
    pub errors: u64,
    pub resyncs: u64,
    pub messages: u64,
}

pub struct Framer {
    mode: SyncMode,
    max_message_size: usize,
    buffer: BytesMut,
    /// Stream offset of the first buffered byte
    offset: u64,
    resyncing: bool,
    /// No more input will arrive
    finished: bool,
    stats: FramerStats,
}

impl Framer {
    pub fn new(mode: SyncMode, config: &FramerConfig) -> Self {
        Self {
            mode,
            max_message_size: config.max_message_size,
            buffer: BytesMut::with_capacity(64 * 1024),
            offset: 0,
            resyncing: false,
            finished: false,
            stats: FramerStats::default(),
        }
    }

    /// Start offset reporting at `offset` (used when resuming mid-file)
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Number of bytes waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append bytes and iterate over the records that became complete
    pub fn feed(&mut self, bytes: &[u8]) -> Messages<'_> {
        self.push(bytes);
        Messages { framer: self }
    }

    /// Append bytes without framing them yet
    pub fn push(&mut self, bytes: &[u8]) {
        self.stats.bytes_received += bytes.len() as u64;
        self.buffer.extend_from_slice(bytes);
    }

    /// Declare end of input and iterate over the records still recoverable
    /// from the buffer. Whatever cannot be framed is discarded.
    pub fn finish(&mut self) -> Messages<'_> {
        self.end_of_input();
        Messages { framer: self }
    }

    /// Like `finish`, for callers that pull frames with `next_frame`
    pub fn end_of_input(&mut self) {
        self.finished = true;
    }

    /// Drop all buffered bytes and counters
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.resyncing = false;
        self.finished = false;
        self.stats = FramerStats::default();
    }

    /// Next complete record with its stream location
    pub fn next_frame(&mut self) -> Option<(RawFrame, DecodedMessage)> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }
            if let Some(marker) = self.mode.marker() {
                match find(&self.buffer, marker) {
                    Some(0) => {}
                    Some(pos) => self.skip(pos),
                    None => {
                        // keep a possible partial marker at the tail
                        let keep = if self.finished { 0 } else { (marker.len() - 1).min(self.buffer.len()) };
                        let drop = self.buffer.len() - keep;
                        if drop > 0 {
                            self.skip(drop);
                        }
                        return None;
                    }
                }
            }

            let Some(prefix) = self.prefix_len() else {
                if self.finished {
                    self.reject();
                    continue;
                }
                return None;
            };
            if self.buffer.len() < prefix + STANDARD_HEADER_SIZE {
                if self.finished {
                    self.reject();
                    continue;
                }
                return None;
            }

            let header = StandardHeader::parse(&self.buffer[prefix..])?;
            if !self.plausible(&header) {
                trace!(
                    "Rejecting candidate at offset {} (htyp 0x{:02X}, len {})",
                    self.offset,
                    header.htyp,
                    header.length
                );
                self.reject();
                continue;
            }

            let length = prefix + usize::from(header.length);
            if self.buffer.len() < length {
                if self.finished {
                    trace!("Candidate at offset {} runs past the end of input", self.offset);
                    self.reject();
                    continue;
                }
                return None;
            }

            let storage = if prefix >= StorageHeader::SIZE {
                StorageHeader::parse(&self.buffer[prefix - StorageHeader::SIZE..prefix])
            } else {
                None
            };
            let decoded = decode_record(&self.buffer[prefix..length], storage);
            let frame = RawFrame { offset: self.offset, length };

            match decoded {
                Ok(message) => {
                    self.buffer.advance(length);
                    self.offset += length as u64;
                    if self.resyncing {
                        self.stats.resyncs += 1;
                        self.resyncing = false;
                    }
                    self.stats.messages += 1;
                    return Some((frame, message));
                }
                Err(e) => {
                    trace!("Rejecting candidate at offset {}: {}", self.offset, e);
                    self.reject();
                }
            }
        }
    }

    /// Next complete record
    pub fn next_message(&mut self) -> Option<DecodedMessage> {
        self.next_frame().map(|(_, message)| message)
    }

    /// Bytes preceding the standard header of the candidate at the buffer
    /// start, or None while that cannot be decided yet
    fn prefix_len(&self) -> Option<usize> {
        match self.mode {
            SyncMode::Storage => Some(StorageHeader::SIZE),
            SyncMode::Raw => Some(0),
            SyncMode::Serial => {
                let rest = self.buffer.get(SERIAL_PATTERN.len()..).unwrap_or_default();
                if rest.starts_with(&STORAGE_PATTERN) {
                    Some(SERIAL_PATTERN.len() + StorageHeader::SIZE)
                } else if rest.len() < STORAGE_PATTERN.len() && STORAGE_PATTERN.starts_with(rest) {
                    None
                } else {
                    Some(SERIAL_PATTERN.len())
                }
            }
        }
    }

    fn plausible(&self, header: &StandardHeader) -> bool {
        let length = usize::from(header.length);
        header.version() == 1 && length >= header.header_size() && length <= self.max_message_size
    }

    fn reject(&mut self) {
        self.stats.errors += 1;
        self.skip(1);
    }

    fn skip(&mut self, n: usize) {
        self.buffer.advance(n);
        self.offset += n as u64;
        self.stats.bytes_skipped += n as u64;
        self.resyncing = true;
    }
}

/// Lazy iterator over the records completed by a `feed` call
pub struct Messages<'a> {
    framer: &'a mut Framer,
}

impl Iterator for Messages<'_> {
    type Item = DecodedMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_message()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Decode one message (standard header onwards) into its fields
pub fn decode_record(record: &[u8], storage: Option<StorageHeader>) -> Result<DecodedMessage> {
    let header = StandardHeader::parse(record)
        .ok_or_else(|| EngineError::InvalidFrame("short standard header".into()))?;
    let length = usize::from(header.length);
    let header_size = header.header_size();
    if length < header_size || record.len() < length {
        return Err(EngineError::InvalidFrame(format!(
            "declared length {} does not fit header size {} / record size {}",
            length,
            header_size,
            record.len()
        )));
    }

    let mut pos = STANDARD_HEADER_SIZE;
    let mut extra = || {
        let value = &record[pos..pos + 4];
        pos += 4;
        value
    };
    let ecu_id = if header.has_ecu_id() { DltId::from_slice(extra()) } else { None };
    let session_id = if header.has_session_id() { Some(BigEndian::read_u32(extra())) } else { None };
    let uptime = if header.has_timestamp() { Some(BigEndian::read_u32(extra())) } else { None };

    let extended = if header.has_extended_header() {
        let extended_start = header_size - EXTENDED_HEADER_SIZE;
        ExtendedHeader::parse(&record[extended_start..header_size])
    } else {
        None
    };

    Ok(DecodedMessage {
        storage,
        htyp: header.htyp,
        counter: header.counter,
        ecu_id,
        session_id,
        uptime,
        info: extended.map(|e| e.info),
        argument_count: extended.map(|e| e.argument_count).unwrap_or(0),
        app_id: extended.map(|e| e.app_id),
        ctx_id: extended.map(|e| e.ctx_id),
        endianness: header.endianness(),
        header: record[..header_size].to_vec(),
        payload: record[header_size..length].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::HeaderFields;
    use crate::types::{Endianness, MessageInfo, MessageTime, MessageType};

    fn log_message() -> Vec<u8> {
        let fields = HeaderFields {
            counter: 1,
            ecu_id: Some(DltId::new("ECU1")),
            session_id: None,
            uptime: Some(42),
            extended: Some(ExtendedHeader {
                info: MessageInfo { message_type: MessageType::Log, subtype: 4, verbose: true },
                argument_count: 0,
                app_id: DltId::new("APP1"),
                ctx_id: DltId::new("CTX1"),
            }),
            endianness: Endianness::Little,
        };
        fields.encode(0).unwrap()
    }

    fn storage_record() -> Vec<u8> {
        let mut record = Vec::new();
        StorageHeader::new(MessageTime::new(100, 5), DltId::new("ECU1")).write(&mut record);
        record.extend_from_slice(&log_message());
        record
    }

    #[test]
    fn test_frame_garbage_frame() {
        let mut stream = storage_record();
        stream.extend_from_slice(&[0xAA, 0x55, 0x00, 0xFF, 0x13]);
        stream.extend_from_slice(&storage_record());

        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());
        let messages: Vec<_> = framer.feed(&stream).collect();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].app().to_string(), "APP1");
        assert_eq!(messages[1].ctx().to_string(), "CTX1");
        assert_eq!(messages[0].header.len(), 22);

        let stats = framer.stats();
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.errors, 0);
        assert_eq!(stats.bytes_skipped, 5);
        assert_eq!(stats.messages, 2);
    }

    #[test]
    fn test_split_feed_keeps_partial_frame() {
        let record = storage_record();
        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());

        assert_eq!(framer.feed(&record[..10]).count(), 0);
        assert_eq!(framer.buffered(), 10);
        let messages: Vec<_> = framer.feed(&record[10..]).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].time(), Some(MessageTime::new(100, 5)));
        assert_eq!(framer.stats().bytes_skipped, 0);
    }

    #[test]
    fn test_partial_marker_at_tail_is_kept() {
        let record = storage_record();
        let mut stream = vec![0x11, 0x22];
        stream.extend_from_slice(&record[..2]);

        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());
        assert_eq!(framer.feed(&stream).count(), 0);
        assert_eq!(framer.feed(&record[2..]).count(), 1);
        assert_eq!(framer.stats().bytes_skipped, 2);
        assert_eq!(framer.stats().resyncs, 1);
    }

    #[test]
    fn test_bad_length_counts_error() {
        let mut bogus = Vec::new();
        StorageHeader::new(MessageTime::default(), DltId::new("X")).write(&mut bogus);
        // length 2 is below the minimum header size
        bogus.extend_from_slice(&[0x21, 0x00, 0x00, 0x02]);
        bogus.extend_from_slice(&storage_record());

        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());
        assert_eq!(framer.feed(&bogus).count(), 1);
        assert_eq!(framer.stats().errors, 1);
        assert_eq!(framer.stats().resyncs, 1);
    }

    #[test]
    fn test_frame_offsets() {
        let record = storage_record();
        let mut stream = record.clone();
        stream.extend_from_slice(&record);

        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default()).with_offset(1000);
        framer.push(&stream);
        let (first, _) = framer.next_frame().unwrap();
        let (second, _) = framer.next_frame().unwrap();
        assert_eq!(first, RawFrame { offset: 1000, length: record.len() });
        assert_eq!(second.offset, 1000 + record.len() as u64);
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn test_raw_and_serial_modes() {
        let message = log_message();
        let mut raw = message.clone();
        raw.extend_from_slice(&message);
        let mut framer = Framer::new(SyncMode::Raw, &FramerConfig::default());
        assert_eq!(framer.feed(&raw).count(), 2);

        let mut serial = SERIAL_PATTERN.to_vec();
        serial.extend_from_slice(&message);
        let mut framer = Framer::new(SyncMode::Serial, &FramerConfig::default());
        let messages: Vec<_> = framer.feed(&serial).collect();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].storage.is_none());
        assert_eq!(messages[0].ecu().to_string(), "ECU1");
        assert_eq!(messages[0].uptime, Some(42));
    }

    #[test]
    fn test_serial_marker_before_storage_header() {
        let mut stream = SERIAL_PATTERN.to_vec();
        stream.extend_from_slice(&storage_record());
        stream.extend_from_slice(&SERIAL_PATTERN);
        stream.extend_from_slice(&log_message());

        let mut framer = Framer::new(SyncMode::Serial, &FramerConfig::default());
        framer.push(&stream);
        let (first, message) = framer.next_frame().unwrap();
        assert_eq!(first.length, 4 + storage_record().len());
        assert_eq!(message.time(), Some(MessageTime::new(100, 5)));
        let (_, message) = framer.next_frame().unwrap();
        assert!(message.storage.is_none());
        assert!(framer.next_frame().is_none());
        assert_eq!(framer.stats().errors, 0);
    }

    #[test]
    fn test_serial_waits_for_storage_pattern_decision() {
        let mut stream = SERIAL_PATTERN.to_vec();
        stream.extend_from_slice(&storage_record());

        let mut framer = Framer::new(SyncMode::Serial, &FramerConfig::default());
        assert_eq!(framer.feed(&stream[..6]).count(), 0);
        assert_eq!(framer.buffered(), 6);
        assert_eq!(framer.feed(&stream[6..]).count(), 1);
        assert_eq!(framer.stats().errors, 0);
    }

    #[test]
    fn test_wrong_protocol_version_is_rejected() {
        let mut stream = Vec::new();
        StorageHeader::new(MessageTime::default(), DltId::new("X")).write(&mut stream);
        // version bits 2, otherwise a consistent header
        stream.extend_from_slice(&[0x40, 0x00, 0x00, 0x04]);
        stream.extend_from_slice(&storage_record());

        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());
        let messages: Vec<_> = framer.feed(&stream).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(framer.stats().errors, 1);
    }

    #[test]
    fn test_finish_discards_incomplete_candidate() {
        let record = storage_record();
        let mut framer = Framer::new(SyncMode::Storage, &FramerConfig::default());
        assert_eq!(framer.feed(&record[..record.len() - 1]).count(), 0);
        assert_eq!(framer.finish().count(), 0);
        assert_eq!(framer.buffered(), 0);
        assert_eq!(framer.stats().errors, 1);
        assert_eq!(framer.stats().bytes_skipped, (record.len() - 1) as u64);
    }
}
