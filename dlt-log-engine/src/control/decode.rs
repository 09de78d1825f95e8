use super::ControlOutcome;
use crate::protocol::service;
use crate::tree::{EcuTree, NodeId, Validity};
use crate::types::{DecodedMessage, DltId, EngineError, Endianness, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use log::{debug, trace};
use std::io::{Cursor, Read};

/// Field reader over a control payload in the message's byte order
struct PayloadReader<'a> {
    cursor: Cursor<&'a [u8]>,
    endianness: Endianness,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8], endianness: Endianness) -> Self {
        Self { cursor: Cursor::new(payload), endianness }
    }

    fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        self.cursor.read_u8().map_err(|_| EngineError::Truncated(what))
    }

    fn i8(&mut self, what: &'static str) -> Result<i8> {
        self.cursor.read_i8().map_err(|_| EngineError::Truncated(what))
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        match self.endianness {
            Endianness::Little => self.cursor.read_u16::<LittleEndian>(),
            Endianness::Big => self.cursor.read_u16::<BigEndian>(),
        }
        .map_err(|_| EngineError::Truncated(what))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        match self.endianness {
            Endianness::Little => self.cursor.read_u32::<LittleEndian>(),
            Endianness::Big => self.cursor.read_u32::<BigEndian>(),
        }
        .map_err(|_| EngineError::Truncated(what))
    }

    fn i32(&mut self, what: &'static str) -> Result<i32> {
        match self.endianness {
            Endianness::Little => self.cursor.read_i32::<LittleEndian>(),
            Endianness::Big => self.cursor.read_i32::<BigEndian>(),
        }
        .map_err(|_| EngineError::Truncated(what))
    }

    fn id(&mut self, what: &'static str) -> Result<DltId> {
        let mut bytes = [0u8; 4];
        self.cursor.read_exact(&mut bytes).map_err(|_| EngineError::Truncated(what))?;
        Ok(DltId::from_bytes(bytes))
    }

    fn text(&mut self, len: usize, what: &'static str) -> Result<String> {
        if self.remaining() < len {
            return Err(EngineError::Truncated(what));
        }
        let mut bytes = vec![0u8; len];
        self.cursor.read_exact(&mut bytes).map_err(|_| EngineError::Truncated(what))?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

pub(super) fn apply_response(
    tree: &mut EcuTree,
    ecu: NodeId,
    message: &DecodedMessage,
    update_contexts_on_unregister: bool,
) -> ControlOutcome {
    let Some(service_id) = message.service_id() else {
        return ControlOutcome::Ignored;
    };
    let mut reader = PayloadReader::new(&message.payload[4..], message.endianness);

    let result = match service_id {
        service::GET_LOG_INFO => log_info(tree, ecu, &mut reader),
        service::GET_DEFAULT_LOG_LEVEL => default_log_level(tree, ecu, &mut reader),
        service::SET_LOG_LEVEL | service::SET_TRACE_STATUS => reader
            .u8("status")
            .map(|status| ControlOutcome::Status { service_id, status }),
        service::TIMEZONE => timezone(&mut reader),
        service::UNREGISTER_CONTEXT => {
            unregister_context(tree, message.ecu(), &mut reader, update_contexts_on_unregister)
        }
        service::GET_SOFTWARE_VERSION => software_version(&mut reader),
        other => {
            trace!("Ignoring control response {}", service::name(other));
            Ok(ControlOutcome::Ignored)
        }
    };

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!("Control response parse aborted: {}", e);
            ControlOutcome::Corrupted { service_id }
        }
    }
}

fn log_info(tree: &mut EcuTree, ecu: NodeId, reader: &mut PayloadReader<'_>) -> Result<ControlOutcome> {
    let status = reader.u8("log info status")?;
    if status == 8 {
        tree.invalidate_all(ecu);
        return Ok(ControlOutcome::LogInfoInvalidated);
    }
    if status != 6 && status != 7 {
        return Ok(ControlOutcome::LogInfo { status, contexts: 0 });
    }
    let with_descriptions = status == 7;

    let mut contexts = 0;
    let app_count = reader.u16("application count")?;
    for _ in 0..app_count {
        let app_id = reader.id("application id")?;
        let ctx_count = reader.u16("context count")?;
        for _ in 0..ctx_count {
            let ctx_id = reader.id("context id")?;
            let log_level = reader.i8("log level")?;
            let trace_status = reader.i8("trace status")?;
            let description = if with_descriptions {
                let len = usize::from(reader.u16("context description length")?);
                Some(reader.text(len, "context description")?)
            } else {
                None
            };
            tree.upsert_context(ecu, app_id, ctx_id, log_level, trace_status, description.as_deref());
            contexts += 1;
        }
        if with_descriptions {
            let len = usize::from(reader.u16("application description length")?);
            let description = reader.text(len, "application description")?;
            tree.upsert_application(ecu, app_id, &description);
        } else if ctx_count == 0 {
            tree.upsert_application(ecu, app_id, "");
        }
    }
    reader.id("com interface")?;

    Ok(ControlOutcome::LogInfo { status, contexts })
}

fn default_log_level(tree: &mut EcuTree, ecu: NodeId, reader: &mut PayloadReader<'_>) -> Result<ControlOutcome> {
    let status = reader.u8("status")?;
    let level = reader.i8("log level")?;
    let Some(node) = tree.ecu_mut(ecu) else {
        return Ok(ControlOutcome::Ignored);
    };
    let log_level = match status {
        service::RESPONSE_OK => {
            node.log_level = level;
            node.validity = Validity::Valid;
            Some(level)
        }
        service::RESPONSE_NOT_SUPPORTED => {
            node.validity = Validity::Unknown;
            None
        }
        service::RESPONSE_ERROR => {
            node.validity = Validity::Invalid;
            None
        }
        other => {
            trace!("Unknown default log level status {}", other);
            None
        }
    };
    Ok(ControlOutcome::DefaultLogLevel { status, log_level })
}

fn timezone(reader: &mut PayloadReader<'_>) -> Result<ControlOutcome> {
    // bare {offset, isdst} or status-prefixed
    if reader.remaining() >= 6 {
        reader.u8("status")?;
    }
    let offset_seconds = reader.i32("timezone offset")?;
    let is_dst = reader.u8("dst flag")? != 0;
    Ok(ControlOutcome::Timezone { offset_seconds, is_dst })
}

/// The owning ECU is the one named in the message, not the connection it
/// arrived on
fn unregister_context(
    tree: &mut EcuTree,
    ecu_id: DltId,
    reader: &mut PayloadReader<'_>,
    enabled: bool,
) -> Result<ControlOutcome> {
    // bare {apid, ctid} or {status, apid, ctid, com}
    if reader.remaining() >= 9 {
        reader.u8("status")?;
    }
    let app_id = reader.id("application id")?;
    let ctx_id = reader.id("context id")?;
    let removed = enabled
        && tree
            .find_ecu(&ecu_id)
            .is_some_and(|ecu| tree.remove_context(ecu, &app_id, &ctx_id));
    if removed {
        debug!("Context {}:{} unregistered", app_id, ctx_id);
    }
    Ok(ControlOutcome::ContextUnregistered { app_id, ctx_id, removed })
}

fn software_version(reader: &mut PayloadReader<'_>) -> Result<ControlOutcome> {
    let _status = reader.u8("status")?;
    let len = reader.u32("version length")? as usize;
    let version = reader.text(len, "version")?;
    Ok(ControlOutcome::SoftwareVersion(version.trim().to_string()))
}

/// Version text of a GetSoftwareVersion response, if `message` is one
pub(super) fn parse_software_version(message: &DecodedMessage) -> Option<String> {
    if !message.is_control_response() || message.service_id() != Some(service::GET_SOFTWARE_VERSION) {
        return None;
    }
    let mut reader = PayloadReader::new(&message.payload[4..], message.endianness);
    match software_version(&mut reader) {
        Ok(ControlOutcome::SoftwareVersion(version)) => Some(version),
        _ => None,
    }
}
