use super::MARKER_ID;
use crate::protocol::header::{ExtendedHeader, HeaderFields, StorageHeader, SERIAL_PATTERN};
use crate::protocol::service::{self, COM_INTERFACE};
use crate::types::{DltId, EngineError, Endianness, MessageInfo, MessageTime, Result};

/// Control requests understood by DLT daemons
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    SetLogLevel { app_id: DltId, ctx_id: DltId, log_level: i8 },
    SetTraceStatus { app_id: DltId, ctx_id: DltId, trace_status: i8 },
    SetDefaultLogLevel(i8),
    SetDefaultTraceStatus(i8),
    SetVerboseMode(bool),
    SetTimingPackets(bool),
    /// All applications and contexts, with descriptions
    GetLogInfo,
    GetDefaultLogLevel,
    StoreConfig,
    ResetToFactoryDefault,
    GetSoftwareVersion,
    GetLocalTime,
    /// Custom service; `service_id` must be at least 0xFFF
    Injection { service_id: u32, data: Vec<u8> },
}

impl ControlRequest {
    pub fn service_id(&self) -> u32 {
        match self {
            ControlRequest::SetLogLevel { .. } => service::SET_LOG_LEVEL,
            ControlRequest::SetTraceStatus { .. } => service::SET_TRACE_STATUS,
            ControlRequest::SetDefaultLogLevel(_) => service::SET_DEFAULT_LOG_LEVEL,
            ControlRequest::SetDefaultTraceStatus(_) => service::SET_DEFAULT_TRACE_STATUS,
            ControlRequest::SetVerboseMode(_) => service::SET_VERBOSE_MODE,
            ControlRequest::SetTimingPackets(_) => service::SET_TIMING_PACKETS,
            ControlRequest::GetLogInfo => service::GET_LOG_INFO,
            ControlRequest::GetDefaultLogLevel => service::GET_DEFAULT_LOG_LEVEL,
            ControlRequest::StoreConfig => service::STORE_CONFIG,
            ControlRequest::ResetToFactoryDefault => service::RESET_TO_FACTORY_DEFAULT,
            ControlRequest::GetSoftwareVersion => service::GET_SOFTWARE_VERSION,
            ControlRequest::GetLocalTime => service::GET_LOCAL_TIME,
            ControlRequest::Injection { service_id, .. } => *service_id,
        }
    }

    /// Payload in host byte order, starting with the service id
    pub fn payload(&self) -> Result<Vec<u8>> {
        let service_id = self.service_id();
        let mut out = service_id.to_ne_bytes().to_vec();
        match self {
            ControlRequest::SetLogLevel { app_id, ctx_id, log_level: value }
            | ControlRequest::SetTraceStatus { app_id, ctx_id, trace_status: value } => {
                out.extend_from_slice(app_id.as_bytes());
                out.extend_from_slice(ctx_id.as_bytes());
                out.push(*value as u8);
                out.extend_from_slice(&COM_INTERFACE);
            }
            ControlRequest::SetDefaultLogLevel(value) | ControlRequest::SetDefaultTraceStatus(value) => {
                out.push(*value as u8);
                out.extend_from_slice(&COM_INTERFACE);
            }
            ControlRequest::SetVerboseMode(enabled) | ControlRequest::SetTimingPackets(enabled) => {
                out.push(u8::from(*enabled));
            }
            ControlRequest::GetLogInfo => {
                out.push(7);
                out.extend_from_slice(DltId::EMPTY.as_bytes());
                out.extend_from_slice(DltId::EMPTY.as_bytes());
                out.extend_from_slice(&COM_INTERFACE);
            }
            ControlRequest::Injection { data, .. } => {
                if service_id < service::CALLSW_CINJECTION {
                    return Err(EngineError::InvalidService(service_id));
                }
                let len = u32::try_from(data.len())
                    .map_err(|_| EngineError::InvalidFrame("injection payload too large".into()))?;
                out.extend_from_slice(&len.to_ne_bytes());
                out.extend_from_slice(data);
            }
            ControlRequest::GetDefaultLogLevel
            | ControlRequest::StoreConfig
            | ControlRequest::ResetToFactoryDefault
            | ControlRequest::GetSoftwareVersion
            | ControlRequest::GetLocalTime => {}
        }
        Ok(out)
    }
}

/// An encoded control record
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub service_id: u32,
    pub storage: StorageHeader,
    /// Standard header onwards
    pub message: Vec<u8>,
    pub serial_marker: bool,
}

impl EncodedRequest {
    /// Storage header + message, as written to a log file
    pub fn record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(StorageHeader::SIZE + self.message.len());
        self.storage.write(&mut out);
        out.extend_from_slice(&self.message);
        out
    }

    /// Bytes sent to the ECU
    pub fn wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SERIAL_PATTERN.len() + self.message.len());
        if self.serial_marker {
            out.extend_from_slice(&SERIAL_PATTERN);
        }
        out.extend_from_slice(&self.message);
        out
    }
}

fn build(
    ecu_id: DltId,
    info: MessageInfo,
    app_id: DltId,
    ctx_id: DltId,
    uptime: u32,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    let fields = HeaderFields {
        counter: 0,
        ecu_id: Some(ecu_id),
        session_id: None,
        uptime: Some(uptime),
        extended: Some(ExtendedHeader { info, argument_count: 1, app_id, ctx_id }),
        endianness: Endianness::native(),
    };
    let mut message = fields.encode(payload.len())?;
    message.extend_from_slice(&payload);
    Ok(message)
}

pub(super) fn encode_request(
    ecu_id: DltId,
    request: &ControlRequest,
    app_id: DltId,
    ctx_id: DltId,
    uptime: u32,
    serial_marker: bool,
) -> Result<EncodedRequest> {
    let payload = request.payload()?;
    Ok(EncodedRequest {
        service_id: request.service_id(),
        storage: StorageHeader::new(MessageTime::now(), ecu_id),
        message: build(ecu_id, MessageInfo::control_request(), app_id, ctx_id, uptime, payload)?,
        serial_marker,
    })
}

pub(super) fn encode_marker(uptime: u32) -> Result<EncodedRequest> {
    let mut payload = service::MARKER.to_ne_bytes().to_vec();
    payload.push(service::RESPONSE_OK);
    Ok(EncodedRequest {
        service_id: service::MARKER,
        storage: StorageHeader::new(MessageTime::now(), MARKER_ID),
        message: build(MARKER_ID, MessageInfo::control_response(), MARKER_ID, MARKER_ID, uptime, payload)?,
        serial_marker: false,
    })
}
