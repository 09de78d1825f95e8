//! Control message codec
//!
//! Builds outbound control requests for an ECU and applies inbound control
//! responses to the ECU / Application / Context tree.
//!
//! # Example
//!
//! ```
//! use dlt_log_engine::control::{ControlCodec, ControlRequest};
//! use dlt_log_engine::tree::EcuNode;
//! use dlt_log_engine::ConnectionConfig;
//!
//! let codec = ControlCodec::new(&ConnectionConfig::default());
//! let ecu = EcuNode::tcp("ECU1", "localhost", 3490);
//! let request = codec.encode(&ecu, &ControlRequest::GetLogInfo, None, None).unwrap();
//! assert_eq!(request.service_id, 0x03);
//! ```

mod decode;
mod encode;

pub use encode::{ControlRequest, EncodedRequest};

use crate::config::ConnectionConfig;
use crate::tree::{EcuNode, EcuTree, NodeId};
use crate::types::{DecodedMessage, DltId, Result};
use log::{debug, warn};
use std::time::Instant;

/// Placeholder application id used for control requests
pub const DEFAULT_APP_ID: DltId = DltId::from_bytes(*b"APP\0");
/// Placeholder context id used for control requests
pub const DEFAULT_CTX_ID: DltId = DltId::from_bytes(*b"CON\0");
/// Id used for locally written marker records
pub const MARKER_ID: DltId = DltId::from_bytes(*b"DLTV");
/// Port used when an ECU is created from a log file
pub const DEFAULT_TCP_PORT: u16 = 3490;

/// What applying a control response did
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    /// Not a control response, or a service this core does not track
    Ignored,
    /// GetLogInfo applied; `contexts` upserts were made
    LogInfo { status: u8, contexts: usize },
    /// GetLogInfo with status 8: everything below the ECU was invalidated
    LogInfoInvalidated,
    DefaultLogLevel { status: u8, log_level: Option<i8> },
    /// Plain status answer (SetLogLevel, SetTraceStatus, ...)
    Status { service_id: u32, status: u8 },
    Timezone { offset_seconds: i32, is_dst: bool },
    ContextUnregistered { app_id: DltId, ctx_id: DltId, removed: bool },
    SoftwareVersion(String),
    /// The payload ended early; updates applied before the cut are kept
    Corrupted { service_id: u32 },
}

pub struct ControlCodec {
    update_contexts_on_unregister: bool,
    started: Instant,
    corrupted: u64,
}

impl ControlCodec {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            update_contexts_on_unregister: config.update_contexts_on_unregister,
            started: Instant::now(),
            corrupted: 0,
        }
    }

    /// Number of control responses that could not be fully parsed
    pub fn corrupted(&self) -> u64 {
        self.corrupted
    }

    /// Uptime in 0.1 ms units since the codec was created
    fn uptime(&self) -> u32 {
        (self.started.elapsed().as_micros() / 100) as u32
    }

    /// Encode a control request addressed to `ecu`
    pub fn encode(
        &self,
        ecu: &EcuNode,
        request: &ControlRequest,
        app_id: Option<DltId>,
        ctx_id: Option<DltId>,
    ) -> Result<EncodedRequest> {
        let encoded = encode::encode_request(
            ecu.id,
            request,
            app_id.unwrap_or(DEFAULT_APP_ID),
            ctx_id.unwrap_or(DEFAULT_CTX_ID),
            self.uptime(),
            ecu.send_serial_header,
        )?;
        debug!(
            "Encoded {} for ECU {} ({} bytes)",
            crate::protocol::service::name(encoded.service_id),
            ecu.id,
            encoded.message.len()
        );
        Ok(encoded)
    }

    /// Marker record for the log file
    pub fn encode_marker(&self) -> Result<EncodedRequest> {
        encode::encode_marker(self.uptime())
    }

    /// Apply a control response received from the ECU at `ecu`
    pub fn handle_response(&mut self, tree: &mut EcuTree, ecu: NodeId, message: &DecodedMessage) -> ControlOutcome {
        if !message.is_control_response() {
            return ControlOutcome::Ignored;
        }
        let outcome = decode::apply_response(tree, ecu, message, self.update_contexts_on_unregister);
        if let ControlOutcome::Corrupted { service_id } = outcome {
            self.corrupted += 1;
            warn!(
                "Corrupted {} response from ECU {}",
                crate::protocol::service::name(service_id),
                message.ecu()
            );
        }
        outcome
    }

    /// Replay GetLogInfo responses found in a log file into the tree.
    /// ECUs that are not configured yet are created.
    pub fn load_contexts<'a, I>(&mut self, tree: &mut EcuTree, messages: I) -> usize
    where
        I: IntoIterator<Item = &'a DecodedMessage>,
    {
        let mut applied = 0;
        for message in messages {
            if message.service_id() != Some(crate::protocol::service::GET_LOG_INFO)
                || !message.is_control_response()
            {
                continue;
            }
            let ecu_id = message.ecu();
            let ecu = match tree.find_ecu(&ecu_id) {
                Some(ecu) => ecu,
                None => {
                    debug!("Creating ECU {} from log file", ecu_id);
                    tree.add_ecu(EcuNode::tcp(ecu_id, "localhost", DEFAULT_TCP_PORT))
                }
            };
            if let ControlOutcome::LogInfo { .. } = self.handle_response(tree, ecu, message) {
                applied += 1;
            }
        }
        applied
    }
}

/// Version text carried by a GetSoftwareVersion response
pub fn software_version(message: &DecodedMessage) -> Option<String> {
    decode::parse_software_version(message)
}
