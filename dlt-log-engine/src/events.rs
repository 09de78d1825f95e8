//! One-way engine event channel
//!
//! Components publish progress and state changes here. Whoever owns the
//! receiving end decides how to present them; the engine never calls back
//! into presentation code.

use crate::tree::ConnectionState;
use crate::types::DltId;
use std::sync::mpsc::{self, Receiver, Sender};

/// Indexing phases, always finished in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Index,
    Filter,
    DefaultFilter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Upper bound for the following progress values
    ProgressMax(u64),
    Progress(u64),
    ProgressText(String),
    PhaseFinished(Phase),
    VersionDetected { ecu: DltId, version: String },
    /// A run was stopped before publishing results
    Cancelled,
    ConnectionChanged { ecu: DltId, state: ConnectionState, online: bool },
    /// Live messages were appended to the log file
    MessagesAppended(usize),
}

pub type EventSender = Sender<EngineEvent>;
pub type EventReceiver = Receiver<EngineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel()
}

/// Send an event if anyone listens; a closed receiver is not an error
pub(crate) fn emit(sender: Option<&EventSender>, event: EngineEvent) {
    if let Some(sender) = sender {
        let _ = sender.send(event);
    }
}
