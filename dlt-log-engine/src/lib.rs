//! DLT Log Engine Library
//!
//! Transport and indexing core for DLT (Diagnostic Log and Trace) traffic.
//!
//! # Architecture
//!
//! - [`framer`] extracts complete messages from a byte stream (file, TCP or
//!   serial), resynchronising past garbage
//! - [`control`] encodes control requests and applies control responses to
//!   the [`tree::EcuTree`]
//! - [`filter`] evaluates ordered positive / negative / marker rules
//! - [`indexer`] builds the offset index and filtered views of a log file on
//!   a background worker
//! - [`connection`] keeps live ECU connections and appends their traffic to
//!   the log file, coordinated with the indexer through a [`WriteToken`]
//!
//! The library does NOT render anything and has no plugin mechanism. Views
//! and command-line handling live in the application layer (dlt-log-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use dlt_log_engine::{EngineConfig, Indexer, IndexRequest, WriteToken};
//! use dlt_log_engine::filter::FilterRule;
//!
//! let config = EngineConfig::default();
//! let mut indexer = Indexer::new("trace.dlt", &config, WriteToken::new());
//! indexer.set_filters(vec![FilterRule::positive("errors").with_log_levels(Some(1), Some(2))]);
//!
//! let state = indexer.run_blocking(IndexRequest::full()).unwrap();
//! println!("{} messages, {} matching", state.message_count(), state.filtered.len());
//! ```

pub mod config;
pub mod connection;
pub mod control;
pub mod events;
pub mod filter;
pub mod framer;
pub mod indexer;
pub mod lock;
pub mod logfile;
pub mod payload;
pub mod protocol;
pub mod tree;
pub mod types;

// Re-export main types for convenience
pub use config::{ConnectionConfig, EngineConfig, FramerConfig, IndexerConfig};
pub use connection::{ConnectionManager, ConnectionStats};
pub use control::{ControlCodec, ControlOutcome, ControlRequest};
pub use events::{EngineEvent, EventReceiver, EventSender, Phase};
pub use filter::{FilterKind, FilterRule, FilterSet, NamedFilterSet};
pub use framer::{Framer, FramerStats, SyncMode};
pub use indexer::{IndexMode, IndexRequest, IndexState, Indexer, StartOutcome};
pub use lock::WriteToken;
pub use tree::{EcuNode, EcuTree, Interface, NodeId};
pub use types::{DecodedMessage, DltId, EngineError, MessageTime, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(!VERSION.is_empty());

        let mut framer = Framer::new(SyncMode::Storage, &config.framer);
        assert_eq!(framer.feed(&[]).count(), 0);
    }
}
