//! DLT wire protocol definitions
//!
//! Header layouts (storage, standard, extended) and control service ids.
//! Everything here is pure data handling with no I/O.

pub mod header;
pub mod service;

pub use header::{ExtendedHeader, HeaderFields, StandardHeader, StorageHeader};

/// Log levels as carried in the MTIN field and in control payloads
pub mod log_level {
    pub const DEFAULT: i8 = -1;
    pub const OFF: i8 = 0;
    pub const FATAL: i8 = 1;
    pub const ERROR: i8 = 2;
    pub const WARN: i8 = 3;
    pub const INFO: i8 = 4;
    pub const DEBUG: i8 = 5;
    pub const VERBOSE: i8 = 6;

    pub fn name(level: i8) -> &'static str {
        match level {
            DEFAULT => "default",
            OFF => "off",
            FATAL => "fatal",
            ERROR => "error",
            WARN => "warn",
            INFO => "info",
            DEBUG => "debug",
            VERBOSE => "verbose",
            _ => "unknown",
        }
    }
}

/// Trace status values
pub mod trace_status {
    pub const DEFAULT: i8 = -1;
    pub const OFF: i8 = 0;
    pub const ON: i8 = 1;
}
