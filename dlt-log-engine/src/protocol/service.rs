//! Control service ids and response status codes

pub const SET_LOG_LEVEL: u32 = 0x01;
pub const SET_TRACE_STATUS: u32 = 0x02;
pub const GET_LOG_INFO: u32 = 0x03;
pub const GET_DEFAULT_LOG_LEVEL: u32 = 0x04;
pub const STORE_CONFIG: u32 = 0x05;
pub const RESET_TO_FACTORY_DEFAULT: u32 = 0x06;
pub const SET_COM_INTERFACE_STATUS: u32 = 0x07;
pub const SET_COM_INTERFACE_MAX_BANDWIDTH: u32 = 0x08;
pub const SET_VERBOSE_MODE: u32 = 0x09;
pub const SET_MESSAGE_FILTERING: u32 = 0x0A;
pub const SET_TIMING_PACKETS: u32 = 0x0B;
pub const GET_LOCAL_TIME: u32 = 0x0C;
pub const USE_ECU_ID: u32 = 0x0D;
pub const USE_SESSION_ID: u32 = 0x0E;
pub const USE_TIMESTAMP: u32 = 0x0F;
pub const USE_EXTENDED_HEADER: u32 = 0x10;
pub const SET_DEFAULT_LOG_LEVEL: u32 = 0x11;
pub const SET_DEFAULT_TRACE_STATUS: u32 = 0x12;
pub const GET_SOFTWARE_VERSION: u32 = 0x13;
pub const MESSAGE_BUFFER_OVERFLOW: u32 = 0x14;
pub const UNREGISTER_CONTEXT: u32 = 0xF01;
pub const CONNECTION_INFO: u32 = 0xF02;
pub const TIMEZONE: u32 = 0xF03;
pub const MARKER: u32 = 0xF04;
/// Lowest service id usable for injection messages
pub const CALLSW_CINJECTION: u32 = 0xFFF;

pub const RESPONSE_OK: u8 = 0;
pub const RESPONSE_NOT_SUPPORTED: u8 = 1;
pub const RESPONSE_ERROR: u8 = 2;

/// Communication interface id sent with configuration requests
pub const COM_INTERFACE: [u8; 4] = *b"remo";

pub fn name(service_id: u32) -> &'static str {
    match service_id {
        SET_LOG_LEVEL => "set_log_level",
        SET_TRACE_STATUS => "set_trace_status",
        GET_LOG_INFO => "get_log_info",
        GET_DEFAULT_LOG_LEVEL => "get_default_log_level",
        STORE_CONFIG => "store_config",
        RESET_TO_FACTORY_DEFAULT => "reset_to_factory_default",
        SET_COM_INTERFACE_STATUS => "set_com_interface_status",
        SET_COM_INTERFACE_MAX_BANDWIDTH => "set_com_interface_max_bandwidth",
        SET_VERBOSE_MODE => "set_verbose_mode",
        SET_MESSAGE_FILTERING => "set_message_filtering",
        SET_TIMING_PACKETS => "set_timing_packets",
        GET_LOCAL_TIME => "get_local_time",
        USE_ECU_ID => "use_ecu_id",
        USE_SESSION_ID => "use_session_id",
        USE_TIMESTAMP => "use_timestamp",
        USE_EXTENDED_HEADER => "use_extended_header",
        SET_DEFAULT_LOG_LEVEL => "set_default_log_level",
        SET_DEFAULT_TRACE_STATUS => "set_default_trace_status",
        GET_SOFTWARE_VERSION => "get_software_version",
        MESSAGE_BUFFER_OVERFLOW => "message_buffer_overflow",
        UNREGISTER_CONTEXT => "unregister_context",
        CONNECTION_INFO => "connection_info",
        TIMEZONE => "timezone",
        MARKER => "marker",
        id if id >= CALLSW_CINJECTION => "injection",
        _ => "service",
    }
}
