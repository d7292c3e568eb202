//! # Voltage Fieldbus Error Handling
//!
//! This module provides the error type shared by every layer of the library:
//! address parsing, value conversion, framing, transport and device replies.
//!
//! ## Overview
//!
//! Errors never cross the machine boundary as `Err` values. `BaseMachine`
//! converts every `FieldbusError` into a `ReturnStruct` carrying the numeric
//! [`FieldbusError::error_code`], so the error code scheme matters as much as
//! the variant itself:
//!
//! | Range | Meaning |
//! |-------|---------|
//! | `< 0` | Local, configuration or transport failure |
//! | `1..=499` | Code reported by the device (Modbus exception, S7 return code) |
//! | `500` | Modbus/TCP length field does not match the frame |
//! | `501` | Modbus/RTU (or HJ212) CRC mismatch |
//! | `502` | Modbus/ASCII LRC mismatch |
//! | `>= 0x100` | Siemens error class/code pair (`class << 8 | code`) |
//!
//! ## Error Categories
//!
//! ### Configuration Errors
//! - **Format**: malformed textual address, e.g. `"4X"` or `"4X abc"`
//! - **Unknown Area**: area not present in the translator table
//! - **Unknown Tag**: selector key that no address unit carries
//!
//! ### Transport Errors
//! - **I/O / Connection**: socket or serial port failures
//! - **Timeout**: no reply within the configured time, after one resend
//! - **Channel Saturated**: the controller refused to queue another message
//!
//! ### Protocol Errors
//! - **Protocol**: the device explicitly rejected the request
//! - **Checksum**: CRC/LRC mismatch, the channel is assumed desynchronized
//!
//! ## Usage Example
//!
//! ```rust
//! use voltage_fieldbus::{FieldbusError, FieldbusResult};
//!
//! fn classify(result: FieldbusResult<Vec<u8>>) -> i32 {
//!     match result {
//!         Ok(_) => 0,
//!         Err(error) if error.forces_disconnect() => {
//!             println!("Channel broken: {}", error);
//!             error.error_code()
//!         }
//!         Err(error) => error.error_code(),
//!     }
//! }
//!
//! assert_eq!(classify(Err(FieldbusError::modbus_exception(0x03, 0x02))), 2);
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias for fieldbus operations
pub type FieldbusResult<T> = Result<T, FieldbusError>;

/// Error code reported when the Modbus/TCP length field disagrees with the frame
pub const MODBUS_TCP_LENGTH_ERROR: i32 = 500;

/// Error code reported on a CRC mismatch
pub const CRC_ERROR: i32 = 501;

/// Error code reported on an LRC mismatch
pub const LRC_ERROR: i32 = 502;

/// Checksum algorithm that rejected a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// CRC-16 (Modbus RTU, HJ212)
    Crc,
    /// Longitudinal redundancy check (Modbus ASCII)
    Lrc,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Crc => write!(f, "CRC"),
            ChecksumKind::Lrc => write!(f, "LRC"),
        }
    }
}

/// Fieldbus error types
///
/// Each variant carries enough context to build a readable `error_msg` for
/// the caller and a stable numeric code through [`FieldbusError::error_code`].
#[derive(Error, Debug, Clone)]
pub enum FieldbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Raised when no reply arrives in time (after the single resend), or
    /// when send permission cannot be acquired in time.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The controller refused to queue another in-flight message
    #[error("Channel saturated: {message}")]
    ChannelSaturated { message: String },

    /// Malformed textual address
    #[error("Invalid address format '{address}': {message}")]
    Format { address: String, message: String },

    /// Address area missing from the translator table
    #[error("Unknown address area: {area}")]
    UnknownArea { area: String },

    /// Buffer too short or otherwise unusable for a value conversion
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Data type name that the codec does not support
    #[error("Unsupported data type: {type_name}")]
    UnsupportedType { type_name: String },

    /// Device explicitly rejected the request
    ///
    /// `code` is the device-reported code preserved for the caller: the
    /// Modbus exception byte, an S7 item return code, or an S7 error
    /// class/code pair.
    #[error("{family} protocol error {code}: {message}")]
    Protocol {
        family: String,
        code: i32,
        message: String,
    },

    /// Checksum validation failure on a received frame
    #[error("{kind} validation failed: expected={expected:04X}, actual={actual:04X}")]
    Checksum {
        kind: ChecksumKind,
        expected: u16,
        actual: u16,
    },

    /// Frame structure errors (truncated, oversized, wrong markers)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Selector key not carried by any address unit of the machine
    #[error("Unknown tag: {tag}")]
    UnknownTag { tag: String },

    /// Operation aborted through its cancellation token
    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FieldbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a channel saturation error
    pub fn saturated<S: Into<String>>(message: S) -> Self {
        Self::ChannelSaturated { message: message.into() }
    }

    /// Create an address format error
    pub fn format<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        Self::Format {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create an unknown area error
    pub fn unknown_area<S: Into<String>>(area: S) -> Self {
        Self::UnknownArea { area: area.into() }
    }

    /// Create a codec error
    pub fn codec<S: Into<String>>(message: S) -> Self {
        Self::Codec { message: message.into() }
    }

    /// Create an unsupported type error
    pub fn unsupported_type<S: Into<String>>(type_name: S) -> Self {
        Self::UnsupportedType { type_name: type_name.into() }
    }

    /// Create a device-reported protocol error
    pub fn protocol<F: Into<String>, S: Into<String>>(family: F, code: i32, message: S) -> Self {
        Self::Protocol {
            family: family.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a Modbus exception error from the function byte and exception code
    pub fn modbus_exception(function: u8, code: u8) -> Self {
        let description = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        };

        Self::protocol(
            "Modbus",
            code as i32,
            format!("{} (function={:02X})", description, function & 0x7F),
        )
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::Checksum {
            kind: ChecksumKind::Crc,
            expected,
            actual,
        }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::Checksum {
            kind: ChecksumKind::Lrc,
            expected: expected as u16,
            actual: actual as u16,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an unknown tag error
    pub fn unknown_tag<S: Into<String>>(tag: S) -> Self {
        Self::UnknownTag { tag: tag.into() }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled { operation: operation.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Numeric code reported in `ReturnStruct::error_code`
    ///
    /// Device-reported codes are positive and preserved verbatim; local and
    /// transport failures map to stable negative codes.
    pub fn error_code(&self) -> i32 {
        match self {
            Self::Io { .. } => -1,
            Self::Connection { .. } => -2,
            Self::Timeout { .. } => -3,
            Self::ChannelSaturated { .. } => -4,
            Self::Cancelled { .. } => -5,
            Self::Frame { .. } => -6,
            Self::Format { .. } => -10,
            Self::UnknownArea { .. } => -11,
            Self::Codec { .. } => -12,
            Self::UnsupportedType { .. } => -13,
            Self::Configuration { .. } => -14,
            Self::UnknownTag { .. } => -15,
            Self::Internal { .. } => -99,
            Self::Protocol { code, .. } => *code,
            Self::Checksum { kind: ChecksumKind::Crc, .. } => CRC_ERROR,
            Self::Checksum { kind: ChecksumKind::Lrc, .. } => LRC_ERROR,
        }
    }

    /// Check if the error is transient and a later call may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::ChannelSaturated { .. } => true,
            Self::Checksum { .. } => true,
            Self::Protocol { family, code, .. } => {
                // Acknowledge, Busy
                family == "Modbus" && matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is transport-related
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::ChannelSaturated { .. }
        )
    }

    /// Check if the error is protocol-related
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Checksum { .. } | Self::Frame { .. }
        )
    }

    /// Check if the error is a configuration problem of the caller
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Format { .. }
                | Self::UnknownArea { .. }
                | Self::UnknownTag { .. }
                | Self::UnsupportedType { .. }
                | Self::Configuration { .. }
        )
    }

    /// Check if the channel must be dropped after this error
    ///
    /// A checksum or length mismatch means the byte stream may be
    /// misaligned, so the connection is closed instead of silently retried.
    pub fn forces_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Checksum { .. }
                | Self::Protocol {
                    code: MODBUS_TCP_LENGTH_ERROR,
                    ..
                }
        )
    }
}

impl From<std::io::Error> for FieldbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for FieldbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for FieldbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

impl From<serde_json::Error> for FieldbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for FieldbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
