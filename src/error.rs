//! # Voltage Simulator Error Handling
//!
//! Error types for the simulator, split along the line the Modbus
//! specification itself draws:
//!
//! - [`ExceptionCode`] is the on-wire error domain. Every memory, device and
//!   dispatch operation returns `Result<T, ExceptionCode>`, and a failed
//!   request becomes an exception response (`function | 0x80` + code) rather
//!   than a dropped connection.
//! - [`SimError`] is the host-side error domain: socket and serial port
//!   failures, malformed frames, checksum mismatches, bad configuration.
//!   These are logged by the port runtime and never take a port task down.
//!
//! ## Idle serial reads
//!
//! A serial port with no traffic produces read timeouts continuously. These
//! are represented as [`SimError::SerialReadTimeout`] so the port loop can
//! recognise and skip them instead of flooding the error log:
//!
//! ```rust
//! use voltage_simulator::SimError;
//!
//! let err = SimError::SerialReadTimeout;
//! assert!(err.is_idle_timeout());
//! assert!(!SimError::frame("short frame").is_idle_timeout());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias for simulator operations
pub type SimResult<T> = Result<T, SimError>;

/// Standard Modbus exception codes
///
/// Returned by device memory and dispatch operations; a code travels back to
/// the requesting client as an exception PDU. The discriminants are the wire
/// values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    /// Function code not supported, or a write was issued to a read-only device
    IllegalFunction = 0x01,
    /// Address/quantity outside the device's memory or over its quota
    IllegalDataAddress = 0x02,
    /// Value field malformed (e.g. coil value not 0x0000/0xFF00)
    IllegalDataValue = 0x03,
    /// Unrecoverable device-side failure
    ServerDeviceFailure = 0x04,
    /// Request accepted, long-running processing started
    Acknowledge = 0x05,
    /// Device busy, retry later
    ServerDeviceBusy = 0x06,
    /// Extended memory parity check failed
    MemoryParityError = 0x08,
    /// No device mapped at the requested unit id
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device did not respond
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse a wire exception code
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Wire value of the code
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description per the Modbus specification
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::ServerDeviceFailure => "Server Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server Device Busy",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetFailed => "Gateway Target Device Failed to Respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.to_u8())
    }
}

/// Host-side simulator error types
///
/// Transport, framing and configuration failures. Port tasks log these and
/// carry on; none of them maps to a wire exception.
#[derive(Error, Debug, Clone)]
pub enum SimError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Serial read elapsed with no data
    ///
    /// Expected whenever the line is idle. The port runtime suppresses these
    /// from the error log.
    #[error("Serial read timeout")]
    SerialReadTimeout,

    /// Message frame structure violation
    ///
    /// Incomplete MBAP header, RTU frame shorter than address + function +
    /// CRC, ASCII frame without the `:` prefix or CR LF terminator.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus protocol violation that is not a framing issue
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// CRC-16 validation failure on an RTU frame
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// LRC validation failure on an ASCII frame
    #[error("LRC validation failed: expected={expected:02X}, actual={actual:02X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// Project/port/device/action settings problem
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Data format or validation error
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SimError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::LrcMismatch { expected, actual }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is an idle serial read
    ///
    /// The RTU and ASCII engines poll their port with a short timeout; an
    /// elapsed read on a quiet line is normal operation, not a fault.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, Self::SerialReadTimeout)
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::SerialReadTimeout
        )
    }

    /// Check if the error is a protocol/framing issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
                | Self::LrcMismatch { .. }
        )
    }
}

/// Convert from std::io::Error
///
/// Preserves the original error message for debugging.
impl From<std::io::Error> for SimError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The engines bound every read with a timeout; an elapsed read is reported
/// as an idle serial read and classified by the caller.
impl From<tokio::time::error::Elapsed> for SimError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::SerialReadTimeout
    }
}

/// Convert from serde JSON errors
///
/// Settings dictionaries are the only JSON this crate touches, so a JSON
/// failure is a configuration failure.
impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SimError::SerialReadTimeout;
        assert!(err.is_idle_timeout());
        assert!(err.is_transport_error());

        let err = SimError::crc_mismatch(0x1234, 0x5678);
        assert!(!err.is_idle_timeout());
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = SimError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_exception_code_roundtrip() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x08, 0x0A, 0x0B] {
            let exc = ExceptionCode::from_u8(code).unwrap();
            assert_eq!(exc.to_u8(), code);
        }
        assert!(ExceptionCode::from_u8(0x07).is_none());
        assert!(ExceptionCode::from_u8(0x99).is_none());
    }

    #[test]
    fn test_exception_code_display() {
        let msg = format!("{}", ExceptionCode::GatewayPathUnavailable);
        assert!(msg.contains("Gateway Path Unavailable"));
        assert!(msg.contains("0x0A"));
    }
}
