//! # Error Types
//!
//! Error handling for the console multiplexer.
//!
//! This module defines every failure the server and client can observe, from
//! malformed frames on the wire to a supervised process exiting.
//!
//! ## Error Categories
//! - **Codec Errors**: unknown packet kinds, truncated payloads, oversized frames
//! - **Protocol Errors**: handshake violations, incompatible protocol versions
//! - **Domain Errors**: program/console lookups and session attachment rules;
//!   these are reported to the client as an [`ErrorCode`] and never close the
//!   connection
//! - **Transport Errors**: read/write failures on the connection
//! - **Process Errors**: the supervised child failed or exited
//!
//! ## Example Usage
//! ```rust
//! use procmux::error::{Error, ErrorCode};
//!
//! let err = Error::ProgramNotFound("lobby".into());
//! assert_eq!(err.code(), ErrorCode::ProgramNotFound);
//! assert!(!err.is_connection_fatal());
//! ```

use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Static message strings used on hot error paths.
pub mod constants {
    pub const ERR_UNEXPECTED_FRAME: &str = "Unexpected frame type";

    pub const ERR_INTERNAL: &str = "Internal error";
    pub const ERR_PROGRAM_NOT_FOUND: &str = "A program is not found";
    pub const ERR_PROGRAM_RUNNING: &str = "A program is already running";
    pub const ERR_CONSOLE_NOT_FOUND: &str = "A console is not found";
    pub const ERR_CONSOLE_CLOSED: &str = "A console is already closed";
    pub const ERR_NOT_JOINED: &str = "The session has not joined a console";

    pub const ERR_BAD_TOKEN: &str = "Invalid access token";
}

/// Failures produced while encoding or decoding packets and frames.
///
/// Decoding never panics on malformed input; every failure surfaces as one
/// of these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("Truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Invalid error code: {0}")]
    InvalidErrorCode(u32),

    #[error("String too long for wire encoding: {0} bytes")]
    StringTooLong(usize),

    #[error("List too long for wire encoding: {0} entries")]
    ListTooLong(usize),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unknown frame opcode: {0:#04x}")]
    UnknownOpcode(u8),
}

/// Client-visible error codes carried by the `ErrorMessage` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    InternalError = 1,
    ProgramNotFound = 2,
    ProgramAlreadyRunning = 3,
    ConsoleNotFound = 4,
    ConsoleAlreadyClosed = 5,
    SessionNotJoinedConsole = 6,
}

impl ErrorCode {
    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::InternalError => constants::ERR_INTERNAL,
            ErrorCode::ProgramNotFound => constants::ERR_PROGRAM_NOT_FOUND,
            ErrorCode::ProgramAlreadyRunning => constants::ERR_PROGRAM_RUNNING,
            ErrorCode::ConsoleNotFound => constants::ERR_CONSOLE_NOT_FOUND,
            ErrorCode::ConsoleAlreadyClosed => constants::ERR_CONSOLE_CLOSED,
            ErrorCode::SessionNotJoinedConsole => constants::ERR_NOT_JOINED,
        }
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = CodecError;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::InternalError),
            2 => Ok(ErrorCode::ProgramNotFound),
            3 => Ok(ErrorCode::ProgramAlreadyRunning),
            4 => Ok(ErrorCode::ConsoleNotFound),
            5 => Ok(ErrorCode::ConsoleAlreadyClosed),
            6 => Ok(ErrorCode::SessionNotJoinedConsole),
            other => Err(CodecError::InvalidErrorCode(other)),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

// Error is the primary error type for the whole crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Incompatible protocol: peer speaks {peer}, required {required}")]
    IncompatibleProtocol { required: u8, peer: u8 },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session already closed")]
    SessionClosed,

    #[error("Broadcast failed for {failed} of {total} sessions")]
    BroadcastFailed { failed: usize, total: usize },

    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    #[error("Program already running: {0}")]
    ProgramAlreadyRunning(String),

    #[error("Console not found: {0}")]
    ConsoleNotFound(Uuid),

    #[error("Console already closed: {0}")]
    ConsoleAlreadyClosed(Uuid),

    #[error("Session has not joined a console")]
    SessionNotJoinedConsole,

    #[error("Invalid program name: {0:?} (only letters and digits are allowed)")]
    InvalidProgramName(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The code reported to a client for this error.
    ///
    /// Anything that is not a domain error is reported as `InternalError`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ProgramNotFound(_) => ErrorCode::ProgramNotFound,
            Error::ProgramAlreadyRunning(_) => ErrorCode::ProgramAlreadyRunning,
            Error::ConsoleNotFound(_) => ErrorCode::ConsoleNotFound,
            Error::ConsoleAlreadyClosed(_) => ErrorCode::ConsoleAlreadyClosed,
            Error::SessionNotJoinedConsole => ErrorCode::SessionNotJoinedConsole,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether this error terminates the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Codec(_)
                | Error::ProtocolViolation(_)
                | Error::IncompatibleProtocol { .. }
                | Error::SessionClosed
        )
    }
}

/// Type alias for Results using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_wire_codes() {
        assert_eq!(
            Error::ConsoleNotFound(Uuid::nil()).code(),
            ErrorCode::ConsoleNotFound
        );
        assert_eq!(
            Error::SessionNotJoinedConsole.code(),
            ErrorCode::SessionNotJoinedConsole
        );
        assert_eq!(
            Error::Process("boom".into()).code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn error_code_wire_values_are_stable() {
        for value in 1..=6u32 {
            let code = ErrorCode::try_from(value).expect("known code");
            assert_eq!(code.as_u32(), value);
        }
        assert_eq!(
            ErrorCode::try_from(0),
            Err(CodecError::InvalidErrorCode(0))
        );
    }

    #[test]
    fn only_protocol_and_transport_errors_are_fatal() {
        assert!(Error::Codec(CodecError::UnknownKind(99)).is_connection_fatal());
        assert!(Error::SessionClosed.is_connection_fatal());
        let mismatch = Error::IncompatibleProtocol {
            required: 1,
            peer: 99,
        };
        assert!(mismatch.is_connection_fatal());
        assert_eq!(
            mismatch.to_string(),
            "Incompatible protocol: peer speaks 99, required 1"
        );
        assert!(!Error::ProgramNotFound("x".into()).is_connection_fatal());
        assert!(!Error::SessionNotJoinedConsole.is_connection_fatal());
    }
}
