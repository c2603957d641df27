//! # Error Types
//!
//! Comprehensive error handling for the bridge transport.
//!
//! This module defines all error variants that can occur while driving a
//! connection, from low-level I/O errors to protocol violations.
//!
//! ## Error Categories
//! - **I/O Errors**: transport read/write failures
//! - **Framing Errors**: bad magic, bad checksum, impossible declared lengths
//! - **Handshake Errors**: authentication exhaustion, banner problems
//! - **Stream Errors**: refused or torn-down logical streams
//!
//! Errors local to one stream (`ConnectionRefused`, cancellation) are
//! reported only to that stream's caller. Errors intrinsic to the shared
//! connection (`Framing`, `ConnectionClosed`, `ProtocolViolation`) terminate
//! the dispatcher and fan out to every outstanding operation.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Framing errors
    pub const ERR_BAD_MAGIC: &str = "Header magic does not match command complement";
    pub const ERR_BAD_CHECKSUM: &str = "Payload checksum mismatch under legacy protocol";
    pub const ERR_OVERSIZED_PAYLOAD: &str = "Declared payload length exceeds negotiated maximum";

    /// Handshake errors
    pub const ERR_AUTH_EXHAUSTED: &str = "No stored credential accepted and key bootstrap failed";
    pub const ERR_EMPTY_BANNER: &str = "Remote connect banner is empty";

    /// Stream errors
    pub const ERR_DISPATCHER_GONE: &str = "Dispatcher task is no longer running";
    pub const ERR_STREAM_CLOSED: &str = "Stream is closed";

    /// Key store errors
    pub const ERR_KEY_DIR: &str = "Failed to access key store directory";
    pub const ERR_KEY_DECODE: &str = "Failed to decode stored private key";
}

/// Primary error type for all bridge transport operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Framing error: {0}")]
    Framing(&'static str),

    #[error("Protocol violation: unexpected {command} in state {state}")]
    ProtocolViolation {
        command: &'static str,
        state: &'static str,
    },

    #[error("Unsupported protocol version {0:#010x}")]
    UnsupportedVersion(u32),

    #[error("Authentication exhausted: {0}")]
    AuthExhausted(&'static str),

    #[error("Connection refused for service {0:?}")]
    ConnectionRefused(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Key store error: {0}")]
    KeyStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream error: {0}")]
    Stream(&'static str),
}

impl BridgeError {
    /// Whether this error is fatal to the shared connection, as opposed to
    /// local to a single stream.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::Framing(_)
                | BridgeError::ProtocolViolation { .. }
                | BridgeError::UnsupportedVersion(_)
                | BridgeError::ConnectionClosed
        )
    }
}

/// Terminal reason for a connection, cheap to copy across the dispatcher's
/// fan-out channels. `BridgeError` itself is not `Clone` (it carries
/// `io::Error`), so failed streams receive this reduced form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Transport EOF or I/O failure.
    ConnectionClosed,
    /// Bad magic, bad checksum, or an impossible declared length; carries
    /// the specific framing message.
    Framing(&'static str),
    /// A command the protocol does not allow in the current state.
    ProtocolViolation,
}

impl From<DisconnectReason> for BridgeError {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::ConnectionClosed => BridgeError::ConnectionClosed,
            DisconnectReason::Framing(msg) => BridgeError::Framing(msg),
            DisconnectReason::ProtocolViolation => BridgeError::ProtocolViolation {
                command: "unknown",
                state: "connected",
            },
        }
    }
}

/// Type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
