//! # Error Types
//!
//! Error handling for the command protocol.
//!
//! This module defines every failure a client, server or codec can report,
//! from low-level I/O errors up to authentication rejections.
//!
//! ## Error Categories
//! - **Configuration Errors**: bad pool sizes, double binds, unregistered packet kinds
//! - **Registry Errors**: locked registry, occupied ids, attempts to shadow built-ins
//! - **Protocol Errors**: unknown packet ids, malformed payloads, handshake violations
//! - **Authentication Errors**: the server refused the offered token
//! - **Transport Errors**: socket I/O failures, closed connections, TLS issues
//!
//! A protocol error is fatal to the single connection that produced it; other
//! connections served by the same server keep running.
//!
//! ## Example Usage
//! ```rust
//! use command_protocol::error::{ProtocolError, Result};
//!
//! fn check_pool_size(size: usize) -> Result<usize> {
//!     if size == 0 {
//!         return Err(ProtocolError::ConfigError("poolSize can't be less than 1".into()));
//!     }
//!     Ok(size)
//! }
//!
//! assert!(check_pool_size(0).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry lock errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on packet registry";
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Protocol validation errors
    pub const ERR_INVALID_FRAME_LENGTH: &str = "Invalid frame length";
    pub const ERR_TRUNCATED_PAYLOAD: &str = "Truncated packet payload";
    pub const ERR_TRAILING_BYTES: &str = "Unexpected trailing bytes in packet payload";
    pub const ERR_INVALID_UTF8: &str = "Packet string is not valid UTF-8";
    pub const ERR_STRING_TOO_LONG: &str = "String exceeds 65535 encoded bytes";

    /// Handshake errors
    pub const ERR_INVALID_AUTH_PACKET: &str = "Invalid auth packet received";
    pub const ERR_INVALID_TOKEN: &str = "Received invalid token";
    pub const ERR_INVALID_KEEPALIVE: &str = "Received invalid keep-alive packet";
    pub const ERR_TIMED_OUT: &str = "Timed out";
    pub const ERR_INVALID_AUTH_RESPONSE: &str = "Invalid response to auth packet";

    /// Lifecycle errors
    pub const ERR_ALREADY_CONNECTED: &str = "Already connected";
    pub const ERR_NOT_CONNECTED: &str = "Not connected";
    pub const ERR_CLIENT_CLOSED: &str = "Client is closed";
    pub const ERR_ALREADY_BOUND: &str = "Already bound";
    pub const ERR_POOL_SIZE: &str = "poolSize can't be less than 1";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Server rejected the connection: {0}")]
    AuthRejected(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Packet registering is locked")]
    RegistrationLocked,

    #[error("Packet unregistering is locked")]
    UnregistrationLocked,

    #[error("Packet id {0} is already registered")]
    PacketIdInUse(u8),

    #[error("Can't register or unregister built-in packet {0}")]
    BuiltinPacket(String),

    #[error("No free packet id left in the registry")]
    RegistryFull,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Shorthand for building a [`ProtocolError::ProtocolViolation`]
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        ProtocolError::ProtocolViolation(reason.into())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
