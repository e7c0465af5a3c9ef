//! Peer networking error types.

use std::time::Duration;

/// Errors that can occur in the hive_peer crate.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Every dial attempt against an address failed.
    #[error("Stopping dial retry after {attempts} attempts for multiaddr {addr}")]
    DialExhausted { addr: String, attempts: u32 },

    /// A failure reported by the underlying transport (dial, close, ping, publish).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A protocol stream could not be opened on a connection.
    #[error("Could not open {protocol} stream with {peer}: {reason}")]
    ProtocolStreamOpen {
        peer: String,
        protocol: String,
        reason: String,
    },

    /// An inbound frame could not be decoded.
    #[error("Stream codec error: {0}")]
    StreamCodec(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A multiaddr could not be parsed or lacks a required component.
    #[error("Invalid multiaddr: {0}")]
    InvalidAddress(String),

    /// A multiaddr string could not be parsed.
    #[error("Could not parse multiaddr: {0}")]
    AddressParse(#[from] multiaddr::Error),

    /// The peer identity file or its key material is malformed.
    #[error("Invalid peer identity: {0}")]
    InvalidIdentity(String),

    /// The configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The debug-info topic was used without enabling it.
    #[error("Debug info not enabled")]
    DebugInfoNotEnabled,

    /// The peer has not been initialized yet.
    #[error("Peer not initialized")]
    NotInitialized,

    /// `init` was called twice.
    #[error("Peer already initialized")]
    AlreadyInitialized,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
