//! # Error Types
//!
//! Custom error types for OSD Bridge using `thiserror`.
//!
//! Per-packet failures (`DecodeError`, `NormalizeError`) live next to the code
//! that produces them and never reach this level; what is here either stops
//! startup or is handled by a reconnect loop.

use thiserror::Error;

/// Exit status for configuration errors
pub const EXIT_CONFIG: u8 = 2;

/// Exit status for bind/connect failures during startup
pub const EXIT_TRANSPORT: u8 = 3;

/// Exit status for anything else that prevents startup
pub const EXIT_OTHER: u8 = 1;

/// Main error type for OSD Bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Inbound transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outbound sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Process exit status for a fatal startup error
    ///
    /// Configuration problems and transport problems exit with distinct codes
    /// so supervisors can tell a bad deployment from an unreachable network.
    pub fn exit_code(&self) -> u8 {
        match self {
            BridgeError::Config(_) => EXIT_CONFIG,
            BridgeError::Transport(_) | BridgeError::Sink(_) => EXIT_TRANSPORT,
            BridgeError::Io(_) => EXIT_OTHER,
        }
    }
}

/// Inbound transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The datagram socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The broker connection could not be established
    #[error("failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    /// A receive on an established transport failed
    #[error("receive failed: {0}")]
    Receive(String),

    /// The source was already closed
    #[error("source is closed")]
    Closed,
}

/// Outbound sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    /// Connecting to the sink failed
    #[error("sink '{sink}' connect failed: {message}")]
    Connect { sink: &'static str, message: String },

    /// The sink lost its connection
    #[error("sink '{sink}' is disconnected")]
    Disconnected { sink: &'static str },

    /// A single write was rejected
    #[error("sink '{sink}' write failed: {message}")]
    Write { sink: &'static str, message: String },

    /// The sink cannot carry this kind of message
    #[error("sink '{sink}' does not accept {kind} messages")]
    Unsupported {
        sink: &'static str,
        kind: &'static str,
    },
}

impl SinkError {
    /// Whether the failure means the sink has to reconnect
    ///
    /// A rejected write leaves the connection usable; a connect failure or a
    /// lost connection does not.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            SinkError::Connect { .. } | SinkError::Disconnected { .. }
        )
    }
}

/// Result type alias for OSD Bridge
pub type Result<T> = std::result::Result<T, BridgeError>;
