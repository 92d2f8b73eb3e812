//! Trait abstraction for outbound sinks to enable testing

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::error::SinkError;
use crate::normalize::NormalizedRecord;

/// One item queued for an outbound sink
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Unmodified payload text for the archival channel
    Raw { topic: String, payload: Bytes },
    /// Canonical record for the normalized channel
    Normalized(NormalizedRecord),
}

impl Outbound {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Raw { .. } => "raw",
            Outbound::Normalized(_) => "normalized",
        }
    }
}

/// Connection state of one outbound channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Trait for outbound sink operations
///
/// Implementations are driven by a single worker task, so methods take
/// `&mut self` and need no internal locking.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sink: Send {
    /// Name used in logs, metrics and errors
    fn name(&self) -> &'static str;

    /// Establish (or re-establish) the connection
    async fn connect(&mut self) -> Result<(), SinkError>;

    /// Write a single item
    async fn write(&mut self, item: &Outbound) -> Result<(), SinkError>;

    /// Release the connection
    async fn close(&mut self);
}
