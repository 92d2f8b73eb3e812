//! # Ingest Module
//!
//! Inbound packet sources. Both transports sit behind [`PacketSource`] so the
//! receive loop does not care where bytes come from.
//!
//! - [`UdpSource`]: datagram listener, one JSON document per datagram
//! - [`MqttSource`]: durable wildcard subscription, one JSON document per message

pub mod mqtt;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{IngestConfig, IngestTransport};
use crate::error::TransportError;

pub use mqtt::MqttSource;
pub use udp::UdpSource;

/// Largest datagram or message payload accepted
pub const MAX_PACKET_SIZE: usize = 65535;

/// Which transport delivered a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Mqtt,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Mqtt => write!(f, "mqtt"),
        }
    }
}

/// One inbound payload as received
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub payload: Bytes,
    pub transport: Transport,
    /// Peer address (UDP) or topic (MQTT)
    pub origin: String,
    pub received_at: DateTime<Utc>,
}

impl RawPacket {
    pub fn new(payload: Bytes, transport: Transport, origin: String) -> Self {
        Self {
            payload,
            transport,
            origin,
            received_at: Utc::now(),
        }
    }

    /// Arrival time in Unix milliseconds
    pub fn arrival_ms(&self) -> i64 {
        self.received_at.timestamp_millis()
    }
}

/// Outcome of one bounded receive
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Packet(RawPacket),
    /// Nothing arrived within the timeout
    Timeout,
    /// The cancellation token fired
    Shutdown,
}

/// Trait for inbound transports
#[async_trait]
pub trait PacketSource: Send {
    /// Transport name for logs
    fn transport(&self) -> Transport;

    /// Wait up to `timeout` for the next packet
    ///
    /// Returns [`Received::Shutdown`] promptly once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport failed; the caller decides
    /// whether to retry
    async fn receive(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Received, TransportError>;

    /// Release the socket or broker session
    async fn close(&mut self);
}

/// Open the configured inbound transport
///
/// # Errors
///
/// Returns `TransportError` if the socket cannot be bound or the broker
/// cannot be reached within `connect_timeout`
pub async fn open(
    config: &IngestConfig,
    connect_timeout: Duration,
) -> Result<Box<dyn PacketSource>, TransportError> {
    match config.transport {
        IngestTransport::Udp => {
            let source = UdpSource::bind(&config.udp.socket_addr()).await?;
            Ok(Box::new(source))
        }
        IngestTransport::Mqtt => {
            let source = MqttSource::connect(&config.mqtt, connect_timeout).await?;
            Ok(Box::new(source))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_arrival_ms() {
        let mut packet = RawPacket::new(Bytes::new(), Transport::Mqtt, "thing/product/SN/osd".to_string());
        packet.received_at = Utc.timestamp_millis_opt(1734430000123).unwrap();
        assert_eq!(packet.arrival_ms(), 1734430000123);
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Udp.to_string(), "udp");
        assert_eq!(Transport::Mqtt.to_string(), "mqtt");
    }

    fn udp_config(port: u16) -> IngestConfig {
        IngestConfig {
            transport: IngestTransport::Udp,
            recv_timeout_ms: 1000,
            udp: crate::config::UdpConfig {
                bind_addr: "127.0.0.1".to_string(),
                port,
            },
            mqtt: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_open_udp() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        drop(taken);

        let mut source = open(&udp_config(port), Duration::from_secs(1)).await.unwrap();
        assert_eq!(source.transport(), Transport::Udp);
        source.close().await;
    }

    #[tokio::test]
    async fn test_open_udp_port_in_use() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = open(&udp_config(port), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Bind { .. })));
    }
}
