//! UDP datagram listener.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{PacketSource, RawPacket, Received, Transport, MAX_PACKET_SIZE};
use crate::error::TransportError;

/// Datagram source bound to one local address
#[derive(Debug)]
pub struct UdpSource {
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl UdpSource {
    /// Bind the listening socket
    ///
    /// # Arguments
    ///
    /// * `addr` - Local `host:port`, e.g. `0.0.0.0:12000`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Bind` if the address is invalid or in use
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        info!(addr = %addr, "Listening for UDP telemetry");

        Ok(Self {
            socket: Some(socket),
            buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Bound address, until closed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait]
impl PacketSource for UdpSource {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    async fn receive(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Received, TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::Closed)?;

        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Received::Shutdown),
            result = tokio::time::timeout(timeout, socket.recv_from(&mut self.buf)) => result,
        };

        match received {
            Err(_) => Ok(Received::Timeout),
            Ok(Ok((len, peer))) => Ok(Received::Packet(RawPacket::new(
                Bytes::copy_from_slice(&self.buf[..len]),
                Transport::Udp,
                peer.to_string(),
            ))),
            Ok(Err(e)) => Err(TransportError::Receive(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(addr = ?socket.local_addr().ok(), "UDP socket closed");
        }
    }
}
