//! MQTT subscription source.
//!
//! The session is durable (`clean_session = false`) so the broker queues
//! QoS 1/2 messages while the bridge is reconnecting. The filter is
//! re-subscribed on every CONNACK in case the broker dropped the session.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PacketSource, RawPacket, Received, Transport, MAX_PACKET_SIZE};
use crate::config::MqttIngestConfig;
use crate::error::TransportError;
use crate::mqtt::{self, MqttEndpoint, REQUEST_CHANNEL_CAPACITY};

/// How long `close` lets the event loop flush a DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Broker subscription delivering one packet per PUBLISH
pub struct MqttSource {
    client: AsyncClient,
    eventloop: Option<EventLoop>,
    filter: String,
    qos: QoS,
    addr: String,
}

impl MqttSource {
    /// Connect, wait for the broker's CONNACK and subscribe
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Connect` if the broker refuses the session,
    /// is unreachable, or does not answer within `connect_timeout`
    pub async fn connect(
        config: &MqttIngestConfig,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let endpoint = MqttEndpoint::from(config);
        let addr = endpoint.addr();
        let (client, mut eventloop) =
            AsyncClient::new(endpoint.options(false), REQUEST_CHANNEL_CAPACITY);

        let connect_failed = |message: String| TransportError::Connect {
            addr: addr.clone(),
            message,
        };

        let acked = tokio::time::timeout(connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        })
        .await;

        let ack = match acked {
            Ok(Ok(ack)) => ack,
            Ok(Err(message)) => return Err(connect_failed(message)),
            Err(_) => {
                return Err(connect_failed(format!(
                    "no CONNACK within {:?}",
                    connect_timeout
                )))
            }
        };

        let qos = mqtt::qos(config.qos);
        client
            .try_subscribe(config.topic.clone(), qos)
            .map_err(|e| connect_failed(e.to_string()))?;

        info!(
            broker = %addr,
            topic = %config.topic,
            session_present = ack.session_present,
            "Subscribed to MQTT telemetry"
        );

        Ok(Self {
            client,
            eventloop: Some(eventloop),
            filter: config.topic.clone(),
            qos,
            addr,
        })
    }

    fn resubscribe(&self) {
        match self.client.try_subscribe(self.filter.clone(), self.qos) {
            Ok(()) => debug!(topic = %self.filter, "Re-subscribing after reconnect"),
            Err(e) => warn!(topic = %self.filter, error = %e, "Re-subscribe failed"),
        }
    }
}

#[async_trait]
impl PacketSource for MqttSource {
    fn transport(&self) -> Transport {
        Transport::Mqtt
    }

    async fn receive(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Received, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            let eventloop = self.eventloop.as_mut().ok_or(TransportError::Closed)?;

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Received::Shutdown),
                _ = tokio::time::sleep_until(deadline) => return Ok(Received::Timeout),
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.payload.len() > MAX_PACKET_SIZE {
                        warn!(
                            topic = %publish.topic,
                            size = publish.payload.len(),
                            "Oversized message ignored"
                        );
                        continue;
                    }
                    return Ok(Received::Packet(RawPacket::new(
                        publish.payload,
                        Transport::Mqtt,
                        publish.topic,
                    )));
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(
                        broker = %self.addr,
                        session_present = ack.session_present,
                        "Reconnected to MQTT broker"
                    );
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    if rejected {
                        warn!(topic = %self.filter, "Broker rejected the subscription");
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(TransportError::Receive(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let Some(mut eventloop) = self.eventloop.take() else {
            return;
        };

        if self.client.try_disconnect().is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
        }

        debug!(broker = %self.addr, "MQTT source closed");
    }
}
