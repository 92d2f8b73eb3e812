//! MQTT sink: publishes raw payloads and canonical JSON records to a broker.
//!
//! rumqttc drives the connection from its `EventLoop`, which has to be polled
//! continuously. Each sink owns a driver task that polls it and mirrors the
//! broker connection into a `watch` channel. After a connection error the
//! driver parks until [`Sink::connect`] asks it to retry, so the reconnect
//! pace is set by the sink worker's backoff.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{ConnectionState, Outbound, Sink};
use crate::error::SinkError;
use crate::mqtt::{MqttEndpoint, REQUEST_CHANNEL_CAPACITY};

/// How long `close` lets the event loop flush a DISCONNECT
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// A live rumqttc client plus its event-loop driver
struct Link {
    client: AsyncClient,
    state: Arc<watch::Sender<ConnectionState>>,
    retry: Arc<Notify>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

impl Link {
    fn spawn(name: &'static str, endpoint: &MqttEndpoint) -> Self {
        let (client, eventloop) =
            AsyncClient::new(endpoint.options(true), REQUEST_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        let retry = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let driver = tokio::spawn(drive_event_loop(
            name,
            endpoint.addr(),
            eventloop,
            Arc::clone(&state),
            Arc::clone(&retry),
            cancel.clone(),
        ));

        Self {
            client,
            state,
            retry,
            cancel,
            driver,
        }
    }

    fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }
}

/// MQTT publisher for one outbound channel
pub struct MqttSink {
    name: &'static str,
    endpoint: MqttEndpoint,
    normalized_topic: String,
    connect_timeout: Duration,
    link: Option<Link>,
}

impl MqttSink {
    /// Create an unconnected sink
    ///
    /// # Arguments
    ///
    /// * `name` - Sink name used in logs and errors
    /// * `endpoint` - Broker to publish to
    /// * `normalized_topic` - Topic for [`Outbound::Normalized`] records
    /// * `connect_timeout` - How long `connect` waits for the broker's CONNACK
    pub fn new(
        name: &'static str,
        endpoint: MqttEndpoint,
        normalized_topic: String,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name,
            endpoint,
            normalized_topic,
            connect_timeout,
            link: None,
        }
    }

    fn connect_failed(&self, message: impl Into<String>) -> SinkError {
        SinkError::Connect {
            sink: self.name,
            message: message.into(),
        }
    }

    fn encode(&self, item: &Outbound) -> Result<(String, Bytes), SinkError> {
        match item {
            Outbound::Raw { topic, payload } => Ok((topic.clone(), payload.clone())),
            Outbound::Normalized(record) => {
                let json = serde_json::to_vec(record).map_err(|e| SinkError::Write {
                    sink: self.name,
                    message: e.to_string(),
                })?;
                Ok((self.normalized_topic.clone(), Bytes::from(json)))
            }
        }
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        let name = self.name;
        let link = self
            .link
            .get_or_insert_with(|| Link::spawn(name, &self.endpoint));

        let mut state = link.state.subscribe();
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {
                link.state.send_replace(ConnectionState::Connecting);
                link.retry.notify_one();
            }
            ConnectionState::Connecting => {}
        }

        let outcome = tokio::time::timeout(
            self.connect_timeout,
            state.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await
        .map(|changed| changed.map(|s| *s));

        match outcome {
            Ok(Ok(ConnectionState::Connected)) => {
                debug!(sink = name, broker = %self.endpoint.addr(), "MQTT sink connected");
                Ok(())
            }
            Ok(Ok(_)) => Err(self.connect_failed(format!(
                "broker {} refused or unreachable",
                self.endpoint.addr()
            ))),
            Ok(Err(_)) => Err(self.connect_failed("event loop stopped")),
            Err(_) => Err(self.connect_failed(format!(
                "no CONNACK from {} within {:?}",
                self.endpoint.addr(),
                self.connect_timeout
            ))),
        }
    }

    async fn write(&mut self, item: &Outbound) -> Result<(), SinkError> {
        let link = match self.link.as_ref() {
            Some(link) if link.is_connected() => link,
            _ => return Err(SinkError::Disconnected { sink: self.name }),
        };

        let (topic, payload) = self.encode(item)?;

        // QoS 0 and a non-blocking enqueue: a stalled event loop drops the
        // item here instead of stalling the worker
        match link
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
        {
            Ok(()) => Ok(()),
            Err(_) if !link.is_connected() => Err(SinkError::Disconnected { sink: self.name }),
            Err(e) => Err(SinkError::Write {
                sink: self.name,
                message: e.to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        let Link {
            client,
            cancel,
            mut driver,
            ..
        } = link;

        if client.try_disconnect().is_ok()
            && tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_ok()
        {
            debug!(sink = self.name, "MQTT sink closed");
            return;
        }

        cancel.cancel();
        let _ = driver.await;
        debug!(sink = self.name, "MQTT sink closed");
    }
}

/// Poll the rumqttc event loop and publish connection changes
async fn drive_event_loop(
    name: &'static str,
    addr: String,
    mut eventloop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    retry: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    state.send_replace(ConnectionState::Connected);
                    info!(sink = name, broker = %addr, "Connected to MQTT broker");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(sink = name, "DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                warn!(sink = name, broker = %addr, error = %e, "MQTT connection lost");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = retry.notified() => {}
                }
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
}
