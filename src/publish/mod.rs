//! # Publish Module
//!
//! Fan-out of every decoded packet to two independent outbound channels:
//!
//! - **raw**: the unmodified payload text on `<raw_root>/<serial>/osd`
//! - **normalized**: the canonical record, as JSON on
//!   `<normalized_root>/normalized` or as an InfluxDB point
//!
//! Each channel is a [`SinkHandle`] with its own queue, worker and reconnect
//! loop, so a slow or failed channel never affects the other one or the
//! receive loop.

pub mod handle;
pub mod influx;
pub mod line_protocol;
pub mod mqtt;
pub mod sink;
pub mod topics;

use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backoff::Backoff;
use crate::config::{Config, NormalizedSinkKind};
use crate::error::SinkError;
use crate::mqtt::MqttEndpoint;
use crate::normalize::NormalizedRecord;

pub use handle::{SinkHandle, SinkStatsSnapshot};
pub use influx::InfluxSink;
pub use mqtt::MqttSink;
pub use sink::{ConnectionState, Outbound, Sink};

/// How long shutdown waits for each sink to flush its queue
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw and normalized outbound channels
pub struct DualSinkPublisher {
    raw: SinkHandle,
    normalized: SinkHandle,
    raw_root: String,
}

/// Counters for both channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub raw: SinkStatsSnapshot,
    pub normalized: SinkStatsSnapshot,
}

impl DualSinkPublisher {
    /// Build both sinks from configuration and connect them
    ///
    /// The raw channel always goes to the MQTT broker. The normalized channel
    /// goes to the same broker over its own connection, or to InfluxDB.
    ///
    /// # Errors
    ///
    /// Returns the first sink's connect error; a sink that was already
    /// connected is shut down again
    pub async fn from_config(
        config: &Config,
        cancel: CancellationToken,
    ) -> Result<Self, SinkError> {
        let publisher = &config.publisher;
        let endpoint = MqttEndpoint::from(&config.broker);
        let normalized_topic = topics::normalized_topic(&config.topics.normalized_root);

        let raw_sink = MqttSink::new(
            "raw",
            MqttEndpoint {
                client_id: format!("{}-raw", endpoint.client_id),
                ..endpoint.clone()
            },
            normalized_topic.clone(),
            publisher.connect_timeout(),
        );

        let normalized_sink: Box<dyn Sink> = match config.normalized.sink {
            NormalizedSinkKind::Mqtt => Box::new(MqttSink::new(
                "normalized",
                MqttEndpoint {
                    client_id: format!("{}-normalized", endpoint.client_id),
                    ..endpoint
                },
                normalized_topic,
                publisher.connect_timeout(),
            )),
            NormalizedSinkKind::Influx => {
                // Presence is checked by config validation
                let influx = config.influx.as_ref().ok_or(SinkError::Connect {
                    sink: "influx",
                    message: "no [influx] configuration".to_string(),
                })?;
                Box::new(InfluxSink::new(influx, publisher.connect_timeout())?)
            }
        };

        Self::connect(
            Box::new(raw_sink),
            normalized_sink,
            config.topics.raw_root.clone(),
            publisher.queue_capacity,
            publisher.backoff(),
            cancel,
        )
        .await
    }

    /// Connect the raw sink, then the normalized sink
    ///
    /// # Errors
    ///
    /// Returns the first connect error
    pub async fn connect(
        raw: Box<dyn Sink>,
        normalized: Box<dyn Sink>,
        raw_root: String,
        queue_capacity: usize,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Result<Self, SinkError> {
        let raw = SinkHandle::connect(raw, queue_capacity, backoff, cancel.clone()).await?;

        let normalized =
            match SinkHandle::connect(normalized, queue_capacity, backoff, cancel).await {
                Ok(handle) => handle,
                Err(e) => {
                    raw.shutdown(DRAIN_TIMEOUT).await;
                    return Err(e);
                }
            };

        info!(
            raw = raw.name(),
            normalized = normalized.name(),
            "Publisher ready"
        );

        Ok(Self {
            raw,
            normalized,
            raw_root,
        })
    }

    /// Queue one packet's outputs without waiting
    ///
    /// The raw text always goes out; `record` is absent when normalization
    /// failed.
    pub fn publish(&self, raw_text: &str, serial: Option<&str>, record: Option<&NormalizedRecord>) {
        let topic = topics::raw_topic(&self.raw_root, serial.unwrap_or(topics::UNKNOWN_SERIAL));

        self.raw.try_send(Outbound::Raw {
            topic,
            payload: Bytes::copy_from_slice(raw_text.as_bytes()),
        });

        if let Some(record) = record {
            self.normalized.try_send(Outbound::Normalized(record.clone()));
        }
    }

    /// Current connection state of (raw, normalized)
    pub fn states(&self) -> (ConnectionState, ConnectionState) {
        (self.raw.state(), self.normalized.state())
    }

    /// Current counters
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            raw: self.raw.stats(),
            normalized: self.normalized.stats(),
        }
    }

    /// Drain and close both sinks, returning their final counters
    pub async fn shutdown(self) -> PublisherStats {
        let DualSinkPublisher { raw, normalized, .. } = self;

        let (raw, normalized) =
            tokio::join!(raw.shutdown(DRAIN_TIMEOUT), normalized.shutdown(DRAIN_TIMEOUT));

        PublisherStats { raw, normalized }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnss::FixStatus;
    use crate::normalize::DeviceType;
    use crate::publish::sink::mocks::RecordingSink;
    use tokio::time::{sleep, timeout};

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20))
    }

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            timestamp_ms: 1734430000000,
            device_type: DeviceType::Drone,
            serial: "SN1".to_string(),
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            heading: 0.0,
            battery_pct: 90.0,
            sat_count: 0,
            fix_status: FixStatus::None,
            fix_code: 0,
        }
    }

    async fn publisher(raw: &RecordingSink, normalized: &RecordingSink) -> DualSinkPublisher {
        DualSinkPublisher::connect(
            Box::new(raw.clone()),
            Box::new(normalized.clone()),
            "thing/product".to_string(),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_publish_both_channels() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let publisher = publisher(&raw, &normalized).await;

        publisher.publish("{\"gateway\":\"SN1\"}", Some("SN1"), Some(&record()));
        wait_until(|| raw.get_written().len() == 1 && normalized.get_written().len() == 1).await;

        assert_eq!(
            raw.get_written()[0],
            Outbound::Raw {
                topic: "thing/product/SN1/osd".to_string(),
                payload: Bytes::from_static(b"{\"gateway\":\"SN1\"}"),
            }
        );
        assert_eq!(normalized.get_written()[0], Outbound::Normalized(record()));

        publisher.shutdown().await;
        assert!(raw.is_closed());
        assert!(normalized.is_closed());
    }

    #[tokio::test]
    async fn test_publish_raw_only_without_record() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let publisher = publisher(&raw, &normalized).await;

        publisher.publish("{\"gateway\":7}", None, None);
        wait_until(|| raw.get_written().len() == 1).await;

        match &raw.get_written()[0] {
            Outbound::Raw { topic, .. } => assert_eq!(topic, "thing/product/unknown/osd"),
            other => panic!("unexpected item {:?}", other),
        }

        let stats = publisher.stats();
        assert_eq!(stats.raw.written, 1);
        assert_eq!(stats.normalized.written, 0);

        publisher.shutdown().await;
        assert!(normalized.get_written().is_empty());
    }

    #[tokio::test]
    async fn test_publish_sanitizes_serial() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let publisher = publisher(&raw, &normalized).await;

        publisher.publish("{}", Some("dock/+/#"), None);
        wait_until(|| raw.get_written().len() == 1).await;

        match &raw.get_written()[0] {
            Outbound::Raw { topic, .. } => assert_eq!(topic, "thing/product/dock___/osd"),
            other => panic!("unexpected item {:?}", other),
        }

        let stats = publisher.shutdown().await;
        assert_eq!(stats.raw.written, 1);
        assert_eq!(stats.raw.dropped, 0);
    }

    #[tokio::test]
    async fn test_normalized_connect_failure_closes_raw() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        normalized.fail_next_connect(SinkError::Connect {
            sink: "normalized",
            message: "refused".to_string(),
        });

        let result = DualSinkPublisher::connect(
            Box::new(raw.clone()),
            Box::new(normalized.clone()),
            "thing/product".to_string(),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(raw.is_closed());
        assert!(normalized.is_closed());
    }

    #[tokio::test]
    async fn test_failing_normalized_sink_does_not_affect_raw() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let publisher = publisher(&raw, &normalized).await;

        for _ in 0..3 {
            normalized.fail_next_write(SinkError::Write {
                sink: "normalized",
                message: "rejected".to_string(),
            });
        }

        for _ in 0..3 {
            publisher.publish("{}", Some("SN1"), Some(&record()));
        }
        wait_until(|| raw.get_written().len() == 3 && publisher.stats().normalized.failed == 3)
            .await;

        assert_eq!(publisher.states(), (ConnectionState::Connected, ConnectionState::Connected));
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_stuck_sink_shutdown_keeps_bridge_running() {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let cancel = CancellationToken::new();
        let publisher = DualSinkPublisher::connect(
            Box::new(raw.clone()),
            Box::new(normalized.clone()),
            "thing/product".to_string(),
            16,
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            cancel.clone(),
        )
        .await
        .unwrap();

        normalized.fail_next_write(SinkError::Disconnected { sink: "normalized" });
        publisher.publish("{}", Some("SN1"), Some(&record()));
        wait_until(|| publisher.states().1 == ConnectionState::Disconnected).await;

        // The normalized worker is parked in its backoff and only stops at
        // the drain timeout
        let stats = publisher.shutdown().await;

        assert_eq!(stats.raw.written, 1);
        assert!(normalized.is_closed());
        assert!(!cancel.is_cancelled());
    }
}
