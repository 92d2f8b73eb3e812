//! # Bridge Module
//!
//! Lifecycle of one bridge instance:
//!
//! 1. **Starting** - connect both outbound sinks, then open the inbound source.
//!    Any failure here is fatal.
//! 2. **Running** - bounded receive, then decode, normalize and publish. Bad
//!    packets and sink trouble are counted and logged; transport errors are
//!    retried with backoff.
//! 3. **Stopping** - the cancellation token fired; the source is closed and
//!    the publisher drains its queues.
//! 4. **Stopped** - final counters are returned.

use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::decode::decode;
use crate::error::BridgeError;
use crate::gnss::FixScheme;
use crate::ingest::{self, PacketSource, RawPacket, Received};
use crate::normalize::{normalize, NormalizeError};
use crate::publish::{DualSinkPublisher, PublisherStats};

/// Number of packets between status log messages
pub const LOG_INTERVAL_PACKETS: u64 = 1000;

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Starting => write!(f, "STARTING"),
            BridgeState::Running => write!(f, "RUNNING"),
            BridgeState::Stopping => write!(f, "STOPPING"),
            BridgeState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Receive-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub received: u64,
    pub decode_failures: u64,
    pub unrecognized: u64,
    pub invalid_fields: u64,
    pub normalized: u64,
    pub transport_errors: u64,
}

/// Final counters of a stopped bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub packets: BridgeStats,
    pub publisher: PublisherStats,
}

/// What happened to one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Raw and normalized outputs were queued
    Published,
    /// Only the raw output was queued
    RawOnly,
    /// The packet could not be decoded and was dropped
    Dropped,
}

/// Per-instance settings for the receive loop
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub scheme: FixScheme,
    pub recv_timeout: Duration,
    pub backoff: Backoff,
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            scheme: config.gnss.scheme,
            recv_timeout: config.ingest.recv_timeout(),
            backoff: config.publisher.backoff(),
        }
    }
}

/// One running bridge instance
pub struct Bridge {
    source: Box<dyn PacketSource>,
    publisher: DualSinkPublisher,
    settings: BridgeSettings,
    cancel: CancellationToken,
    stats: BridgeStats,
    state: watch::Sender<BridgeState>,
}

impl Bridge {
    /// Connect the sinks, then open the inbound source
    ///
    /// Sinks come first so no packet is received before there is somewhere
    /// to send it.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Sink` or `BridgeError::Transport` if a sink or the
    /// source cannot be reached; both map to the transport exit code
    pub async fn start(config: &Config, cancel: CancellationToken) -> Result<Self, BridgeError> {
        info!(
            transport = ?config.ingest.transport,
            normalized_sink = ?config.normalized.sink,
            scheme = %config.gnss.scheme,
            "Starting bridge"
        );

        let publisher = DualSinkPublisher::from_config(config, cancel.clone()).await?;

        let source = match ingest::open(&config.ingest, config.publisher.connect_timeout()).await {
            Ok(source) => source,
            Err(e) => {
                publisher.shutdown().await;
                return Err(e.into());
            }
        };

        Ok(Self::new(source, publisher, BridgeSettings::from(config), cancel))
    }

    /// Assemble a bridge from already-connected parts
    pub fn new(
        source: Box<dyn PacketSource>,
        publisher: DualSinkPublisher,
        settings: BridgeSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(BridgeState::Starting);

        Self {
            source,
            publisher,
            settings,
            cancel,
            stats: BridgeStats::default(),
            state,
        }
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Current receive-side counters
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Run until the cancellation token fires, then shut down
    ///
    /// Returns within one receive timeout of cancellation plus the
    /// publisher's drain time.
    pub async fn run(mut self) -> BridgeReport {
        self.state.send_replace(BridgeState::Running);
        info!(
            transport = %self.source.transport(),
            recv_timeout_ms = self.settings.recv_timeout.as_millis() as u64,
            "Bridge running"
        );

        self.receive_loop().await;

        self.state.send_replace(BridgeState::Stopping);
        info!("Shutting down...");

        let Bridge {
            mut source,
            publisher,
            stats,
            state,
            ..
        } = self;

        source.close().await;
        let publisher = publisher.shutdown().await;

        let report = BridgeReport {
            packets: stats,
            publisher,
        };
        log_status(&report, "Bridge stopped");

        state.send_replace(BridgeState::Stopped);
        report
    }

    async fn receive_loop(&mut self) {
        let mut failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            let received = self
                .source
                .receive(self.settings.recv_timeout, &self.cancel)
                .await;

            match received {
                Ok(Received::Packet(packet)) => {
                    failures = 0;
                    self.handle_packet(&packet);

                    if self.stats.received % LOG_INTERVAL_PACKETS == 0 {
                        let report = BridgeReport {
                            packets: self.stats,
                            publisher: self.publisher.stats(),
                        };
                        log_status(&report, "Status");
                    }
                }
                Ok(Received::Timeout) => {
                    failures = 0;
                }
                Ok(Received::Shutdown) => break,
                Err(e) => {
                    self.stats.transport_errors += 1;
                    let delay = self.settings.backoff.delay(failures);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Receive failed"
                    );

                    if !self.settings.backoff.wait(failures, &self.cancel).await {
                        break;
                    }
                    failures = failures.saturating_add(1);
                }
            }
        }
    }

    /// Decode, normalize and publish one packet
    pub fn handle_packet(&mut self, packet: &RawPacket) -> PacketOutcome {
        self.stats.received += 1;

        let payload = match decode(&packet.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.decode_failures += 1;
                debug!(origin = %packet.origin, error = %e, "Dropping undecodable packet");
                return PacketOutcome::Dropped;
            }
        };

        let serial = payload.serial();

        match normalize(&payload, self.settings.scheme, packet.arrival_ms()) {
            Ok(record) => {
                self.stats.normalized += 1;
                self.publisher
                    .publish(payload.text(), serial.as_deref(), Some(&record));
                PacketOutcome::Published
            }
            Err(e) => {
                match e {
                    NormalizeError::Unrecognized => self.stats.unrecognized += 1,
                    NormalizeError::InvalidField { .. } => self.stats.invalid_fields += 1,
                }
                debug!(origin = %packet.origin, error = %e, "No normalized record, forwarding raw only");
                self.publisher.publish(payload.text(), serial.as_deref(), None);
                PacketOutcome::RawOnly
            }
        }
    }
}

fn log_status(report: &BridgeReport, message: &str) {
    let packets = &report.packets;
    let publisher = &report.publisher;

    info!(
        received = packets.received,
        normalized = packets.normalized,
        decode_failures = packets.decode_failures,
        unrecognized = packets.unrecognized,
        invalid_fields = packets.invalid_fields,
        transport_errors = packets.transport_errors,
        raw_written = publisher.raw.written,
        raw_dropped = publisher.raw.dropped,
        normalized_written = publisher.normalized.written,
        normalized_dropped = publisher.normalized.dropped,
        "{}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EXIT_TRANSPORT;
    use crate::ingest::mocks::{ScriptedSource, Step};
    use crate::ingest::UdpSource;
    use crate::publish::sink::mocks::RecordingSink;
    use crate::publish::Outbound;
    use std::time::Instant;
    use tokio::time::{sleep, timeout};

    const DRONE: &[u8] = br#"{"gateway":"1581F5BKD225D00A0A2N","timestamp":1734430000000,"data":{"latitude":60.319473,"longitude":24.830822,"height":131.2,"attitude_head":87.46,"battery":{"capacity_percent":76},"position_state":{"gps_number":18,"position_type":50}}}"#;

    const NULL_ISLAND: &[u8] = br#"{"gateway":"SN0","data":{"latitude":0,"longitude":0,"height":0,"battery":{"capacity_percent":50},"position_state":{"gps_number":0,"position_type":0}}}"#;

    const UNRECOGNIZED: &[u8] = br#"{"gateway":"SN9","data":{"wind_speed":3}}"#;

    struct Harness {
        raw: RecordingSink,
        normalized: RecordingSink,
        cancel: CancellationToken,
    }

    fn settings() -> BridgeSettings {
        BridgeSettings {
            scheme: FixScheme::PositionType,
            recv_timeout: Duration::from_millis(100),
            backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        }
    }

    async fn bridge(source: Box<dyn PacketSource>) -> (Bridge, Harness) {
        let raw = RecordingSink::new("raw");
        let normalized = RecordingSink::new("normalized");
        let cancel = CancellationToken::new();

        let publisher = DualSinkPublisher::connect(
            Box::new(raw.clone()),
            Box::new(normalized.clone()),
            "thing/product".to_string(),
            64,
            settings().backoff,
            cancel.clone(),
        )
        .await
        .unwrap();

        let bridge = Bridge::new(source, publisher, settings(), cancel.clone());
        (
            bridge,
            Harness {
                raw,
                normalized,
                cancel,
            },
        )
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
    async fn test_garbage_does_not_stop_the_loop() {
        let source = ScriptedSource::new(vec![
            Step::Packet(&[0xFF, 0xFE, 0x00]),
            Step::Packet(b"not json at all"),
            Step::Packet(b"{\"gateway\":"),
            Step::Packet(DRONE),
        ]);
        let (bridge, h) = bridge(Box::new(source.clone())).await;

        let task = tokio::spawn(bridge.run());
        wait_until(|| h.normalized.get_written().len() == 1).await;
        h.cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.packets.received, 4);
        assert_eq!(report.packets.decode_failures, 3);
        assert_eq!(report.packets.normalized, 1);
        assert_eq!(report.publisher.raw.written, 1);
        assert_eq!(report.publisher.normalized.written, 1);
        assert!(source.receives() >= 4);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_drone_packet_published_on_both_channels() {
        let source = ScriptedSource::new(vec![Step::Packet(DRONE)]);
        let (bridge, h) = bridge(Box::new(source)).await;

        let task = tokio::spawn(bridge.run());
        wait_until(|| h.raw.get_written().len() == 1 && h.normalized.get_written().len() == 1)
            .await;
        h.cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            h.raw.get_written()[0],
            Outbound::Raw {
                topic: "thing/product/1581F5BKD225D00A0A2N/osd".to_string(),
                payload: bytes::Bytes::from_static(DRONE),
            }
        );

        match &h.normalized.get_written()[0] {
            Outbound::Normalized(record) => {
                assert_eq!(record.timestamp_ms, 1734430000000);
                assert_eq!(record.lat, 60.319473);
                assert_eq!(record.lon, 24.830822);
                assert_eq!(record.alt, 131.2);
                assert_eq!(record.sat_count, 18);
                assert_eq!(record.fix_status, crate::gnss::FixStatus::RtkFix);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrecognized_payload_forwards_raw_only() {
        let source = ScriptedSource::new(vec![Step::Packet(UNRECOGNIZED)]);
        let (bridge, h) = bridge(Box::new(source)).await;

        let task = tokio::spawn(bridge.run());
        wait_until(|| h.raw.get_written().len() == 1).await;
        h.cancel.cancel();
        let report = task.await.unwrap();

        match &h.raw.get_written()[0] {
            Outbound::Raw { topic, .. } => assert_eq!(topic, "thing/product/SN9/osd"),
            other => panic!("unexpected item {:?}", other),
        }
        assert!(h.normalized.get_written().is_empty());
        assert_eq!(report.packets.unrecognized, 1);
        assert_eq!(report.packets.normalized, 0);
    }

    #[tokio::test]
    async fn test_null_island_is_published() {
        let source = ScriptedSource::new(vec![Step::Packet(NULL_ISLAND)]);
        let (bridge, h) = bridge(Box::new(source)).await;

        let task = tokio::spawn(bridge.run());
        wait_until(|| h.normalized.get_written().len() == 1).await;
        h.cancel.cancel();
        task.await.unwrap();

        match &h.normalized.get_written()[0] {
            Outbound::Normalized(record) => {
                assert_eq!(record.serial, "SN0");
                assert_eq!(record.lat, 0.0);
                assert_eq!(record.lon, 0.0);
            }
            other => panic!("unexpected item {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_is_retried() {
        let source = ScriptedSource::new(vec![
            Step::Error("socket reset"),
            Step::Error("socket reset"),
            Step::Timeout,
            Step::Packet(DRONE),
        ]);
        let (bridge, h) = bridge(Box::new(source.clone())).await;

        let task = tokio::spawn(bridge.run());
        wait_until(|| h.raw.get_written().len() == 1).await;
        h.cancel.cancel();
        let report = task.await.unwrap();

        assert_eq!(report.packets.transport_errors, 2);
        assert_eq!(report.packets.received, 1);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let source = ScriptedSource::new(vec![]);
        let (bridge, h) = bridge(Box::new(source)).await;
        let mut state = bridge.subscribe_state();
        assert_eq!(*state.borrow(), BridgeState::Starting);

        let task = tokio::spawn(bridge.run());
        timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == BridgeState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        h.cancel.cancel();
        task.await.unwrap();
        assert_eq!(*state.borrow(), BridgeState::Stopped);
        assert!(h.raw.is_closed());
        assert!(h.normalized.is_closed());
    }

    #[tokio::test]
    async fn test_handle_packet_outcomes() {
        let source = ScriptedSource::new(vec![]);
        let (mut bridge, _h) = bridge(Box::new(source)).await;

        let packet = |bytes: &'static [u8]| {
            RawPacket::new(
                bytes::Bytes::from_static(bytes),
                crate::ingest::Transport::Udp,
                "127.0.0.1:40000".to_string(),
            )
        };

        assert_eq!(bridge.handle_packet(&packet(DRONE)), PacketOutcome::Published);
        assert_eq!(bridge.handle_packet(&packet(UNRECOGNIZED)), PacketOutcome::RawOnly);
        assert_eq!(bridge.handle_packet(&packet(b"\xC3\x28")), PacketOutcome::Dropped);
        assert_eq!(
            bridge.handle_packet(&packet(
                br#"{"data":{"battery":{"capacity_percent":"lots"}}}"#
            )),
            PacketOutcome::RawOnly
        );

        let stats = bridge.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.normalized, 1);
        assert_eq!(stats.unrecognized, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.invalid_fields, 1);
    }

    #[tokio::test]
    async fn test_shutdown_within_one_receive_timeout() {
        let udp = UdpSource::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let (bridge, h) = bridge(Box::new(udp)).await;
        let bridge = Bridge {
            settings: BridgeSettings {
                recv_timeout: Duration::from_secs(1),
                ..settings()
            },
            ..bridge
        };

        let task = tokio::spawn(bridge.run());
        sleep(Duration::from_millis(150)).await;

        let start = Instant::now();
        h.cancel.cancel();
        task.await.unwrap();
        assert!(
            start.elapsed() <= Duration::from_millis(1100),
            "shutdown took {:?}",
            start.elapsed()
        );

        // Socket was released
        let rebound = UdpSource::bind(&addr.to_string()).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let toml_content = r#"
[ingest]

[ingest.udp]
bind_addr = "127.0.0.1"
port = 12001

[broker]
host = "127.0.0.1"
port = 1

[gnss]
scheme = "position_type"

[publisher]
connect_timeout_ms = 1000
"#;
        let config = Config::from_toml(toml_content, |_| None).unwrap();

        let result = Bridge::start(&config, CancellationToken::new()).await;
        match result {
            Err(e) => assert_eq!(e.exit_code(), EXIT_TRANSPORT),
            Ok(_) => panic!("start should fail without a broker"),
        }
    }
}
