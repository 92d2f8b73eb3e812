//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! A handful of environment variables override file values so credentials and
//! broker addresses can be injected by the deployment:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `MQTT_BROKER_HOST` | `broker.host` |
//! | `MQTT_PORT` | `broker.port` |
//! | `INFLUX_TOKEN` | `influx.token` |

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{BridgeError, Result};
use crate::gnss::FixScheme;
use crate::publish::topics;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub ingest: IngestConfig,
    pub broker: BrokerConfig,
    pub gnss: GnssConfig,

    #[serde(default)]
    pub topics: TopicsConfig,

    #[serde(default)]
    pub normalized: NormalizedConfig,

    #[serde(default)]
    pub influx: Option<InfluxConfig>,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound transport selector
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestTransport {
    Udp,
    Mqtt,
}

/// Inbound configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_transport")]
    pub transport: IngestTransport,

    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    #[serde(default)]
    pub udp: UdpConfig,

    #[serde(default)]
    pub mqtt: MqttIngestConfig,
}

/// UDP listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UdpConfig {
    #[serde(default = "default_udp_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_udp_port")]
    pub port: u16,
}

/// MQTT subscription configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MqttIngestConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_ingest_topic")]
    pub topic: String,

    #[serde(default = "default_ingest_qos")]
    pub qos: u8,

    #[serde(default = "default_ingest_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_ingest_keep_alive_s")]
    pub keep_alive_s: u64,
}

/// Outbound MQTT broker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_broker_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_broker_keep_alive_s")]
    pub keep_alive_s: u64,
}

/// Outbound topic roots
#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    #[serde(default = "default_raw_root")]
    pub raw_root: String,

    #[serde(default = "default_normalized_root")]
    pub normalized_root: String,
}

/// Where normalized records go
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NormalizedSinkKind {
    Mqtt,
    Influx,
}

/// Normalized sink selection
#[derive(Debug, Deserialize, Clone)]
pub struct NormalizedConfig {
    #[serde(default = "default_normalized_sink")]
    pub sink: NormalizedSinkKind,
}

/// InfluxDB v2 configuration
#[derive(Debug, Deserialize, Clone)]
pub struct InfluxConfig {
    #[serde(default = "default_influx_url")]
    pub url: String,

    #[serde(default)]
    pub org: String,

    #[serde(default = "default_influx_bucket")]
    pub bucket: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_influx_measurement")]
    pub measurement: String,
}

/// GNSS classification configuration
///
/// `scheme` has no default: the quality-code encoding depends on the
/// deployed firmware and must be chosen explicitly.
#[derive(Debug, Deserialize, Clone)]
pub struct GnssConfig {
    pub scheme: FixScheme,
}

/// Publisher queue and reconnect configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write daily-rotated log files here instead of stdout
    #[serde(default)]
    pub directory: Option<String>,
}

// Default value functions
fn default_ingest_transport() -> IngestTransport { IngestTransport::Udp }
fn default_recv_timeout_ms() -> u64 { 1000 }

fn default_udp_bind_addr() -> String { "0.0.0.0".to_string() }
fn default_udp_port() -> u16 { 12000 }

fn default_mqtt_host() -> String { "localhost".to_string() }
fn default_mqtt_port() -> u16 { 1883 }
fn default_ingest_topic() -> String { "thing/product/+/osd".to_string() }
fn default_ingest_qos() -> u8 { 1 }
fn default_ingest_client_id() -> String { "osd-bridge-ingest".to_string() }
fn default_ingest_keep_alive_s() -> u64 { 30 }

fn default_broker_client_id() -> String { "osd-bridge".to_string() }
fn default_broker_keep_alive_s() -> u64 { 60 }

fn default_raw_root() -> String { "thing/product".to_string() }
fn default_normalized_root() -> String { "telemetry".to_string() }

fn default_normalized_sink() -> NormalizedSinkKind { NormalizedSinkKind::Mqtt }

fn default_influx_url() -> String { "http://localhost:8086".to_string() }
fn default_influx_bucket() -> String { "telemetry".to_string() }
fn default_influx_measurement() -> String { "telemetry".to_string() }

fn default_queue_capacity() -> usize { 256 }
fn default_connect_timeout_ms() -> u64 { 5000 }
fn default_reconnect_base_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 30000 }

fn default_log_level() -> String { "info".to_string() }

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_udp_bind_addr(),
            port: default_udp_port(),
        }
    }
}

impl Default for MqttIngestConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            topic: default_ingest_topic(),
            qos: default_ingest_qos(),
            client_id: default_ingest_client_id(),
            username: None,
            password: None,
            keep_alive_s: default_ingest_keep_alive_s(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            raw_root: default_raw_root(),
            normalized_root: default_normalized_root(),
        }
    }
}

impl Default for NormalizedConfig {
    fn default() -> Self {
        Self {
            sink: default_normalized_sink(),
        }
    }
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: default_influx_url(),
            org: String::new(),
            bucket: default_influx_bucket(),
            token: String::new(),
            measurement: default_influx_measurement(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl IngestConfig {
    /// Bound on a single receive call
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

impl UdpConfig {
    /// `bind_addr:port`, with IPv6 addresses in brackets (`[::]:12000`)
    ///
    /// A hostname is passed through for the resolver.
    pub fn socket_addr(&self) -> String {
        match self.bind_addr.trim().parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.bind_addr, self.port),
        }
    }
}

impl PublisherConfig {
    /// How long startup waits for a sink to come up
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect policy for sinks and the inbound transport
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.reconnect_base_ms),
            Duration::from_millis(self.reconnect_max_ms),
        )
    }
}

/// Build a configuration error
fn invalid(message: impl std::fmt::Display) -> BridgeError {
    BridgeError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Environment overrides are applied before validation.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - An environment override is malformed
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use osd_bridge::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents, |key| std::env::var(key).ok())
    }

    /// Parse, override and validate configuration text
    ///
    /// `env` resolves override variables; tests pass a closure instead of
    /// touching the process environment.
    pub fn from_toml<F>(contents: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_overrides(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = env("MQTT_BROKER_HOST") {
            self.broker.host = host;
        }

        if let Some(port) = env("MQTT_PORT") {
            self.broker.port = port
                .trim()
                .parse()
                .map_err(|_| invalid(format!("MQTT_PORT '{}' is not a valid port", port)))?;
        }

        if let Some(token) = env("INFLUX_TOKEN") {
            self.influx.get_or_insert_with(InfluxConfig::default).token = token;
        }

        Ok(())
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range or a
    /// credential required by the selected sinks is missing
    fn validate(&self) -> Result<()> {
        // Inbound
        if self.ingest.recv_timeout_ms == 0 || self.ingest.recv_timeout_ms > 10000 {
            return Err(invalid("recv_timeout_ms must be between 1 and 10000"));
        }

        match self.ingest.transport {
            IngestTransport::Udp => {
                if self.ingest.udp.bind_addr.is_empty() {
                    return Err(invalid("ingest.udp.bind_addr cannot be empty"));
                }
                if self.ingest.udp.port == 0 {
                    return Err(invalid("ingest.udp.port cannot be 0"));
                }
            }
            IngestTransport::Mqtt => self.validate_mqtt_ingest()?,
        }

        // Outbound broker
        if self.broker.host.is_empty() {
            return Err(invalid("broker.host cannot be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker.port cannot be 0"));
        }
        if self.broker.client_id.is_empty() {
            return Err(invalid("broker.client_id cannot be empty"));
        }
        validate_credentials(
            "broker",
            &self.broker.username,
            &self.broker.password,
        )?;

        // Topics
        for (name, root) in [
            ("topics.raw_root", &self.topics.raw_root),
            ("topics.normalized_root", &self.topics.normalized_root),
        ] {
            if root.is_empty() || root.ends_with('/') || !topics::is_valid_topic(root) {
                return Err(invalid(format!(
                    "{} must be a non-empty topic without wildcards or trailing '/'",
                    name
                )));
            }
        }

        // Normalized sink
        if self.normalized.sink == NormalizedSinkKind::Influx {
            let influx = self
                .influx
                .as_ref()
                .ok_or_else(|| invalid("[influx] section is required when normalized.sink = \"influx\""))?;

            for (name, value) in [
                ("influx.url", &influx.url),
                ("influx.org", &influx.org),
                ("influx.bucket", &influx.bucket),
                ("influx.token", &influx.token),
                ("influx.measurement", &influx.measurement),
            ] {
                if value.trim().is_empty() {
                    return Err(invalid(format!("{} cannot be empty", name)));
                }
            }

            if !influx.url.starts_with("http://") && !influx.url.starts_with("https://") {
                return Err(invalid("influx.url must start with http:// or https://"));
            }
        }

        // Publisher
        if self.publisher.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }

        if self.publisher.connect_timeout_ms == 0 || self.publisher.connect_timeout_ms > 60000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        if self.publisher.reconnect_base_ms == 0 {
            return Err(invalid("reconnect_base_ms must be greater than 0"));
        }

        if self.publisher.reconnect_max_ms < self.publisher.reconnect_base_ms
            || self.publisher.reconnect_max_ms > 300000
        {
            return Err(invalid(
                "reconnect_max_ms must be between reconnect_base_ms and 300000",
            ));
        }

        Ok(())
    }

    fn validate_mqtt_ingest(&self) -> Result<()> {
        let mqtt = &self.ingest.mqtt;

        if mqtt.host.is_empty() {
            return Err(invalid("ingest.mqtt.host cannot be empty"));
        }
        if mqtt.port == 0 {
            return Err(invalid("ingest.mqtt.port cannot be 0"));
        }
        if mqtt.client_id.is_empty() {
            return Err(invalid("ingest.mqtt.client_id cannot be empty"));
        }
        if mqtt.qos > 2 {
            return Err(invalid("ingest.mqtt.qos must be 0, 1 or 2"));
        }
        if !topics::is_valid_filter(&mqtt.topic) {
            return Err(invalid(format!(
                "ingest.mqtt.topic '{}' is not a valid topic filter",
                mqtt.topic
            )));
        }
        validate_credentials("ingest.mqtt", &mqtt.username, &mqtt.password)?;

        // Subscribing to our own output on the same broker would republish forever
        let same_broker = mqtt.host == self.broker.host && mqtt.port == self.broker.port;
        if same_broker {
            let raw_probe = topics::raw_topic(&self.topics.raw_root, "probe");
            let normalized = topics::normalized_topic(&self.topics.normalized_root);

            if topics::filter_matches(&mqtt.topic, &raw_probe)
                || topics::filter_matches(&mqtt.topic, &normalized)
            {
                return Err(invalid(format!(
                    "ingest.mqtt.topic '{}' matches the bridge's own output on the same broker",
                    mqtt.topic
                )));
            }
        }

        if mqtt.client_id == self.broker.client_id && same_broker {
            return Err(invalid("ingest and broker client_id must differ on the same broker"));
        }

        Ok(())
    }
}

fn validate_credentials(
    section: &str,
    username: &Option<String>,
    password: &Option<String>,
) -> Result<()> {
    match (username, password) {
        (Some(user), _) if user.is_empty() => {
            Err(invalid(format!("{}.username cannot be empty", section)))
        }
        (Some(_), None) => Err(invalid(format!(
            "{}.password is required when username is set",
            section
        ))),
        (None, Some(_)) => Err(invalid(format!(
            "{}.username is required when password is set",
            section
        ))),
        _ => Ok(()),
    }
}
