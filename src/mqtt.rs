//! Broker connection settings shared by the MQTT source and the MQTT sink.

use rumqttc::{MqttOptions, QoS};
use std::time::Duration;

use crate::config::{BrokerConfig, MqttIngestConfig};
use crate::ingest::MAX_PACKET_SIZE;

/// rumqttc request channel capacity
pub const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Largest MQTT packet read or written: a full datagram, a topic of the
/// longest encodable length, and the fixed and variable headers
pub const MAX_MQTT_PACKET_SIZE: usize = 2 * MAX_PACKET_SIZE + 16;

/// Everything needed to open one broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
}

impl MqttEndpoint {
    /// `host:port`, for logs and errors
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// rumqttc options for this endpoint
    ///
    /// `clean_session = false` asks the broker to keep subscriptions and
    /// queued QoS 1/2 messages across reconnects.
    pub fn options(&self, clean_session: bool) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(clean_session);
        options.set_max_packet_size(MAX_MQTT_PACKET_SIZE, MAX_MQTT_PACKET_SIZE);

        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.clone(), password.clone());
        }

        options
    }
}

fn credentials(username: &Option<String>, password: &Option<String>) -> Option<(String, String)> {
    match (username, password) {
        (Some(u), Some(p)) => Some((u.clone(), p.clone())),
        _ => None,
    }
}

impl From<&BrokerConfig> for MqttEndpoint {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            credentials: credentials(&config.username, &config.password),
            keep_alive: Duration::from_secs(config.keep_alive_s),
        }
    }
}

impl From<&MqttIngestConfig> for MqttEndpoint {
    fn from(config: &MqttIngestConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            credentials: credentials(&config.username, &config.password),
            keep_alive: Duration::from_secs(config.keep_alive_s),
        }
    }
}

/// Map a configured QoS level (validated to 0..=2) to rumqttc
pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
