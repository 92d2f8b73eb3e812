//! InfluxDB v2 sink: writes normalized records as line-protocol points.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::line_protocol;
use super::sink::{Outbound, Sink};
use crate::config::InfluxConfig;
use crate::error::SinkError;

const SINK_NAME: &str = "influx";

/// InfluxDB HTTP writer
pub struct InfluxSink {
    client: Client,
    ping_url: String,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    measurement: String,
}

impl InfluxSink {
    /// Build the HTTP client
    ///
    /// `timeout` bounds every request, including the connectivity check.
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Connect` if the HTTP client cannot be created
    pub fn new(config: &InfluxConfig, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SinkError::Connect {
                sink: SINK_NAME,
                message: e.to_string(),
            })?;

        let base = config.url.trim_end_matches('/');

        Ok(Self {
            client,
            ping_url: format!("{}/ping", base),
            write_url: format!("{}/api/v2/write", base),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            measurement: config.measurement.clone(),
        })
    }
}

/// Map a write response status to a sink result
///
/// Throttling and server errors mean the database is not accepting writes
/// right now and the sink should back off; other rejections only lose the
/// one point.
fn check_status(status: StatusCode, body: &str) -> Result<(), SinkError> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        debug!(status = %status, body, "InfluxDB unavailable");
        return Err(SinkError::Disconnected { sink: SINK_NAME });
    }

    Err(SinkError::Write {
        sink: SINK_NAME,
        message: format!("HTTP {}: {}", status, body.trim()),
    })
}

fn request_failed(e: reqwest::Error) -> SinkError {
    if e.is_connect() || e.is_timeout() {
        SinkError::Disconnected { sink: SINK_NAME }
    } else {
        SinkError::Write {
            sink: SINK_NAME,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &'static str {
        SINK_NAME
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        let response = self
            .client
            .get(&self.ping_url)
            .send()
            .await
            .map_err(|e| SinkError::Connect {
                sink: SINK_NAME,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(url = %self.ping_url, "InfluxDB reachable");
            Ok(())
        } else {
            Err(SinkError::Connect {
                sink: SINK_NAME,
                message: format!("ping returned HTTP {}", status),
            })
        }
    }

    async fn write(&mut self, item: &Outbound) -> Result<(), SinkError> {
        let record = match item {
            Outbound::Normalized(record) => record,
            Outbound::Raw { .. } => {
                return Err(SinkError::Unsupported {
                    sink: SINK_NAME,
                    kind: item.kind(),
                })
            }
        };

        let line = line_protocol::encode(&self.measurement, record);

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(header::AUTHORIZATION, format!("Token {}", self.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        check_status(status, &body)
    }

    async fn close(&mut self) {
        debug!("InfluxDB sink closed");
    }
}
