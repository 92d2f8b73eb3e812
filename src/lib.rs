//! # OSD Bridge Library
//!
//! Normalize drone and remote-controller OSD telemetry and republish it.
//!
//! Packets arrive over UDP or an MQTT subscription, are decoded as JSON,
//! recognized as drone or controller telemetry, classified for GNSS fix
//! quality, and published twice: the unmodified payload to a per-device MQTT
//! topic, and a canonical record to MQTT or InfluxDB.

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod decode;
pub mod error;
pub mod gnss;
pub mod ingest;
pub mod mqtt;
pub mod normalize;
pub mod publish;
