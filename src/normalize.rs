//! # Device Normalizer
//!
//! Converts decoded vendor telemetry into a [`NormalizedRecord`].
//!
//! Upstream firmware does not reliably say which device sent a message, so the
//! variant is recovered from the payload's structure:
//!
//! | Signature | Variant |
//! |-----------|---------|
//! | `data.battery` present | drone |
//! | `data.device_list` present | remote controller |
//! | anything else | unrecognized |
//!
//! New device variants are added as a [`Shape`] arm plus a builder function.
//!
//! ## Drone payload (abridged)
//!
//! ```json
//! {
//!   "gateway": "1581F5BKD225D00A0A2N",
//!   "timestamp": 1734430000000,
//!   "data": {
//!     "latitude": 60.319473, "longitude": 24.830822,
//!     "height": 131.2, "attitude_head": 87.4,
//!     "battery": { "capacity_percent": 76 },
//!     "position_state": { "gps_number": 18, "rtk_inpos": 2, "position_type": 50 }
//!   }
//! }
//! ```

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::decode::DecodedPayload;
use crate::gnss::{classify, FixScheme, FixStatus};

/// Serial used when a drone payload carries no `gateway`
pub const UNKNOWN_DRONE_SERIAL: &str = "unknown_drone";

/// Serial used when a controller payload carries no `gateway`
pub const UNKNOWN_CONTROLLER_SERIAL: &str = "unknown_controller";

/// Decimal places kept for latitude and longitude
const LAT_LON_DECIMALS: i32 = 6;

/// Decimal places kept for altitude and heading
const ALT_HEADING_DECIMALS: i32 = 2;

/// Recognized device variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Drone,
    Controller,
}

/// Canonical, firmware-independent telemetry record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub device_type: DeviceType,
    pub serial: String,
    /// Degrees, 6 decimal places
    pub lat: f64,
    /// Degrees, 6 decimal places
    pub lon: f64,
    /// Meters, 2 decimal places
    pub alt: f64,
    /// Degrees, 2 decimal places
    pub heading: f64,
    /// Battery remaining, 0-100
    pub battery_pct: f64,
    pub sat_count: u32,
    pub fix_status: FixStatus,
    /// Raw quality code the fix status was derived from
    #[serde(skip)]
    pub fix_code: i64,
}

/// Why no record was produced
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    /// The payload matches no known device signature
    #[error("payload matches no known device shape")]
    Unrecognized,

    /// A field of a recognized shape holds an unusable value
    #[error("field '{field}' has unusable value {found}")]
    InvalidField { field: &'static str, found: String },
}

/// Structural signature of a payload
#[derive(Debug)]
enum Shape<'a> {
    Drone(&'a Map<String, Value>),
    Controller(&'a Map<String, Value>),
}

impl<'a> Shape<'a> {
    fn detect(tree: &'a Value) -> Option<Self> {
        let data = tree.get("data")?.as_object()?;

        if data.contains_key("battery") {
            Some(Shape::Drone(data))
        } else if data.contains_key("device_list") {
            Some(Shape::Controller(data))
        } else {
            None
        }
    }
}

/// Normalize a decoded payload
///
/// `fallback_timestamp_ms` is used when the payload has no integer
/// `timestamp`; passing the packet's arrival time keeps the function pure, so
/// redelivered duplicates normalize to identical records.
///
/// # Errors
///
/// - [`NormalizeError::Unrecognized`] if no device signature matches
/// - [`NormalizeError::InvalidField`] if a recognized payload carries a
///   non-numeric value where a number is expected
///
/// # Examples
///
/// ```
/// use osd_bridge::decode::decode;
/// use osd_bridge::gnss::{FixScheme, FixStatus};
/// use osd_bridge::normalize::{normalize, DeviceType};
///
/// let payload = decode(br#"{"gateway":"RC1","data":{"device_list":[],"capacity_percent":88}}"#)?;
/// let record = normalize(&payload, FixScheme::PositionType, 0)?;
///
/// assert_eq!(record.device_type, DeviceType::Controller);
/// assert_eq!(record.battery_pct, 88.0);
/// assert_eq!(record.fix_status, FixStatus::None);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn normalize(
    payload: &DecodedPayload,
    scheme: FixScheme,
    fallback_timestamp_ms: i64,
) -> Result<NormalizedRecord, NormalizeError> {
    let tree = payload.tree();
    let timestamp_ms = timestamp(tree).unwrap_or(fallback_timestamp_ms);

    match Shape::detect(tree).ok_or(NormalizeError::Unrecognized)? {
        Shape::Drone(data) => {
            let serial = payload
                .serial()
                .unwrap_or_else(|| UNKNOWN_DRONE_SERIAL.to_string());
            drone_record(data, scheme, timestamp_ms, serial)
        }
        Shape::Controller(data) => {
            let serial = payload
                .serial()
                .unwrap_or_else(|| UNKNOWN_CONTROLLER_SERIAL.to_string());
            controller_record(data, timestamp_ms, serial)
        }
    }
}

fn drone_record(
    data: &Map<String, Value>,
    scheme: FixScheme,
    timestamp_ms: i64,
    serial: String,
) -> Result<NormalizedRecord, NormalizeError> {
    let battery = block(data, "battery", "data.battery")?;
    let position = block(data, "position_state", "data.position_state")?;

    let fix_code = integer(position, scheme.code_field(), "data.position_state.code")?;
    let sat_count = integer(position, "gps_number", "data.position_state.gps_number")?;

    Ok(NormalizedRecord {
        timestamp_ms,
        device_type: DeviceType::Drone,
        serial,
        lat: round_to(number(data, "latitude", "data.latitude")?, LAT_LON_DECIMALS),
        lon: round_to(number(data, "longitude", "data.longitude")?, LAT_LON_DECIMALS),
        alt: round_to(number(data, "height", "data.height")?, ALT_HEADING_DECIMALS),
        heading: round_to(
            number(data, "attitude_head", "data.attitude_head")?,
            ALT_HEADING_DECIMALS,
        ),
        battery_pct: battery_percent(number(
            battery,
            "capacity_percent",
            "data.battery.capacity_percent",
        )?),
        sat_count: u32::try_from(sat_count.max(0)).unwrap_or(u32::MAX),
        fix_status: classify(fix_code, scheme),
        fix_code,
    })
}

/// A controller reports no position of its own; only the battery is read
fn controller_record(
    data: &Map<String, Value>,
    timestamp_ms: i64,
    serial: String,
) -> Result<NormalizedRecord, NormalizeError> {
    Ok(NormalizedRecord {
        timestamp_ms,
        device_type: DeviceType::Controller,
        serial,
        lat: 0.0,
        lon: 0.0,
        alt: 0.0,
        heading: 0.0,
        battery_pct: battery_percent(number(
            data,
            "capacity_percent",
            "data.capacity_percent",
        )?),
        sat_count: 0,
        fix_status: FixStatus::None,
        fix_code: 0,
    })
}

/// Round half away from zero to `decimals` places
///
/// Values too large to scale are returned as-is; they carry no fractional
/// digits at that magnitude anyway.
fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

fn battery_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}

fn timestamp(tree: &Value) -> Option<i64> {
    match tree.get("timestamp")? {
        Value::Number(n) => exact_i64(n),
        _ => None,
    }
}

/// Integral JSON number that fits an `i64` without saturating
fn exact_i64(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|v| v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64)
            .map(|v| v as i64)
    })
}

/// Nested object; an absent block reads as empty
fn block<'a>(
    data: &'a Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<&'a Map<String, Value>, NormalizeError> {
    static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();

    match data.get(key) {
        None | Some(Value::Null) => Ok(EMPTY.get_or_init(Map::new)),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(invalid(field, other)),
    }
}

/// Numeric field; absent reads as 0, numeric strings are accepted
fn number(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<f64, NormalizeError> {
    let value = match map.get(key) {
        None | Some(Value::Null) => return Ok(0.0),
        Some(value) => value,
    };

    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| invalid(field, value))
}

/// Integral field; absent reads as 0, integral floats and strings are accepted
fn integer(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<i64, NormalizeError> {
    let value = match map.get(key) {
        None | Some(Value::Null) => return Ok(0),
        Some(value) => value,
    };

    let parsed = match value {
        Value::Number(n) => exact_i64(n),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    parsed.ok_or_else(|| invalid(field, value))
}

fn invalid(field: &'static str, value: &Value) -> NormalizeError {
    NormalizeError::InvalidField {
        field,
        found: value.to_string(),
    }
}
