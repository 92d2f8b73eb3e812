//! InfluxDB line protocol encoding for normalized records.
//!
//! ```text
//! <measurement>,device_serial=<serial>,fix_status=<label> lat=..,lon=..,alt=..,heading=..,battery_pct=..,sat_count=<n>i,fix_code=<n>i <timestamp_ms>
//! ```
//!
//! Timestamps are milliseconds; the write request must use `precision=ms`.

use std::fmt::Write;

use crate::normalize::NormalizedRecord;

/// Encode one record as a single line-protocol point
pub fn encode(measurement: &str, record: &NormalizedRecord) -> String {
    let mut line = String::with_capacity(192);

    line.push_str(&escape_measurement(measurement));
    line.push_str(",device_serial=");
    line.push_str(&escape_tag(&record.serial));
    line.push_str(",fix_status=");
    line.push_str(record.fix_status.label());

    // Writing into a String cannot fail
    let _ = write!(
        line,
        " lat={},lon={},alt={},heading={},battery_pct={},sat_count={}i,fix_code={}i {}",
        float(record.lat),
        float(record.lon),
        float(record.alt),
        float(record.heading),
        float(record.battery_pct),
        record.sat_count,
        record.fix_code,
        record.timestamp_ms,
    );

    line
}

/// Floats always carry a decimal point so Influx types the field as float
fn float(value: f64) -> String {
    let text = value.to_string();
    if text.contains(['.', 'e', 'E']) || !value.is_finite() {
        text
    } else {
        format!("{}.0", text)
    }
}

fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

fn escape_tag(value: &str) -> String {
    if value.is_empty() {
        return "unknown".to_string();
    }
    escape(value, &[',', ' ', '='])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' | '\r' => out.push('_'),
            c if special.contains(&c) || c == '\\' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}
