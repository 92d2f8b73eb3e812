//! # GNSS Fix Classifier
//!
//! Maps raw GNSS quality codes to a canonical [`FixStatus`].
//!
//! Firmware generations report solution quality in different encodings, so the
//! classifier is parameterized by a [`FixScheme`] chosen in configuration:
//!
//! | Scheme | Code | Status |
//! |--------|------|--------|
//! | `position_type` | 0 | `NONE` |
//! | `position_type` | 16 | `SINGLE` |
//! | `position_type` | 34 | `RTK_FLOAT` |
//! | `position_type` | 50 | `RTK_FIX` |
//! | `tri_state` | 0 | `NONE` |
//! | `tri_state` | 1 | `RTK_FLOAT` |
//! | `tri_state` | 2 | `RTK_FIX` |
//!
//! Every other code becomes `UNKNOWN(code)`. Unknown codes are never folded
//! into `NONE`: a firmware change must stay visible downstream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position-type code: no solution
pub const POSITION_TYPE_NONE: i64 = 0;
/// Position-type code: single point (standalone GNSS)
pub const POSITION_TYPE_SINGLE: i64 = 16;
/// Position-type code: RTK float ambiguity
pub const POSITION_TYPE_RTK_FLOAT: i64 = 34;
/// Position-type code: RTK fixed ambiguity
pub const POSITION_TYPE_RTK_FIX: i64 = 50;

/// Quality-code encoding used by the connected firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixScheme {
    /// Four-value position type (0/16/34/50)
    PositionType,
    /// Coarse RTK in-position flag (0/1/2), no single-point distinction
    TriState,
}

impl FixScheme {
    /// Key inside the drone's `position_state` block that carries the code
    pub fn code_field(self) -> &'static str {
        match self {
            FixScheme::PositionType => "position_type",
            FixScheme::TriState => "rtk_inpos",
        }
    }
}

impl fmt::Display for FixScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixScheme::PositionType => write!(f, "position_type"),
            FixScheme::TriState => write!(f, "tri_state"),
        }
    }
}

/// Canonical GNSS fix status
///
/// Serializes as `"NONE"`, `"SINGLE"`, `"RTK_FLOAT"`, `"RTK_FIX"` or
/// `{"UNKNOWN": code}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixStatus {
    None,
    Single,
    RtkFloat,
    RtkFix,
    /// Code not defined by the configured scheme, kept for inspection
    Unknown(i64),
}

impl FixStatus {
    /// Tag value used by the time-series sink
    pub fn label(&self) -> &'static str {
        match self {
            FixStatus::None => "NONE",
            FixStatus::Single => "SINGLE",
            FixStatus::RtkFloat => "RTK_FLOAT",
            FixStatus::RtkFix => "RTK_FIX",
            FixStatus::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for FixStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixStatus::Unknown(code) => write!(f, "UNKNOWN({})", code),
            other => f.write_str(other.label()),
        }
    }
}

/// Classify a raw quality code under the given scheme
///
/// # Examples
///
/// ```
/// use osd_bridge::gnss::{classify, FixScheme, FixStatus};
///
/// assert_eq!(classify(50, FixScheme::PositionType), FixStatus::RtkFix);
/// assert_eq!(classify(2, FixScheme::TriState), FixStatus::RtkFix);
/// assert_eq!(classify(99, FixScheme::PositionType), FixStatus::Unknown(99));
/// ```
pub fn classify(code: i64, scheme: FixScheme) -> FixStatus {
    match scheme {
        FixScheme::PositionType => match code {
            POSITION_TYPE_NONE => FixStatus::None,
            POSITION_TYPE_SINGLE => FixStatus::Single,
            POSITION_TYPE_RTK_FLOAT => FixStatus::RtkFloat,
            POSITION_TYPE_RTK_FIX => FixStatus::RtkFix,
            other => FixStatus::Unknown(other),
        },
        FixScheme::TriState => match code {
            0 => FixStatus::None,
            1 => FixStatus::RtkFloat,
            2 => FixStatus::RtkFix,
            other => FixStatus::Unknown(other),
        },
    }
}
