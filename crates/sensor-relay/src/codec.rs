// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire codec for sensor readings.
//!
//! Readings arrive as JSON objects such as:
//!
//! ```json
//! {
//!   "city": "Belo Horizonte",
//!   "timestamp_utc": "2025-11-22T03:38:00Z",
//!   "temperature_c": 21.5,
//!   "humidity_pct": 76,
//!   "wind_speed_kmh": 10.4,
//!   "condition_text": "Nublado",
//!   "rain_probability_pct": 42
//! }
//! ```
//!
//! Only `city` is required. The data producer emits `timestamp`, `humidity` and
//! `rain_probability`, which are accepted in place of the canonical names.
//! When both spellings are present the canonical one wins.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{DecodeError, EncodeError};

const RAIN_PROBABILITY_MIN: i64 = 0;
const RAIN_PROBABILITY_MAX: i64 = 100;
// `YYYY-MM-DD` precedes the separator
const DATE_TIME_SEPARATOR_INDEX: usize = 10;

/// A single weather observation for one location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub city: String,
    pub timestamp_utc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed_kmh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rain_probability_pct: Option<i64>,
}

// Everything is optional on the wire so that a missing city surfaces as
// `DecodeError::MissingCity` rather than a serde message.
#[derive(Deserialize)]
struct WireReading {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    timestamp_utc: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    temperature_c: Option<f64>,
    #[serde(default)]
    humidity_pct: Option<i64>,
    #[serde(default)]
    humidity: Option<i64>,
    #[serde(default)]
    wind_speed_kmh: Option<f64>,
    #[serde(default)]
    condition_text: Option<String>,
    #[serde(default)]
    rain_probability_pct: Option<i64>,
    #[serde(default)]
    rain_probability: Option<i64>,
}

/// Parses a raw payload into a [`Reading`].
pub fn decode(raw: &[u8]) -> Result<Reading, DecodeError> {
    let wire: WireReading = serde_json::from_slice(raw)?;

    let city = match wire.city {
        Some(city) if !city.is_empty() => city,
        _ => return Err(DecodeError::MissingCity),
    };

    Ok(Reading {
        city,
        timestamp_utc: wire.timestamp_utc.or(wire.timestamp).unwrap_or_default(),
        temperature_c: wire.temperature_c,
        humidity_pct: wire.humidity_pct.or(wire.humidity),
        wind_speed_kmh: wire.wind_speed_kmh,
        condition_text: wire.condition_text,
        rain_probability_pct: wire.rain_probability_pct.or(wire.rain_probability),
    })
}

/// Serializes a reading for the ingestion endpoint. Absent fields are omitted.
pub fn encode(reading: &Reading) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(reading)?)
}

/// Applies the field-level normalization rules using the current time.
pub fn normalize(reading: Reading) -> Reading {
    normalize_at(reading, Utc::now())
}

/// Applies the normalization rules, using `now` wherever a timestamp has to
/// be substituted.
///
/// 1. An empty timestamp becomes `now`.
/// 2. A timestamp that is not RFC 3339 with a `T` separator becomes `now`;
///    the original is logged.
/// 3. A valid timestamp ending in `Z` or `+00:00` is kept as is. Any other
///    offset, `-00:00` included, is rewritten in UTC with a `Z` suffix.
/// 4. The rain probability is clamped to `[0, 100]`.
pub fn normalize_at(mut reading: Reading, now: DateTime<Utc>) -> Reading {
    reading.timestamp_utc = normalize_timestamp(reading.timestamp_utc, now);
    reading.rain_probability_pct = reading
        .rain_probability_pct
        .map(|pct| pct.clamp(RAIN_PROBABILITY_MIN, RAIN_PROBABILITY_MAX));
    reading
}

fn normalize_timestamp(timestamp: String, now: DateTime<Utc>) -> String {
    let now = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    if timestamp.is_empty() {
        warn!(replacement = %now, "Codec | timestamp_utc missing, set to now");
        return now;
    }

    match parse_timestamp(&timestamp) {
        Ok(_) if is_utc_suffix(&timestamp) => timestamp,
        Ok(parsed) => parsed
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Err(reason) => {
            warn!(
                original = %timestamp,
                replacement = %now,
                error = %reason,
                "Codec | timestamp_utc parse failed, replaced with now"
            );
            now
        }
    }
}

// chrono also accepts a space or a lowercase `t` between date and time.
fn parse_timestamp(timestamp: &str) -> Result<DateTime<FixedOffset>, String> {
    if timestamp.as_bytes().get(DATE_TIME_SEPARATOR_INDEX) != Some(&b'T') {
        return Err("date and time must be separated by 'T'".to_string());
    }
    DateTime::parse_from_rfc3339(timestamp).map_err(|e| e.to_string())
}

fn is_utc_suffix(timestamp: &str) -> bool {
    timestamp.ends_with('Z') || timestamp.ends_with("+00:00")
}
