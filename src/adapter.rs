//! Device uplink adapter.
//!
//! Gateways post one uplink per sensor report. The adapter turns it into a
//! [`RawReading`] for the regular single-reading ingestion path: Fahrenheit
//! is converted to Celsius and device identifiers are normalized so that
//! `70:b3:d5:7e`, `70-B3-D5-7E` and `70b3d57e` collapse onto one key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RawReading, ReadingSource};

// ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum TemperatureUnit {
    #[default]
    #[serde(rename = "C")]
    Celsius,
    #[serde(rename = "F")]
    Fahrenheit,
}

/// Uplink body as delivered by a gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UplinkPayload {
    // ---
    pub unit_id: String,
    pub device_id: String,
    pub temperature: f64,
    #[serde(default)]
    pub temperature_unit: TemperatureUnit,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery_percent: Option<f64>,
    #[serde(default)]
    pub rssi: Option<i32>,
    pub recorded_at: DateTime<Utc>,
}

impl UplinkPayload {
    // ---
    pub fn to_raw_reading(&self) -> RawReading {
        // ---
        RawReading {
            unit_id: self.unit_id.trim().to_string(),
            device_id: Some(normalize_device_id(&self.device_id)),
            temperature: celsius(self.temperature, self.temperature_unit),
            humidity: self.humidity,
            battery_percent: self.battery_percent,
            signal_strength: self.rssi,
            recorded_at: self.recorded_at.to_rfc3339(),
            source: ReadingSource::Sensor.as_str().to_string(),
        }
    }
}

/// Temperature in Celsius, rounded to two decimals.
pub fn celsius(value: f64, unit: TemperatureUnit) -> f64 {
    let c = match unit {
        TemperatureUnit::Celsius => value,
        TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
    };
    (c * 100.0).round() / 100.0
}

/// Trim, drop `:` and `-` separators, upper-case.
pub fn normalize_device_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}
