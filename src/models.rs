//! Data model for the alert evaluation engine.
//!
//! Temperatures are carried as integers scaled by 100 (`centi` degrees
//! Celsius) everywhere below the HTTP boundary. Thresholds use the same
//! scale so boundary comparisons are exact.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Storage scale for temperatures: `3.7 °C` is stored as `370`.
pub const TEMP_SCALE: f64 = 100.0;

/// Convert degrees Celsius to the scaled-integer storage representation.
///
/// Callers validate the range first; values outside `i32` saturate.
pub fn to_scaled(celsius: f64) -> i32 {
    (celsius * TEMP_SCALE).round() as i32
}

/// Convert the scaled-integer storage representation back to degrees Celsius.
pub fn from_scaled(centi: i32) -> f64 {
    f64::from(centi) / TEMP_SCALE
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    Sensor,
    Manual,
    Simulated,
}

impl ReadingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingSource::Sensor => "sensor",
            ReadingSource::Manual => "manual",
            ReadingSource::Simulated => "simulated",
        }
    }
}

impl FromStr for ReadingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(ReadingSource::Sensor),
            "manual" => Ok(ReadingSource::Manual),
            "simulated" => Ok(ReadingSource::Simulated),
            other => Err(format!("unknown reading source '{other}'")),
        }
    }
}

/// Reading as submitted by a device adapter or API client, before validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawReading {
    // ---
    pub unit_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub temperature: f64,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery_percent: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
    /// ISO-8601 / RFC 3339 device timestamp.
    pub recorded_at: String,
    pub source: String,
}

/// Reading that passed schema validation and is ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    // ---
    pub unit_id: Uuid,
    pub device_id: Option<String>,
    pub temperature_centi: i32,
    pub humidity: Option<f64>,
    pub battery_percent: Option<i16>,
    pub signal_strength: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    pub source: ReadingSource,
}

/// Reading as persisted in the append-only reading store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    // ---
    pub id: Uuid,
    pub unit_id: Uuid,
    pub device_id: Option<String>,
    pub temperature_centi: i32,
    pub humidity: Option<f64>,
    pub battery_percent: Option<i16>,
    pub signal_strength: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub source: ReadingSource,
}

impl StoredReading {
    pub fn from_new(reading: NewReading, received_at: DateTime<Utc>) -> Self {
        StoredReading {
            id: Uuid::new_v4(),
            unit_id: reading.unit_id,
            device_id: reading.device_id,
            temperature_centi: reading.temperature_centi,
            humidity: reading.humidity,
            battery_percent: reading.battery_percent,
            signal_strength: reading.signal_strength,
            recorded_at: reading.recorded_at,
            received_at,
            source: reading.source,
        }
    }
}

/// Reading returned to API callers, temperature back in decimal degrees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    // ---
    pub id: Uuid,
    pub unit_id: Uuid,
    pub device_id: Option<String>,
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub battery_percent: Option<i16>,
    pub signal_strength: Option<i32>,
    pub recorded_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub source: ReadingSource,
}

impl From<&StoredReading> for SensorReading {
    fn from(r: &StoredReading) -> Self {
        SensorReading {
            id: r.id,
            unit_id: r.unit_id,
            device_id: r.device_id.clone(),
            temperature: from_scaled(r.temperature_centi),
            humidity: r.humidity,
            battery_percent: r.battery_percent,
            signal_strength: r.signal_strength,
            recorded_at: r.recorded_at,
            received_at: r.received_at,
            source: r.source,
        }
    }
}

// ---

/// Threshold overrides at one level of the organization > site > unit
/// hierarchy. Temperatures are scaled integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThresholdConfig {
    // ---
    pub min_temp: Option<i32>,
    pub max_temp: Option<i32>,
    pub confirm_seconds: Option<i32>,
    pub hysteresis_margin: Option<i32>,
}

/// The three threshold levels that apply to one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdChain {
    // ---
    pub unit_id: Uuid,
    pub organization_id: Uuid,
    pub unit: ThresholdConfig,
    pub site: ThresholdConfig,
    pub organization: ThresholdConfig,
}

/// Thresholds in force for a unit after override resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveThresholds {
    // ---
    /// `None` means the unit has no low-side limit.
    pub min_temp: Option<i32>,
    pub max_temp: i32,
    pub confirm_seconds: i64,
    pub hysteresis_margin: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    // ---
    pub id: Uuid,
    pub organization_id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub last_temperature: Option<i32>,
    pub last_reading_at: Option<DateTime<Utc>>,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    Ok,
    Excursion,
    AlarmActive,
    Restoring,
}

impl AlarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::Ok => "ok",
            AlarmStatus::Excursion => "excursion",
            AlarmStatus::AlarmActive => "alarm_active",
            AlarmStatus::Restoring => "restoring",
        }
    }
}

impl FromStr for AlarmStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(AlarmStatus::Ok),
            "excursion" => Ok(AlarmStatus::Excursion),
            "alarm_active" => Ok(AlarmStatus::AlarmActive),
            "restoring" => Ok(AlarmStatus::Restoring),
            other => Err(format!("unknown alarm status '{other}'")),
        }
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The live alarm record of one unit. Only the state machine writes it
/// (plus the reset performed when a human resolves the alert).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitAlarmState {
    // ---
    pub unit_id: Uuid,
    pub status: AlarmStatus,
    pub current_alert_id: Option<Uuid>,
    pub entered_state_at: DateTime<Utc>,
    /// `recorded_at` of the newest reading that drove the state machine.
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

impl UnitAlarmState {
    pub fn initial(unit_id: Uuid, now: DateTime<Utc>) -> Self {
        UnitAlarmState {
            unit_id,
            status: AlarmStatus::Ok,
            current_alert_id: None,
            entered_state_at: now,
            last_evaluated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    /// Open alerts count toward the one-open-alert-per-unit invariant.
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Acknowledged)
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown alert status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    // ---
    pub id: Uuid,
    pub unit_id: Uuid,
    pub organization_id: Uuid,
    pub severity: Severity,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub metadata: serde_json::Value,
}

/// Alert to be opened by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    // ---
    pub unit_id: Uuid,
    pub organization_id: Uuid,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl NewAlert {
    pub fn into_alert(self, id: Uuid) -> Alert {
        Alert {
            id,
            unit_id: self.unit_id,
            organization_id: self.organization_id,
            severity: self.severity,
            status: AlertStatus::Active,
            triggered_at: self.triggered_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            metadata: self.metadata,
        }
    }
}

/// Remedial step submitted together with a resolve request.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CorrectiveActionInput {
    // ---
    pub description: String,
    pub action_taken: String,
    #[serde(default)]
    pub action_at: Option<DateTime<Utc>>,
}

/// Immutable corrective action record linked to a resolved alert.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CorrectiveAction {
    // ---
    pub id: Uuid,
    pub alert_id: Uuid,
    pub unit_id: Uuid,
    pub performed_by: Uuid,
    pub description: String,
    pub action_taken: String,
    pub action_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Acknowledged,
    Resolved,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Acknowledged => "acknowledged",
            AuditAction::Resolved => "resolved",
        }
    }
}

/// Append-only record of a human action on an alert.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuditEntry {
    // ---
    pub alert_id: Uuid,
    pub organization_id: Uuid,
    pub actor: Uuid,
    pub action: AuditAction,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Pagination {
            limit: 100,
            offset: 0,
        }
    }
}

/// Counts reported back to ingestion callers. Evaluation failures lower
/// the alert counts but never the insert count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    // ---
    pub inserted: usize,
    pub duplicates: usize,
    /// Readings dropped because their unit is not part of the organization.
    pub filtered: usize,
    pub units_evaluated: usize,
    pub alerts_triggered: usize,
    pub alerts_escalated: usize,
    pub evaluation_failures: usize,
}
