//! Schema validation for incoming readings.
//!
//! A batch is accepted only if every reading in it is well formed. The
//! first malformed reading rejects the whole call, identified by its index.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{to_scaled, EngineError, EngineResult, NewReading, RawReading, ReadingSource};

// ---

/// Plausible range for a refrigeration sensor, in degrees Celsius.
pub const MIN_TEMPERATURE_C: f64 = -100.0;
pub const MAX_TEMPERATURE_C: f64 = 150.0;

const MAX_DEVICE_ID_LEN: usize = 128;

/// How far `recorded_at` may run ahead of the receive time before the
/// reading is rejected as coming from a skewed clock.
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 300;

/// Validate a whole batch received at `received_at`. Empty batches are
/// valid and yield no readings.
pub fn validate_batch(
    raw: &[RawReading],
    max_batch_size: usize,
    received_at: DateTime<Utc>,
) -> EngineResult<Vec<NewReading>> {
    // ---
    if raw.len() > max_batch_size {
        return Err(EngineError::Validation(format!(
            "batch of {} readings exceeds the limit of {}",
            raw.len(),
            max_batch_size
        )));
    }

    raw.iter()
        .enumerate()
        .map(|(i, r)| {
            validate_reading(r, received_at).map_err(|reason| EngineError::Validation(format!("reading[{i}]: {reason}")))
        })
        .collect()
}

/// Validate one reading, returning a human-readable reason on failure.
///
/// A reading stamped in the future would mark every later reading of its
/// unit as stale, so `recorded_at` may not exceed `received_at` by more
/// than [`MAX_CLOCK_SKEW_SECONDS`].
pub fn validate_reading(raw: &RawReading, received_at: DateTime<Utc>) -> Result<NewReading, String> {
    // ---
    let unit_id = Uuid::parse_str(raw.unit_id.trim())
        .map_err(|_| format!("unit_id '{}' is not a valid UUID", raw.unit_id))?;

    if !raw.temperature.is_finite()
        || raw.temperature < MIN_TEMPERATURE_C
        || raw.temperature > MAX_TEMPERATURE_C
    {
        return Err(format!(
            "temperature {} is outside {MIN_TEMPERATURE_C}..={MAX_TEMPERATURE_C}",
            raw.temperature
        ));
    }

    if let Some(h) = raw.humidity {
        if !h.is_finite() || !(0.0..=100.0).contains(&h) {
            return Err(format!("humidity {h} is outside 0..=100"));
        }
    }

    let battery_percent = match raw.battery_percent {
        None => None,
        Some(b) if b.fract() == 0.0 && (0.0..=100.0).contains(&b) => Some(b as i16),
        Some(b) => {
            return Err(format!(
                "battery_percent {b} must be an integer between 0 and 100"
            ))
        }
    };

    let device_id = match &raw.device_id {
        None => None,
        Some(d) => {
            let d = d.trim();
            if d.is_empty() || d.len() > MAX_DEVICE_ID_LEN {
                return Err(format!(
                    "device_id must be 1..={MAX_DEVICE_ID_LEN} characters"
                ));
            }
            Some(d.to_string())
        }
    };

    let recorded_at = DateTime::parse_from_rfc3339(raw.recorded_at.trim())
        .map_err(|e| format!("recorded_at '{}' is not an ISO-8601 timestamp: {e}", raw.recorded_at))?
        .with_timezone(&Utc);

    if recorded_at > received_at + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
        return Err(format!(
            "recorded_at {} is more than {MAX_CLOCK_SKEW_SECONDS}s ahead of the receive time {}",
            recorded_at.to_rfc3339(),
            received_at.to_rfc3339()
        ));
    }

    let source: ReadingSource = raw.source.parse()?;

    Ok(NewReading {
        unit_id,
        device_id,
        temperature_centi: to_scaled(raw.temperature),
        humidity: raw.humidity,
        battery_percent,
        signal_strength: raw.signal_strength,
        recorded_at,
        source,
    })
}
