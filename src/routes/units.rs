use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::AppState;
use crate::{from_scaled, AlarmStatus, EngineError, UnitAlarmState};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/orgs/{org_id}/units/{unit_id}/thresholds", get(thresholds))
        .route("/orgs/{org_id}/units/{unit_id}/alarm-state", get(alarm_state))
}

/// Effective thresholds in decimal degrees Celsius.
#[derive(Debug, Serialize)]
struct ThresholdsResponse {
    unit_id: Uuid,
    min_temp: Option<f64>,
    max_temp: f64,
    confirm_seconds: i64,
    hysteresis_margin: f64,
}

#[derive(Debug, Serialize)]
struct AlarmStateResponse {
    unit_id: Uuid,
    unit_name: String,
    site_id: Uuid,
    status: AlarmStatus,
    current_alert_id: Option<Uuid>,
    entered_state_at: Option<DateTime<Utc>>,
    last_evaluated_at: Option<DateTime<Utc>>,
    last_temperature: Option<f64>,
    last_reading_at: Option<DateTime<Utc>>,
}

async fn thresholds(
    Path((org_id, unit_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<ThresholdsResponse>, EngineError> {
    // ---
    state.unit_in_organization(org_id, unit_id).await?;
    let t = state.resolver.resolve_effective_thresholds(unit_id).await?;

    Ok(Json(ThresholdsResponse {
        unit_id,
        min_temp: t.min_temp.map(from_scaled),
        max_temp: from_scaled(t.max_temp),
        confirm_seconds: t.confirm_seconds,
        hysteresis_margin: from_scaled(t.hysteresis_margin),
    }))
}

async fn alarm_state(
    Path((org_id, unit_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
) -> Result<Json<AlarmStateResponse>, EngineError> {
    // ---
    let unit = state.unit_in_organization(org_id, unit_id).await?;
    let current: Option<UnitAlarmState> = state.store.alarm_state(unit_id).await?;

    // A unit that has never been evaluated is `ok`.
    Ok(Json(AlarmStateResponse {
        unit_id,
        unit_name: unit.name,
        site_id: unit.site_id,
        status: current.as_ref().map_or(AlarmStatus::Ok, |s| s.status),
        current_alert_id: current.as_ref().and_then(|s| s.current_alert_id),
        entered_state_at: current.as_ref().map(|s| s.entered_state_at),
        last_evaluated_at: current.as_ref().and_then(|s| s.last_evaluated_at),
        last_temperature: unit.last_temperature.map(from_scaled),
        last_reading_at: unit.last_reading_at,
    }))
}
