use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::AppState;
use crate::{
    EngineError, IngestSummary, ManualReadingInput, ManualReadingOutcome, Pagination, RawReading,
    SensorReading, TimeRange,
};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/orgs/{org_id}/readings", post(ingest_bulk).get(list_readings))
        .route(
            "/orgs/{org_id}/units/{unit_id}/manual-readings",
            post(create_manual),
        )
}

#[derive(Debug, Deserialize)]
struct BulkReadingsRequest {
    readings: Vec<RawReading>,
}

/// Query parameters for `GET /orgs/{org_id}/readings`.
#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    unit_id: Option<Uuid>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn ingest_bulk(
    Path(org_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<BulkReadingsRequest>,
) -> Result<Json<IngestSummary>, EngineError> {
    // ---
    info!(organization_id = %org_id, count = body.readings.len(), "POST readings");

    let summary = state
        .pipeline
        .ingest_bulk_readings(org_id, &body.readings)
        .await?;
    Ok(Json(summary))
}

async fn list_readings(
    Path(org_id): Path<Uuid>,
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<SensorReading>>, EngineError> {
    // ---
    debug!(organization_id = %org_id, "GET readings: {:?}", params);

    let defaults = Pagination::default();
    let page = Pagination {
        limit: params.limit.unwrap_or(defaults.limit),
        offset: params.offset.unwrap_or(defaults.offset),
    };
    let range = TimeRange {
        from: params.from,
        to: params.to,
    };

    let readings = state
        .pipeline
        .query_readings(org_id, params.unit_id, range, page)
        .await?;
    Ok(Json(readings))
}

async fn create_manual(
    Path((org_id, unit_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
    Json(input): Json<ManualReadingInput>,
) -> Result<(StatusCode, Json<ManualReadingOutcome>), EngineError> {
    // ---
    let outcome = state
        .pipeline
        .create_manual_reading(org_id, unit_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}
