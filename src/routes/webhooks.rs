use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::{EngineError, IngestSummary, UplinkPayload};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/orgs/{org_id}/webhooks/uplink", post(uplink))
}

/// One device uplink, normalized and sent down the single-reading path.
async fn uplink(
    Path(org_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<UplinkPayload>,
) -> Result<Json<IngestSummary>, EngineError> {
    // ---
    let raw = payload.to_raw_reading();
    debug!(organization_id = %org_id, device_id = ?raw.device_id, "Uplink received");

    let summary = state.pipeline.ingest_reading(org_id, raw).await?;
    Ok(Json(summary))
}
