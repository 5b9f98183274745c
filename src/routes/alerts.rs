use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::{AcknowledgeResult, CorrectiveActionInput, EngineError, ResolveResult};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/orgs/{org_id}/alerts/{alert_id}/acknowledge", post(acknowledge))
        .route("/orgs/{org_id}/alerts/{alert_id}/resolve", post(resolve))
}

#[derive(Debug, Deserialize)]
struct AcknowledgeRequest {
    user_id: Uuid,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    user_id: Uuid,
    #[serde(default)]
    corrective_action: Option<CorrectiveActionInput>,
}

async fn acknowledge(
    Path((org_id, alert_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<AcknowledgeResult>, EngineError> {
    // ---
    let result = state
        .lifecycle
        .acknowledge_alert(org_id, alert_id, body.user_id, body.notes)
        .await?;
    Ok(Json(result))
}

async fn resolve(
    Path((org_id, alert_id)): Path<(Uuid, Uuid)>,
    State(state): State<AppState>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<ResolveResult>, EngineError> {
    // ---
    let result = state
        .lifecycle
        .resolve_alert(org_id, alert_id, body.user_id, body.corrective_action)
        .await?;
    Ok(Json(result))
}
