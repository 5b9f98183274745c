//! Error kinds shared by the evaluation engine, the ingestion pipeline and
//! the alert lifecycle, plus their mapping onto HTTP responses.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

// ---

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Unit, alert or reading scope that does not exist for the caller's
    /// organization. Never distinguishes "wrong org" from "missing".
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no thresholds configured for unit {unit_id}: missing {field}")]
    NoThresholdsConfigured { unit_id: Uuid, field: &'static str },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no reading in the batch references a unit of organization {0}")]
    NoValidUnits(Uuid),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    // ---
    pub fn unit_not_found(unit_id: Uuid) -> Self {
        EngineError::NotFound {
            entity: "unit",
            id: unit_id.to_string(),
        }
    }

    pub fn alert_not_found(alert_id: Uuid) -> Self {
        EngineError::NotFound {
            entity: "alert",
            id: alert_id.to_string(),
        }
    }

    /// Short machine-readable kind used in response bodies.
    pub fn kind(&self) -> &'static str {
        // ---
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::NoThresholdsConfigured { .. } => "no_thresholds_configured",
            EngineError::Conflict(_) => "conflict",
            EngineError::NoValidUnits(_) => "no_valid_units",
            EngineError::Store(_) => "store",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Store(e.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        // ---
        let status = match &self {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::NoThresholdsConfigured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::NoValidUnits(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(status = ?status, message = ?self);
        }

        let body = Json(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
