//! HTTP gateway: merges the per-resource sub-routers and owns the shared
//! application state handed to every handler.

use std::sync::Arc;

use axum::Router;
use uuid::Uuid;

use crate::{
    AlertEvaluator, AlertLifecycleManager, Config, EngineError, EngineResult, RealtimeEmitter,
    ReadingIngestionPipeline, Store, ThresholdResolver, Unit,
};

mod alerts;
mod health;
mod readings;
mod units;
mod webhooks;

// ---

/// Services shared by all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub store: Arc<dyn Store>,
    pub pipeline: ReadingIngestionPipeline,
    pub lifecycle: AlertLifecycleManager,
    pub resolver: ThresholdResolver,
}

impl AppState {
    // ---
    pub fn new(store: Arc<dyn Store>, emitter: Arc<dyn RealtimeEmitter>, config: &Config) -> Self {
        let evaluator = AlertEvaluator::new(store.clone(), emitter.clone(), config.critical_delta_centi);
        Self {
            pipeline: ReadingIngestionPipeline::new(
                store.clone(),
                evaluator,
                emitter.clone(),
                config.max_batch_size,
            ),
            lifecycle: AlertLifecycleManager::new(store.clone(), emitter),
            resolver: ThresholdResolver::new(store.clone()),
            store,
        }
    }

    /// Unit lookup scoped to an organization; a foreign unit is not found.
    pub async fn unit_in_organization(&self, organization_id: Uuid, unit_id: Uuid) -> EngineResult<Unit> {
        match self.store.get_unit(unit_id).await? {
            Some(unit) if unit.organization_id == organization_id => Ok(unit),
            _ => Err(EngineError::unit_not_found(unit_id)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(units::router())
        .merge(alerts::router())
        .merge(webhooks::router())
        .merge(health::router())
        .with_state(state)
}
