//! Effective threshold resolution across the organization > site > unit
//! override hierarchy.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::{EffectiveThresholds, EngineError, EngineResult, Store, ThresholdChain};

// ---

/// Pick the most specific value set for one field.
fn first_set<T: Copy>(levels: [Option<T>; 3]) -> Option<T> {
    levels.into_iter().flatten().next()
}

/// Resolve each field independently: unit, then site, then organization.
///
/// `min_temp` may be absent at every level (no low-side limit); any other
/// field missing at every level is `NoThresholdsConfigured`.
pub fn resolve(chain: &ThresholdChain) -> EngineResult<EffectiveThresholds> {
    // ---
    let (u, s, o) = (&chain.unit, &chain.site, &chain.organization);
    let missing = |field| EngineError::NoThresholdsConfigured {
        unit_id: chain.unit_id,
        field,
    };

    let min_temp = first_set([u.min_temp, s.min_temp, o.min_temp]);
    let max_temp = first_set([u.max_temp, s.max_temp, o.max_temp]).ok_or_else(|| missing("max_temp"))?;
    let confirm_seconds = first_set([u.confirm_seconds, s.confirm_seconds, o.confirm_seconds])
        .ok_or_else(|| missing("confirm_seconds"))?;
    let hysteresis_margin = first_set([u.hysteresis_margin, s.hysteresis_margin, o.hysteresis_margin])
        .ok_or_else(|| missing("hysteresis_margin"))?;

    if let Some(min) = min_temp {
        if min >= max_temp {
            return Err(EngineError::Validation(format!(
                "unit {}: min_temp {} must be below max_temp {}",
                chain.unit_id, min, max_temp
            )));
        }
    }
    if confirm_seconds < 0 || hysteresis_margin < 0 {
        return Err(EngineError::Validation(format!(
            "unit {}: confirm_seconds and hysteresis_margin must not be negative",
            chain.unit_id
        )));
    }
    // The recovery band [min + margin, max - margin] must hold at least one value,
    // otherwise an active alarm can never restore.
    if let Some(min) = min_temp {
        if min + 2 * hysteresis_margin > max_temp {
            return Err(EngineError::Validation(format!(
                "unit {}: hysteresis_margin {} leaves no recovery band between {} and {}",
                chain.unit_id, hysteresis_margin, min, max_temp
            )));
        }
    }

    Ok(EffectiveThresholds {
        min_temp,
        max_temp,
        confirm_seconds: i64::from(confirm_seconds),
        hysteresis_margin,
    })
}

/// Loads the threshold chain for a unit and resolves it. Nothing is cached:
/// admins may change thresholds between two readings.
#[derive(Clone)]
pub struct ThresholdResolver {
    store: Arc<dyn Store>,
}

impl ThresholdResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve_effective_thresholds(&self, unit_id: Uuid) -> EngineResult<EffectiveThresholds> {
        // ---
        let chain = self
            .store
            .threshold_chain(unit_id)
            .await?
            .ok_or_else(|| EngineError::unit_not_found(unit_id))?;

        let thresholds = resolve(&chain)?;
        debug!(unit_id = %unit_id, ?thresholds, "Resolved effective thresholds");
        Ok(thresholds)
    }
}
