//! Persistence boundary for the engine.
//!
//! The [`Store`] trait is the access contract the pipeline, the state
//! machine and the lifecycle manager depend on. `postgres` is the
//! production implementation; `memory` backs the unit tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    AlarmStatus, Alert, AuditEntry, CorrectiveAction, CorrectiveActionInput, Decision, EngineResult,
    Pagination, StoredReading, ThresholdChain, TimeRange, Unit, UnitAlarmState,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgStore;

// ---

/// State-machine decision callback handed to [`Store::evaluate_unit`]. It is
/// invoked under the unit's lock with the current state and open alert, and
/// may be invoked again if the alert insert loses a race.
pub type DecideFn<'a> = dyn Fn(&UnitAlarmState, Option<&Alert>) -> Decision + Send + Sync + 'a;

/// What a store did when applying a [`Decision`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEvaluation {
    // ---
    pub previous: UnitAlarmState,
    pub state: UnitAlarmState,
    pub alert: Option<Alert>,
    pub alert_created: bool,
    pub alert_escalated: bool,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcknowledgeOutcome {
    Acknowledged(Alert),
    AlreadyAcknowledged(Alert),
    AlreadyResolved(Alert),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved {
        alert: Alert,
        corrective_action: Option<CorrectiveAction>,
    },
    AlreadyResolved(Alert),
}

#[async_trait]
pub trait Store: Send + Sync {
    // ---
    async fn get_unit(&self, unit_id: Uuid) -> EngineResult<Option<Unit>>;

    /// Unit, site and organization threshold rows for a unit.
    async fn threshold_chain(&self, unit_id: Uuid) -> EngineResult<Option<ThresholdChain>>;

    /// Subset of `unit_ids` that exist and belong to `organization_id`.
    async fn units_in_organization(
        &self,
        organization_id: Uuid,
        unit_ids: &[Uuid],
    ) -> EngineResult<HashSet<Uuid>>;

    /// Append readings and refresh the unit caches in one atomic write.
    ///
    /// Readings whose `(device_id, recorded_at)` already exists are skipped.
    /// Returns the rows actually inserted.
    async fn insert_readings(&self, readings: Vec<StoredReading>) -> EngineResult<Vec<StoredReading>>;

    async fn query_readings(
        &self,
        organization_id: Uuid,
        unit_id: Option<Uuid>,
        range: TimeRange,
        page: Pagination,
    ) -> EngineResult<Vec<StoredReading>>;

    async fn alarm_state(&self, unit_id: Uuid) -> EngineResult<Option<UnitAlarmState>>;

    /// Run `decide` against the unit's alarm state and open alert, then
    /// persist the resulting state and alert change atomically. Calls for
    /// the same unit serialize; calls for different units never block
    /// each other.
    async fn evaluate_unit(
        &self,
        unit_id: Uuid,
        now: DateTime<Utc>,
        decide: &DecideFn<'_>,
    ) -> EngineResult<AppliedEvaluation>;

    async fn get_alert(&self, alert_id: Uuid) -> EngineResult<Option<Alert>>;

    /// Move an `active` alert to `acknowledged`. `audit` is appended only
    /// when the transition happens.
    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        notes: Option<String>,
        audit: AuditEntry,
    ) -> EngineResult<Option<AcknowledgeOutcome>>;

    /// Move an open alert to `resolved`, record the corrective action and
    /// reset the unit's alarm state to `ok`.
    async fn resolve_alert(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        corrective_action: Option<CorrectiveActionInput>,
        audit: AuditEntry,
    ) -> EngineResult<Option<ResolveOutcome>>;
}

/// For each unit, the reading with the latest `recorded_at`.
///
/// Ties keep the reading that appears last, so the result is independent of
/// how the batch happened to be ordered otherwise.
pub fn latest_per_unit(readings: &[StoredReading]) -> HashMap<Uuid, &StoredReading> {
    // ---
    let mut latest: HashMap<Uuid, &StoredReading> = HashMap::new();
    for r in readings {
        match latest.get(&r.unit_id) {
            Some(current) if current.recorded_at > r.recorded_at => {}
            _ => {
                latest.insert(r.unit_id, r);
            }
        }
    }
    latest
}

/// Whether resolving `alert_id` should return the unit to `ok`.
///
/// Only the alarm the unit is currently tracking is reset. Resolving an older
/// alert while a fresh excursion is pending leaves that excursion's timer alone.
pub fn owns_alarm_state(state: &UnitAlarmState, alert_id: Uuid) -> bool {
    state.current_alert_id == Some(alert_id)
        || matches!(state.status, AlarmStatus::AlarmActive | AlarmStatus::Restoring)
}
