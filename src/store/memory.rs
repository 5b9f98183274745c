//! In-memory [`Store`] used by the unit tests.
//!
//! Tables sit behind one short-lived `std::sync::Mutex`; evaluations take
//! an additional per-unit `tokio::sync::Mutex` so that two evaluations of
//! the same unit serialize while different units proceed independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::{
    latest_per_unit, owns_alarm_state, AcknowledgeOutcome, AppliedEvaluation, DecideFn,
    ResolveOutcome, Store,
};
use crate::{
    Alert, AlarmStatus, AlertAction, AlertStatus, AuditEntry, CorrectiveAction,
    CorrectiveActionInput, EngineResult, Pagination, StoredReading, ThresholdChain,
    ThresholdConfig, TimeRange, Unit, UnitAlarmState,
};

// ---

#[derive(Default)]
struct Tables {
    organizations: HashMap<Uuid, ThresholdConfig>,
    sites: HashMap<Uuid, (Uuid, ThresholdConfig)>,
    units: HashMap<Uuid, (Unit, ThresholdConfig)>,
    readings: Vec<StoredReading>,
    states: HashMap<Uuid, UnitAlarmState>,
    alerts: Vec<Alert>,
    corrective_actions: Vec<CorrectiveAction>,
    audit_log: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unit_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_organization(&self, thresholds: ThresholdConfig) -> Uuid {
        let id = Uuid::new_v4();
        self.tables.lock().unwrap().organizations.insert(id, thresholds);
        id
    }

    pub fn add_site(&self, organization_id: Uuid, thresholds: ThresholdConfig) -> Uuid {
        let id = Uuid::new_v4();
        self.tables
            .lock()
            .unwrap()
            .sites
            .insert(id, (organization_id, thresholds));
        id
    }

    pub fn add_unit(&self, site_id: Uuid, name: &str, thresholds: ThresholdConfig) -> Uuid {
        // ---
        let mut tables = self.tables.lock().unwrap();
        let organization_id = tables.sites[&site_id].0;
        let id = Uuid::new_v4();
        let unit = Unit {
            id,
            organization_id,
            site_id,
            name: name.to_string(),
            last_temperature: None,
            last_reading_at: None,
        };
        tables.units.insert(id, (unit, thresholds));
        id
    }

    pub fn set_unit_thresholds(&self, unit_id: Uuid, thresholds: ThresholdConfig) {
        if let Some(entry) = self.tables.lock().unwrap().units.get_mut(&unit_id) {
            entry.1 = thresholds;
        }
    }

    pub fn unit(&self, unit_id: Uuid) -> Option<Unit> {
        self.tables
            .lock()
            .unwrap()
            .units
            .get(&unit_id)
            .map(|(u, _)| u.clone())
    }

    pub fn reading_count(&self) -> usize {
        self.tables.lock().unwrap().readings.len()
    }

    pub fn open_alert_count(&self, unit_id: Uuid) -> usize {
        self.tables
            .lock()
            .unwrap()
            .alerts
            .iter()
            .filter(|a| a.unit_id == unit_id && a.status.is_open())
            .count()
    }

    pub fn corrective_actions(&self) -> Vec<CorrectiveAction> {
        self.tables.lock().unwrap().corrective_actions.clone()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.tables.lock().unwrap().audit_log.clone()
    }

    fn unit_lock(&self, unit_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.unit_locks
            .lock()
            .unwrap()
            .entry(unit_id)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ---
    async fn get_unit(&self, unit_id: Uuid) -> EngineResult<Option<Unit>> {
        Ok(self.unit(unit_id))
    }

    async fn threshold_chain(&self, unit_id: Uuid) -> EngineResult<Option<ThresholdChain>> {
        // ---
        let tables = self.tables.lock().unwrap();
        let Some((unit, unit_thresholds)) = tables.units.get(&unit_id) else {
            return Ok(None);
        };
        let site = tables.sites.get(&unit.site_id).map(|(_, t)| *t).unwrap_or_default();
        let organization = tables
            .organizations
            .get(&unit.organization_id)
            .copied()
            .unwrap_or_default();

        Ok(Some(ThresholdChain {
            unit_id,
            organization_id: unit.organization_id,
            unit: *unit_thresholds,
            site,
            organization,
        }))
    }

    async fn units_in_organization(
        &self,
        organization_id: Uuid,
        unit_ids: &[Uuid],
    ) -> EngineResult<HashSet<Uuid>> {
        let tables = self.tables.lock().unwrap();
        Ok(unit_ids
            .iter()
            .filter(|id| {
                tables
                    .units
                    .get(*id)
                    .is_some_and(|(u, _)| u.organization_id == organization_id)
            })
            .copied()
            .collect())
    }

    async fn insert_readings(&self, readings: Vec<StoredReading>) -> EngineResult<Vec<StoredReading>> {
        // ---
        let mut tables = self.tables.lock().unwrap();

        let existing: HashSet<(String, DateTime<Utc>)> = tables
            .readings
            .iter()
            .filter_map(|r| r.device_id.clone().map(|d| (d, r.recorded_at)))
            .collect();

        let inserted: Vec<StoredReading> = readings
            .into_iter()
            .filter(|r| match &r.device_id {
                Some(d) => !existing.contains(&(d.clone(), r.recorded_at)),
                None => true,
            })
            .collect();

        for (unit_id, latest) in latest_per_unit(&inserted) {
            if let Some((unit, _)) = tables.units.get_mut(&unit_id) {
                if unit.last_reading_at.map_or(true, |at| at <= latest.recorded_at) {
                    unit.last_temperature = Some(latest.temperature_centi);
                    unit.last_reading_at = Some(latest.recorded_at);
                }
            }
        }

        tables.readings.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn query_readings(
        &self,
        organization_id: Uuid,
        unit_id: Option<Uuid>,
        range: TimeRange,
        page: Pagination,
    ) -> EngineResult<Vec<StoredReading>> {
        // ---
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<StoredReading> = tables
            .readings
            .iter()
            .filter(|r| unit_id.map_or(true, |u| r.unit_id == u))
            .filter(|r| {
                tables
                    .units
                    .get(&r.unit_id)
                    .is_some_and(|(u, _)| u.organization_id == organization_id)
            })
            .filter(|r| range.contains(r.recorded_at))
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn alarm_state(&self, unit_id: Uuid) -> EngineResult<Option<UnitAlarmState>> {
        Ok(self.tables.lock().unwrap().states.get(&unit_id).cloned())
    }

    async fn evaluate_unit(
        &self,
        unit_id: Uuid,
        now: DateTime<Utc>,
        decide: &DecideFn<'_>,
    ) -> EngineResult<AppliedEvaluation> {
        // ---
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let mut tables = self.tables.lock().unwrap();
        let previous = tables
            .states
            .get(&unit_id)
            .cloned()
            .unwrap_or_else(|| UnitAlarmState::initial(unit_id, now));
        let open_idx = tables
            .alerts
            .iter()
            .position(|a| a.unit_id == unit_id && a.status.is_open());

        let decision = decide(&previous, open_idx.map(|i| &tables.alerts[i]));
        if decision.stale {
            return Ok(AppliedEvaluation {
                state: previous.clone(),
                previous,
                alert: open_idx.map(|i| tables.alerts[i].clone()),
                alert_created: false,
                alert_escalated: false,
                stale: true,
            });
        }

        let mut state = decision.next;
        let mut alert_created = false;
        let mut alert_escalated = false;

        let alert = match decision.alert {
            AlertAction::Open(new_alert) => {
                let alert = new_alert.into_alert(Uuid::new_v4());
                state.current_alert_id = Some(alert.id);
                tables.alerts.push(alert.clone());
                alert_created = true;
                Some(alert)
            }
            AlertAction::Escalate { alert_id, severity } => {
                let existing = tables
                    .alerts
                    .iter_mut()
                    .find(|a| a.id == alert_id && a.status.is_open());
                match existing {
                    Some(a) => {
                        a.severity = severity;
                        alert_escalated = true;
                        Some(a.clone())
                    }
                    None => None,
                }
            }
            AlertAction::None => open_idx.map(|i| tables.alerts[i].clone()),
        };

        tables.states.insert(unit_id, state.clone());

        Ok(AppliedEvaluation {
            previous,
            state,
            alert,
            alert_created,
            alert_escalated,
            stale: false,
        })
    }

    async fn get_alert(&self, alert_id: Uuid) -> EngineResult<Option<Alert>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .alerts
            .iter()
            .find(|a| a.id == alert_id)
            .cloned())
    }

    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        notes: Option<String>,
        audit: AuditEntry,
    ) -> EngineResult<Option<AcknowledgeOutcome>> {
        // ---
        let mut tables = self.tables.lock().unwrap();
        let Some(alert) = tables.alerts.iter_mut().find(|a| a.id == alert_id) else {
            return Ok(None);
        };

        let outcome = match alert.status {
            AlertStatus::Acknowledged => AcknowledgeOutcome::AlreadyAcknowledged(alert.clone()),
            AlertStatus::Resolved => AcknowledgeOutcome::AlreadyResolved(alert.clone()),
            AlertStatus::Active => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(audit.at);
                alert.acknowledged_by = Some(user_id);
                if let Some(notes) = notes {
                    merge_metadata(&mut alert.metadata, "acknowledgement_notes", json!(notes));
                }
                let acknowledged = alert.clone();
                tables.audit_log.push(audit);
                AcknowledgeOutcome::Acknowledged(acknowledged)
            }
        };
        Ok(Some(outcome))
    }

    async fn resolve_alert(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        corrective_action: Option<CorrectiveActionInput>,
        audit: AuditEntry,
    ) -> EngineResult<Option<ResolveOutcome>> {
        // ---
        let mut tables = self.tables.lock().unwrap();
        let Some(alert) = tables.alerts.iter_mut().find(|a| a.id == alert_id) else {
            return Ok(None);
        };
        if alert.status == AlertStatus::Resolved {
            return Ok(Some(ResolveOutcome::AlreadyResolved(alert.clone())));
        }

        let at = audit.at;
        let action = corrective_action.map(|input| CorrectiveAction {
            id: Uuid::new_v4(),
            alert_id,
            unit_id: alert.unit_id,
            performed_by: user_id,
            description: input.description,
            action_taken: input.action_taken,
            action_at: input.action_at.unwrap_or(at),
        });

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(at);
        alert.resolved_by = Some(user_id);
        merge_metadata(
            &mut alert.metadata,
            "resolution",
            json!({ "corrective_action_id": action.as_ref().map(|a| a.id) }),
        );
        let resolved = alert.clone();

        let state = tables
            .states
            .entry(resolved.unit_id)
            .or_insert_with(|| UnitAlarmState::initial(resolved.unit_id, at));
        if owns_alarm_state(state, alert_id) {
            state.status = AlarmStatus::Ok;
            state.current_alert_id = None;
            state.entered_state_at = at;
        }

        if let Some(action) = &action {
            tables.corrective_actions.push(action.clone());
        }
        tables.audit_log.push(audit);

        Ok(Some(ResolveOutcome::Resolved {
            alert: resolved,
            corrective_action: action,
        }))
    }
}

fn merge_metadata(metadata: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if !metadata.is_object() {
        *metadata = json!({});
    }
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::emitter::RecordingEmitter;
    use crate::{AlertEvaluator, NewReading, ReadingSource};
    use chrono::{Duration, TimeZone};

    fn breach_at(unit_id: Uuid, second: i64) -> StoredReading {
        // ---
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        StoredReading::from_new(
            NewReading {
                unit_id,
                device_id: None,
                temperature_centi: 1200,
                humidity: None,
                battery_percent: None,
                signal_strength: None,
                recorded_at: base + Duration::seconds(second),
                source: ReadingSource::Sensor,
            },
            Utc::now(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluations_open_one_alert() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let org = store.add_organization(ThresholdConfig {
            min_temp: Some(0),
            max_temp: Some(500),
            confirm_seconds: Some(0),
            hysteresis_margin: Some(50),
        });
        let site = store.add_site(org, ThresholdConfig::default());
        let unit = store.add_unit(site, "walk-in", ThresholdConfig::default());

        let evaluator = AlertEvaluator::new(store.clone(), Arc::new(RecordingEmitter::default()), 300);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let evaluator = evaluator.clone();
                let reading = breach_at(unit, i * 10);
                tokio::spawn(async move { evaluator.evaluate(org, &reading).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(store.open_alert_count(unit), 1);
        let state = store.alarm_state(unit).await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::AlarmActive);
    }

    #[tokio::test]
    async fn test_duplicate_device_readings_are_skipped() {
        // ---
        let store = MemoryStore::new();
        let org = store.add_organization(ThresholdConfig::default());
        let site = store.add_site(org, ThresholdConfig::default());
        let unit = store.add_unit(site, "reach-in", ThresholdConfig::default());

        let mut first = breach_at(unit, 0);
        first.device_id = Some("A1B2".to_string());
        let mut again = first.clone();
        again.id = Uuid::new_v4();

        assert_eq!(store.insert_readings(vec![first]).await.unwrap().len(), 1);
        assert!(store.insert_readings(vec![again]).await.unwrap().is_empty());
        assert_eq!(store.reading_count(), 1);
    }
}
