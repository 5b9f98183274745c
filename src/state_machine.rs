//! Per-unit alarm state machine.
//!
//! ```text
//!        breach                 breach held >= confirm
//!   ok ─────────► excursion ─────────────────────────► alarm_active
//!    ▲               │                                   │    ▲
//!    │  in range     │                  in safe band     │    │ breach
//!    └───────────────┘                                   ▼    │
//!    ▲                                               restoring ┘
//!    └─────────────────── still in safe band ───────────┘
//! ```
//!
//! Breaches are inclusive: a reading equal to `max` (or `min`) is out of
//! range. Recovery requires the hysteresis-adjusted band
//! `[min + margin, max - margin]`, so a reading hovering on a limit cannot
//! flap the unit between states.
//!
//! Elapsed time is measured on the readings' `recorded_at`, which keeps
//! backfilled batches and replays deterministic. Recovering to `ok` clears
//! the unit state only; the open alert stays until a human resolves it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    emit_best_effort, from_scaled, Alert, AlarmStatus, AppliedEvaluation, EffectiveThresholds,
    EngineResult, NewAlert, RealtimeEmitter, RealtimeEvent, Severity, Store, StoredReading,
    ThresholdResolver, UnitAlarmState,
};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachDirection {
    High,
    Low,
}

/// A reading outside `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach {
    pub direction: BreachDirection,
    /// The limit that was crossed (scaled).
    pub limit: i32,
    /// How far past the limit the reading is (scaled, >= 0).
    pub excess: i32,
}

/// Classify a temperature against the raw limits. Limits are inclusive.
pub fn breach_of(temperature: i32, t: &EffectiveThresholds) -> Option<Breach> {
    // ---
    if temperature >= t.max_temp {
        return Some(Breach {
            direction: BreachDirection::High,
            limit: t.max_temp,
            excess: temperature - t.max_temp,
        });
    }
    match t.min_temp {
        Some(min) if temperature <= min => Some(Breach {
            direction: BreachDirection::Low,
            limit: min,
            excess: min - temperature,
        }),
        _ => None,
    }
}

/// Whether a temperature is inside the hysteresis-adjusted recovery band.
pub fn within_safe_band(temperature: i32, t: &EffectiveThresholds) -> bool {
    // ---
    let below_high = temperature <= t.max_temp - t.hysteresis_margin;
    let above_low = t
        .min_temp
        .map_or(true, |min| temperature >= min + t.hysteresis_margin);
    below_high && above_low
}

/// Alert change requested by a [`Decision`].
#[derive(Debug, Clone, PartialEq)]
pub enum AlertAction {
    None,
    /// No open alert exists for the unit; open this one.
    Open(NewAlert),
    /// Raise the severity of the unit's open alert.
    Escalate { alert_id: Uuid, severity: Severity },
}

/// Outcome of running the state machine on one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub next: UnitAlarmState,
    pub alert: AlertAction,
    /// The reading predates the last evaluated one and was ignored.
    pub stale: bool,
}

/// Inputs that do not come from the unit's stored state.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput {
    pub organization_id: Uuid,
    pub temperature: i32,
    pub recorded_at: DateTime<Utc>,
    pub thresholds: EffectiveThresholds,
    /// Scaled distance past a limit at which an alert is critical.
    pub critical_delta: i32,
}

impl EvaluationInput {
    fn severity(&self, breach: &Breach) -> Severity {
        if breach.excess >= self.critical_delta {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }
}

/// Pure transition function.
pub fn decide(current: &UnitAlarmState, open_alert: Option<&Alert>, input: &EvaluationInput) -> Decision {
    // ---
    let at = input.recorded_at;

    if current.last_evaluated_at.is_some_and(|last| at < last) {
        return Decision {
            next: current.clone(),
            alert: AlertAction::None,
            stale: true,
        };
    }

    let mut next = current.clone();
    next.last_evaluated_at = Some(at);
    let mut alert = AlertAction::None;

    let breach = breach_of(input.temperature, &input.thresholds);
    let safe = within_safe_band(input.temperature, &input.thresholds);

    match (current.status, breach) {
        (AlarmStatus::Ok, None) => {}

        (AlarmStatus::Ok, Some(b)) => {
            enter(&mut next, AlarmStatus::Excursion, at);
            if input.thresholds.confirm_seconds == 0 {
                alert = raise(&mut next, open_alert, input, &b, at);
            }
        }

        (AlarmStatus::Excursion, None) => {
            enter(&mut next, AlarmStatus::Ok, at);
            next.current_alert_id = None;
        }

        (AlarmStatus::Excursion, Some(b)) => {
            let held = (at - current.entered_state_at).num_seconds();
            if held >= input.thresholds.confirm_seconds {
                alert = raise(&mut next, open_alert, input, &b, at);
            }
        }

        (AlarmStatus::AlarmActive, Some(b)) => {
            alert = sustain(&mut next, open_alert, input, &b, at);
        }

        (AlarmStatus::Restoring, Some(b)) => {
            enter(&mut next, AlarmStatus::AlarmActive, at);
            alert = sustain(&mut next, open_alert, input, &b, at);
        }

        (AlarmStatus::AlarmActive, None) => {
            if safe {
                enter(&mut next, AlarmStatus::Restoring, at);
            }
        }

        (AlarmStatus::Restoring, None) => {
            if safe {
                enter(&mut next, AlarmStatus::Ok, at);
                next.current_alert_id = None;
            }
        }
    }

    Decision {
        next,
        alert,
        stale: false,
    }
}

fn enter(state: &mut UnitAlarmState, status: AlarmStatus, at: DateTime<Utc>) {
    if state.status != status {
        state.status = status;
        state.entered_state_at = at;
    }
}

/// Excursion confirmed: move to `alarm_active` and make sure exactly one
/// open alert exists.
fn raise(
    next: &mut UnitAlarmState,
    open_alert: Option<&Alert>,
    input: &EvaluationInput,
    breach: &Breach,
    at: DateTime<Utc>,
) -> AlertAction {
    // ---
    let excursion_started_at = next.entered_state_at;
    enter(next, AlarmStatus::AlarmActive, at);

    match open_alert {
        Some(existing) => {
            next.current_alert_id = Some(existing.id);
            escalation(existing, input.severity(breach))
        }
        None => AlertAction::Open(NewAlert {
            unit_id: next.unit_id,
            organization_id: input.organization_id,
            severity: input.severity(breach),
            triggered_at: at,
            metadata: json!({
                "direction": breach.direction,
                "temperature": from_scaled(input.temperature),
                "limit": from_scaled(breach.limit),
                "confirm_seconds": input.thresholds.confirm_seconds,
                "excursion_started_at": excursion_started_at,
            }),
        }),
    }
}

/// Breach while already alarmed: never a second alert, at most an
/// escalation of the open one.
fn sustain(
    next: &mut UnitAlarmState,
    open_alert: Option<&Alert>,
    input: &EvaluationInput,
    breach: &Breach,
    at: DateTime<Utc>,
) -> AlertAction {
    match open_alert {
        Some(existing) => {
            next.current_alert_id = Some(existing.id);
            escalation(existing, input.severity(breach))
        }
        None => raise(next, None, input, breach, at),
    }
}

fn escalation(existing: &Alert, severity: Severity) -> AlertAction {
    if severity > existing.severity {
        AlertAction::Escalate {
            alert_id: existing.id,
            severity,
        }
    } else {
        AlertAction::None
    }
}

// ---

/// Result of evaluating one unit, as reported to the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationOutcome {
    // ---
    pub unit_id: Uuid,
    pub previous_status: AlarmStatus,
    pub status: AlarmStatus,
    pub alert_id: Option<Uuid>,
    pub alert_created: bool,
    pub alert_escalated: bool,
    pub stale: bool,
}

impl EvaluationOutcome {
    fn from_applied(applied: &AppliedEvaluation) -> Self {
        EvaluationOutcome {
            unit_id: applied.state.unit_id,
            previous_status: applied.previous.status,
            status: applied.state.status,
            alert_id: applied.alert.as_ref().map(|a| a.id),
            alert_created: applied.alert_created,
            alert_escalated: applied.alert_escalated,
            stale: applied.stale,
        }
    }

    pub fn changed(&self) -> bool {
        self.previous_status != self.status || self.alert_created || self.alert_escalated
    }
}

/// Resolves thresholds, runs [`decide`] atomically through the store and
/// publishes `alert.stateChange` events.
#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn Store>,
    resolver: ThresholdResolver,
    emitter: Arc<dyn RealtimeEmitter>,
    critical_delta: i32,
}

impl AlertEvaluator {
    pub fn new(
        store: Arc<dyn Store>,
        emitter: Arc<dyn RealtimeEmitter>,
        critical_delta: i32,
    ) -> Self {
        Self {
            resolver: ThresholdResolver::new(store.clone()),
            store,
            emitter,
            critical_delta,
        }
    }

    /// Evaluate `reading` for its unit.
    ///
    /// Fails with `NotFound` if the unit vanished and with
    /// `NoThresholdsConfigured` if nothing can be resolved; the reading
    /// itself is already persisted either way.
    pub async fn evaluate(
        &self,
        organization_id: Uuid,
        reading: &StoredReading,
    ) -> EngineResult<EvaluationOutcome> {
        // ---
        let unit_id = reading.unit_id;
        let thresholds = self.resolver.resolve_effective_thresholds(unit_id).await?;

        let input = EvaluationInput {
            organization_id,
            temperature: reading.temperature_centi,
            recorded_at: reading.recorded_at,
            thresholds,
            critical_delta: self.critical_delta,
        };

        let applied = self
            .store
            .evaluate_unit(
                unit_id,
                reading.recorded_at,
                &|state: &UnitAlarmState, open: Option<&Alert>| decide(state, open, &input),
            )
            .await?;

        let outcome = EvaluationOutcome::from_applied(&applied);

        if outcome.stale {
            debug!(unit_id = %unit_id, recorded_at = %reading.recorded_at, "Reading older than last evaluation, state unchanged");
            return Ok(outcome);
        }

        if outcome.alert_created {
            warn!(
                unit_id = %unit_id,
                alert_id = ?outcome.alert_id,
                temperature = from_scaled(reading.temperature_centi),
                "Temperature alarm triggered"
            );
        } else if outcome.alert_escalated {
            warn!(unit_id = %unit_id, alert_id = ?outcome.alert_id, "Temperature alarm escalated");
        }

        if outcome.changed() {
            info!(
                unit_id = %unit_id,
                from = %outcome.previous_status,
                to = %outcome.status,
                "Unit alarm state changed"
            );
            let event = RealtimeEvent::alert_state_change(&outcome, applied.alert.as_ref());
            emit_best_effort(self.emitter.as_ref(), organization_id, event).await;
        }

        Ok(outcome)
    }
}
