//! PostgreSQL implementation of [`Store`].
//!
//! Atomicity comes from the database: readings and unit caches are written
//! in one transaction, per-unit evaluation holds a row lock on
//! `unit_alarm_state`, and the partial unique index on open alerts turns a
//! lost creation race into a retried conflict instead of a second alert.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    latest_per_unit, owns_alarm_state, AcknowledgeOutcome, AppliedEvaluation, DecideFn,
    ResolveOutcome, Store,
};
use crate::{
    Alert, AlertAction, AlertStatus, AuditEntry, CorrectiveAction, CorrectiveActionInput,
    EngineError, EngineResult, Pagination, StoredReading, ThresholdChain, ThresholdConfig,
    TimeRange, Unit, UnitAlarmState,
};

// ---

const ALERT_COLUMNS: &str = "id, unit_id, organization_id, severity, status, triggered_at, \
     acknowledged_at, acknowledged_by, resolved_at, resolved_by, metadata";

const READING_COLUMNS: &str = "r.id, r.unit_id, r.device_id, r.temperature, r.humidity, \
     r.battery_percent, r.signal_strength, r.recorded_at, r.received_at, r.source";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    alert_create_retries: u32,
}

impl PgStore {
    pub fn new(pool: PgPool, alert_create_retries: u32) -> Self {
        Self {
            pool,
            alert_create_retries: alert_create_retries.max(1),
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn corrupt(what: &str, detail: String) -> EngineError {
    EngineError::Store(anyhow::anyhow!("corrupt {what} row: {detail}"))
}

// --- row types

#[derive(sqlx::FromRow)]
struct UnitRow {
    id: Uuid,
    organization_id: Uuid,
    site_id: Uuid,
    name: String,
    last_temperature: Option<i32>,
    last_reading_at: Option<DateTime<Utc>>,
}

impl From<UnitRow> for Unit {
    fn from(r: UnitRow) -> Self {
        Unit {
            id: r.id,
            organization_id: r.organization_id,
            site_id: r.site_id,
            name: r.name,
            last_temperature: r.last_temperature,
            last_reading_at: r.last_reading_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ThresholdChainRow {
    unit_id: Uuid,
    organization_id: Uuid,
    unit_min_temp: Option<i32>,
    unit_max_temp: Option<i32>,
    unit_confirm_seconds: Option<i32>,
    unit_hysteresis_margin: Option<i32>,
    site_min_temp: Option<i32>,
    site_max_temp: Option<i32>,
    site_confirm_seconds: Option<i32>,
    site_hysteresis_margin: Option<i32>,
    org_min_temp: Option<i32>,
    org_max_temp: Option<i32>,
    org_confirm_seconds: Option<i32>,
    org_hysteresis_margin: Option<i32>,
}

impl From<ThresholdChainRow> for ThresholdChain {
    fn from(r: ThresholdChainRow) -> Self {
        ThresholdChain {
            unit_id: r.unit_id,
            organization_id: r.organization_id,
            unit: ThresholdConfig {
                min_temp: r.unit_min_temp,
                max_temp: r.unit_max_temp,
                confirm_seconds: r.unit_confirm_seconds,
                hysteresis_margin: r.unit_hysteresis_margin,
            },
            site: ThresholdConfig {
                min_temp: r.site_min_temp,
                max_temp: r.site_max_temp,
                confirm_seconds: r.site_confirm_seconds,
                hysteresis_margin: r.site_hysteresis_margin,
            },
            organization: ThresholdConfig {
                min_temp: r.org_min_temp,
                max_temp: r.org_max_temp,
                confirm_seconds: r.org_confirm_seconds,
                hysteresis_margin: r.org_hysteresis_margin,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: Uuid,
    unit_id: Uuid,
    device_id: Option<String>,
    temperature: i32,
    humidity: Option<f64>,
    battery_percent: Option<i16>,
    signal_strength: Option<i32>,
    recorded_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    source: String,
}

impl TryFrom<ReadingRow> for StoredReading {
    type Error = EngineError;

    fn try_from(r: ReadingRow) -> Result<Self, Self::Error> {
        Ok(StoredReading {
            id: r.id,
            unit_id: r.unit_id,
            device_id: r.device_id,
            temperature_centi: r.temperature,
            humidity: r.humidity,
            battery_percent: r.battery_percent,
            signal_strength: r.signal_strength,
            recorded_at: r.recorded_at,
            received_at: r.received_at,
            source: r.source.parse().map_err(|e| corrupt("reading", e))?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    unit_id: Uuid,
    status: String,
    current_alert_id: Option<Uuid>,
    entered_state_at: DateTime<Utc>,
    last_evaluated_at: Option<DateTime<Utc>>,
}

impl TryFrom<StateRow> for UnitAlarmState {
    type Error = EngineError;

    fn try_from(r: StateRow) -> Result<Self, Self::Error> {
        Ok(UnitAlarmState {
            unit_id: r.unit_id,
            status: r.status.parse().map_err(|e| corrupt("unit_alarm_state", e))?,
            current_alert_id: r.current_alert_id,
            entered_state_at: r.entered_state_at,
            last_evaluated_at: r.last_evaluated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    unit_id: Uuid,
    organization_id: Uuid,
    severity: String,
    status: String,
    triggered_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_by: Option<Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<Uuid>,
    metadata: Value,
}

impl TryFrom<AlertRow> for Alert {
    type Error = EngineError;

    fn try_from(r: AlertRow) -> Result<Self, Self::Error> {
        Ok(Alert {
            id: r.id,
            unit_id: r.unit_id,
            organization_id: r.organization_id,
            severity: r.severity.parse().map_err(|e| corrupt("alert", e))?,
            status: r.status.parse().map_err(|e| corrupt("alert", e))?,
            triggered_at: r.triggered_at,
            acknowledged_at: r.acknowledged_at,
            acknowledged_by: r.acknowledged_by,
            resolved_at: r.resolved_at,
            resolved_by: r.resolved_by,
            metadata: r.metadata,
        })
    }
}

// --- helpers shared by several operations

async fn open_alert_for_unit(
    tx: &mut Transaction<'_, Postgres>,
    unit_id: Uuid,
) -> EngineResult<Option<Alert>> {
    let sql = format!(
        "SELECT {ALERT_COLUMNS} FROM alerts \
         WHERE unit_id = $1 AND status IN ('active', 'acknowledged') FOR UPDATE"
    );
    sqlx::query_as::<_, AlertRow>(&sql)
        .bind(unit_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(Alert::try_from)
        .transpose()
}

async fn alert_for_update(
    tx: &mut Transaction<'_, Postgres>,
    alert_id: Uuid,
) -> EngineResult<Option<Alert>> {
    let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, AlertRow>(&sql)
        .bind(alert_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(Alert::try_from)
        .transpose()
}

/// Lock (creating if needed) the alarm state row of a unit. Every writer of
/// alert or state rows for a unit takes this lock first.
async fn lock_alarm_state(
    tx: &mut Transaction<'_, Postgres>,
    unit_id: Uuid,
    now: DateTime<Utc>,
) -> EngineResult<UnitAlarmState> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO unit_alarm_state (unit_id, status, entered_state_at)
        VALUES ($1, 'ok', $2)
        ON CONFLICT (unit_id) DO NOTHING
        "#,
    )
    .bind(unit_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let row: StateRow = sqlx::query_as(
        r#"
        SELECT unit_id, status, current_alert_id, entered_state_at, last_evaluated_at
          FROM unit_alarm_state
         WHERE unit_id = $1
           FOR UPDATE
        "#,
    )
    .bind(unit_id)
    .fetch_one(&mut **tx)
    .await?;

    row.try_into()
}

async fn append_audit(tx: &mut Transaction<'_, Postgres>, audit: &AuditEntry) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO alert_audit_log (alert_id, organization_id, actor, action, details, at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(audit.alert_id)
    .bind(audit.organization_id)
    .bind(audit.actor)
    .bind(audit.action.as_str())
    .bind(&audit.details)
    .bind(audit.at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    // ---
    async fn get_unit(&self, unit_id: Uuid) -> EngineResult<Option<Unit>> {
        let row: Option<UnitRow> = sqlx::query_as(
            r#"
            SELECT id, organization_id, site_id, name, last_temperature, last_reading_at
              FROM units
             WHERE id = $1
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Unit::from))
    }

    async fn threshold_chain(&self, unit_id: Uuid) -> EngineResult<Option<ThresholdChain>> {
        // ---
        let row: Option<ThresholdChainRow> = sqlx::query_as(
            r#"
            SELECT u.id                AS unit_id,
                   u.organization_id   AS organization_id,
                   u.min_temp          AS unit_min_temp,
                   u.max_temp          AS unit_max_temp,
                   u.confirm_seconds   AS unit_confirm_seconds,
                   u.hysteresis_margin AS unit_hysteresis_margin,
                   s.min_temp          AS site_min_temp,
                   s.max_temp          AS site_max_temp,
                   s.confirm_seconds   AS site_confirm_seconds,
                   s.hysteresis_margin AS site_hysteresis_margin,
                   o.min_temp          AS org_min_temp,
                   o.max_temp          AS org_max_temp,
                   o.confirm_seconds   AS org_confirm_seconds,
                   o.hysteresis_margin AS org_hysteresis_margin
              FROM units u
              JOIN sites s         ON s.id = u.site_id
              JOIN organizations o ON o.id = u.organization_id
             WHERE u.id = $1
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ThresholdChain::from))
    }

    async fn units_in_organization(
        &self,
        organization_id: Uuid,
        unit_ids: &[Uuid],
    ) -> EngineResult<HashSet<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM units WHERE organization_id = $1 AND id = ANY($2)",
        )
        .bind(organization_id)
        .bind(unit_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn insert_readings(&self, readings: Vec<StoredReading>) -> EngineResult<Vec<StoredReading>> {
        // ---
        if readings.is_empty() {
            return Ok(readings);
        }

        let ids: Vec<Uuid> = readings.iter().map(|r| r.id).collect();
        let unit_ids: Vec<Uuid> = readings.iter().map(|r| r.unit_id).collect();
        let device_ids: Vec<Option<String>> = readings.iter().map(|r| r.device_id.clone()).collect();
        let temperatures: Vec<i32> = readings.iter().map(|r| r.temperature_centi).collect();
        let humidity: Vec<Option<f64>> = readings.iter().map(|r| r.humidity).collect();
        let battery: Vec<Option<i16>> = readings.iter().map(|r| r.battery_percent).collect();
        let signal: Vec<Option<i32>> = readings.iter().map(|r| r.signal_strength).collect();
        let recorded_at: Vec<DateTime<Utc>> = readings.iter().map(|r| r.recorded_at).collect();
        let received_at: Vec<DateTime<Utc>> = readings.iter().map(|r| r.received_at).collect();
        let sources: Vec<&str> = readings.iter().map(|r| r.source.as_str()).collect();

        let mut tx = self.pool.begin().await?;

        let inserted_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO sensor_readings (
                id, unit_id, device_id, temperature, humidity,
                battery_percent, signal_strength, recorded_at, received_at, source
            )
            SELECT * FROM UNNEST(
                $1::uuid[], $2::uuid[], $3::text[], $4::int4[], $5::float8[],
                $6::int2[], $7::int4[], $8::timestamptz[], $9::timestamptz[], $10::text[]
            )
            ON CONFLICT (device_id, recorded_at) WHERE device_id IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&ids)
        .bind(&unit_ids)
        .bind(&device_ids)
        .bind(&temperatures)
        .bind(&humidity)
        .bind(&battery)
        .bind(&signal)
        .bind(&recorded_at)
        .bind(&received_at)
        .bind(&sources)
        .fetch_all(&mut *tx)
        .await?;

        let inserted_ids: HashSet<Uuid> = inserted_ids.into_iter().collect();
        let inserted: Vec<StoredReading> = readings
            .into_iter()
            .filter(|r| inserted_ids.contains(&r.id))
            .collect();

        for (unit_id, latest) in latest_per_unit(&inserted) {
            sqlx::query(
                r#"
                UPDATE units
                   SET last_temperature = $2,
                       last_reading_at  = $3
                 WHERE id = $1
                   AND (last_reading_at IS NULL OR last_reading_at <= $3)
                "#,
            )
            .bind(unit_id)
            .bind(latest.temperature_centi)
            .bind(latest.recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(inserted = inserted.len(), "Reading batch committed");
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
        let sql = format!(
            r#"
            SELECT {READING_COLUMNS}
              FROM sensor_readings r
              JOIN units u ON u.id = r.unit_id
             WHERE u.organization_id = $1
               AND ($2::uuid IS NULL OR r.unit_id = $2)
               AND ($3::timestamptz IS NULL OR r.recorded_at >= $3)
               AND ($4::timestamptz IS NULL OR r.recorded_at <= $4)
             ORDER BY r.recorded_at DESC, r.id
             LIMIT $5 OFFSET $6
            "#
        );

        let rows: Vec<ReadingRow> = sqlx::query_as(&sql)
            .bind(organization_id)
            .bind(unit_id)
            .bind(range.from)
            .bind(range.to)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredReading::try_from).collect()
    }

    async fn alarm_state(&self, unit_id: Uuid) -> EngineResult<Option<UnitAlarmState>> {
        let row: Option<StateRow> = sqlx::query_as(
            r#"
            SELECT unit_id, status, current_alert_id, entered_state_at, last_evaluated_at
              FROM unit_alarm_state
             WHERE unit_id = $1
            "#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(UnitAlarmState::try_from).transpose()
    }

    async fn evaluate_unit(
        &self,
        unit_id: Uuid,
        now: DateTime<Utc>,
        decide: &DecideFn<'_>,
    ) -> EngineResult<AppliedEvaluation> {
        // ---
        for attempt in 1..=self.alert_create_retries {
            let mut tx = self.pool.begin().await?;

            let previous = lock_alarm_state(&mut tx, unit_id, now).await?;
            let open = open_alert_for_unit(&mut tx, unit_id).await?;

            let decision = decide(&previous, open.as_ref());
            if decision.stale {
                tx.rollback().await?;
                return Ok(AppliedEvaluation {
                    state: previous.clone(),
                    previous,
                    alert: open,
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
                    let id = Uuid::new_v4();
                    let result = sqlx::query(
                        r#"
                        INSERT INTO alerts (
                            id, unit_id, organization_id, severity, status, triggered_at, metadata
                        ) VALUES ($1, $2, $3, $4, 'active', $5, $6)
                        "#,
                    )
                    .bind(id)
                    .bind(new_alert.unit_id)
                    .bind(new_alert.organization_id)
                    .bind(new_alert.severity.as_str())
                    .bind(new_alert.triggered_at)
                    .bind(&new_alert.metadata)
                    .execute(&mut *tx)
                    .await;

                    match result {
                        Ok(_) => {}
                        Err(e) if is_unique_violation(&e) => {
                            warn!(
                                unit_id = %unit_id,
                                attempt,
                                "Open alert already exists for unit, retrying evaluation"
                            );
                            tx.rollback().await?;
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }

                    state.current_alert_id = Some(id);
                    alert_created = true;
                    Some(new_alert.into_alert(id))
                }

                AlertAction::Escalate { alert_id, severity } => {
                    let sql = format!(
                        "UPDATE alerts SET severity = $2 \
                         WHERE id = $1 AND status IN ('active', 'acknowledged') \
                         RETURNING {ALERT_COLUMNS}"
                    );
                    let row: Option<AlertRow> = sqlx::query_as(&sql)
                        .bind(alert_id)
                        .bind(severity.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                    alert_escalated = row.is_some();
                    row.map(Alert::try_from).transpose()?
                }

                AlertAction::None => open,
            };

            sqlx::query(
                r#"
                UPDATE unit_alarm_state
                   SET status            = $2,
                       current_alert_id  = $3,
                       entered_state_at  = $4,
                       last_evaluated_at = $5,
                       updated_at        = now()
                 WHERE unit_id = $1
                "#,
            )
            .bind(unit_id)
            .bind(state.status.as_str())
            .bind(state.current_alert_id)
            .bind(state.entered_state_at)
            .bind(state.last_evaluated_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            return Ok(AppliedEvaluation {
                previous,
                state,
                alert,
                alert_created,
                alert_escalated,
                stale: false,
            });
        }

        Err(EngineError::Conflict(format!(
            "alert creation for unit {unit_id} still conflicting after {} attempts",
            self.alert_create_retries
        )))
    }

    async fn get_alert(&self, alert_id: Uuid) -> EngineResult<Option<Alert>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = $1");
        sqlx::query_as::<_, AlertRow>(&sql)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Alert::try_from)
            .transpose()
    }

    async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        user_id: Uuid,
        notes: Option<String>,
        audit: AuditEntry,
    ) -> EngineResult<Option<AcknowledgeOutcome>> {
        // ---
        let mut tx = self.pool.begin().await?;

        let Some(current) = alert_for_update(&mut tx, alert_id).await? else {
            return Ok(None);
        };

        let outcome = match current.status {
            AlertStatus::Acknowledged => AcknowledgeOutcome::AlreadyAcknowledged(current),
            AlertStatus::Resolved => AcknowledgeOutcome::AlreadyResolved(current),
            AlertStatus::Active => {
                let sql = format!(
                    r#"
                    UPDATE alerts
                       SET status          = 'acknowledged',
                           acknowledged_at = $2,
                           acknowledged_by = $3,
                           metadata        = CASE WHEN $4::text IS NULL THEN metadata
                                                  ELSE metadata || jsonb_build_object('acknowledgement_notes', $4::text)
                                             END
                     WHERE id = $1
                 RETURNING {ALERT_COLUMNS}
                    "#
                );
                let row: AlertRow = sqlx::query_as(&sql)
                    .bind(alert_id)
                    .bind(audit.at)
                    .bind(user_id)
                    .bind(notes)
                    .fetch_one(&mut *tx)
                    .await?;
                append_audit(&mut tx, &audit).await?;
                AcknowledgeOutcome::Acknowledged(row.try_into()?)
            }
        };

        tx.commit().await?;
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
        let Some(snapshot) = self.get_alert(alert_id).await? else {
            return Ok(None);
        };
        if snapshot.status == AlertStatus::Resolved {
            return Ok(Some(ResolveOutcome::AlreadyResolved(snapshot)));
        }

        let at = audit.at;
        let mut tx = self.pool.begin().await?;

        // Same lock order as evaluation: unit state row, then alert row.
        let state = lock_alarm_state(&mut tx, snapshot.unit_id, at).await?;
        let Some(current) = alert_for_update(&mut tx, alert_id).await? else {
            return Ok(None);
        };
        if current.status == AlertStatus::Resolved {
            tx.rollback().await?;
            return Ok(Some(ResolveOutcome::AlreadyResolved(current)));
        }

        let action = corrective_action.map(|input| CorrectiveAction {
            id: Uuid::new_v4(),
            alert_id,
            unit_id: current.unit_id,
            performed_by: user_id,
            description: input.description,
            action_taken: input.action_taken,
            action_at: input.action_at.unwrap_or(at),
        });

        let sql = format!(
            r#"
            UPDATE alerts
               SET status      = 'resolved',
                   resolved_at = $2,
                   resolved_by = $3,
                   metadata    = metadata || jsonb_build_object(
                                     'resolution',
                                     jsonb_build_object('corrective_action_id', $4::uuid))
             WHERE id = $1
         RETURNING {ALERT_COLUMNS}
            "#
        );
        let row: AlertRow = sqlx::query_as(&sql)
            .bind(alert_id)
            .bind(at)
            .bind(user_id)
            .bind(action.as_ref().map(|a| a.id))
            .fetch_one(&mut *tx)
            .await?;

        if let Some(action) = &action {
            sqlx::query(
                r#"
                INSERT INTO corrective_actions (
                    id, alert_id, unit_id, performed_by, description, action_taken, action_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(action.id)
            .bind(action.alert_id)
            .bind(action.unit_id)
            .bind(action.performed_by)
            .bind(&action.description)
            .bind(&action.action_taken)
            .bind(action.action_at)
            .execute(&mut *tx)
            .await?;
        }

        if owns_alarm_state(&state, alert_id) {
            sqlx::query(
                r#"
                UPDATE unit_alarm_state
                   SET status           = 'ok',
                       current_alert_id = NULL,
                       entered_state_at = $2,
                       updated_at       = now()
                 WHERE unit_id = $1
                "#,
            )
            .bind(current.unit_id)
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        append_audit(&mut tx, &audit).await?;
        tx.commit().await?;

        Ok(Some(ResolveOutcome::Resolved {
            alert: row.try_into()?,
            corrective_action: action,
        }))
    }
}
