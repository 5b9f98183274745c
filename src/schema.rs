//! Database schema management for `coldchain-sentinel`.
//!
//! Ensures required tables, indexes and append-only guards exist before
//! serving requests. Applied once on startup from `main.rs` (EMBP: single
//! gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Tables whose rows may never be updated or deleted once written.
const APPEND_ONLY_TABLES: [&str; 3] = ["sensor_readings", "corrective_actions", "alert_audit_log"];

/// Create or update the database schema (idempotent).
///
/// Threshold columns are nullable on organizations, sites and units; a
/// null means "inherit from the next level up". Temperatures are stored in
/// hundredths of a degree Celsius.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Hierarchy: organization → site → unit, each carrying optional thresholds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id                UUID PRIMARY KEY,
            name              TEXT        NOT NULL,
            min_temp          INTEGER,
            max_temp          INTEGER,
            confirm_seconds   INTEGER CHECK (confirm_seconds >= 0),
            hysteresis_margin INTEGER CHECK (hysteresis_margin >= 0),
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sites (
            id                UUID PRIMARY KEY,
            organization_id   UUID        NOT NULL REFERENCES organizations (id),
            name              TEXT        NOT NULL,
            min_temp          INTEGER,
            max_temp          INTEGER,
            confirm_seconds   INTEGER CHECK (confirm_seconds >= 0),
            hysteresis_margin INTEGER CHECK (hysteresis_margin >= 0),
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS units (
            id                UUID PRIMARY KEY,
            site_id           UUID        NOT NULL REFERENCES sites (id),
            organization_id   UUID        NOT NULL REFERENCES organizations (id),
            name              TEXT        NOT NULL,
            min_temp          INTEGER,
            max_temp          INTEGER,
            confirm_seconds   INTEGER CHECK (confirm_seconds >= 0),
            hysteresis_margin INTEGER CHECK (hysteresis_margin >= 0),
            last_temperature  INTEGER,
            last_reading_at   TIMESTAMPTZ,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Append-only reading log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id              UUID PRIMARY KEY,
            unit_id         UUID        NOT NULL REFERENCES units (id),
            device_id       TEXT,
            temperature     INTEGER     NOT NULL,
            humidity        DOUBLE PRECISION CHECK (humidity BETWEEN 0 AND 100),
            battery_percent SMALLINT CHECK (battery_percent BETWEEN 0 AND 100),
            signal_strength INTEGER,
            recorded_at     TIMESTAMPTZ NOT NULL,
            received_at     TIMESTAMPTZ NOT NULL,
            source          TEXT        NOT NULL
                            CHECK (source IN ('sensor', 'manual', 'simulated'))
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_readings_unit_recorded
            ON sensor_readings (unit_id, recorded_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Redelivered device uplinks collapse onto the first copy
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_sensor_readings_device_recorded
            ON sensor_readings (device_id, recorded_at)
            WHERE device_id IS NOT NULL;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One state row per unit, locked for every evaluation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_alarm_state (
            unit_id           UUID PRIMARY KEY REFERENCES units (id),
            status            TEXT        NOT NULL
                              CHECK (status IN ('ok', 'excursion', 'alarm_active', 'restoring')),
            current_alert_id  UUID,
            entered_state_at  TIMESTAMPTZ NOT NULL,
            last_evaluated_at TIMESTAMPTZ,
            updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id              UUID PRIMARY KEY,
            unit_id         UUID        NOT NULL REFERENCES units (id),
            organization_id UUID        NOT NULL REFERENCES organizations (id),
            severity        TEXT        NOT NULL CHECK (severity IN ('warning', 'critical')),
            status          TEXT        NOT NULL
                            CHECK (status IN ('active', 'acknowledged', 'resolved')),
            triggered_at    TIMESTAMPTZ NOT NULL,
            acknowledged_at TIMESTAMPTZ,
            acknowledged_by UUID,
            resolved_at     TIMESTAMPTZ,
            resolved_by     UUID,
            metadata        JSONB       NOT NULL DEFAULT '{}'::jsonb
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // At most one open alert per unit
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_alerts_open_per_unit
            ON alerts (unit_id)
            WHERE status IN ('active', 'acknowledged');
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_organization
            ON alerts (organization_id, triggered_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corrective_actions (
            id           UUID PRIMARY KEY,
            alert_id     UUID        NOT NULL UNIQUE REFERENCES alerts (id),
            unit_id      UUID        NOT NULL REFERENCES units (id),
            performed_by UUID        NOT NULL,
            description  TEXT        NOT NULL,
            action_taken TEXT        NOT NULL,
            action_at    TIMESTAMPTZ NOT NULL,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_audit_log (
            id              BIGSERIAL PRIMARY KEY,
            alert_id        UUID        NOT NULL REFERENCES alerts (id),
            organization_id UUID        NOT NULL,
            actor           UUID        NOT NULL,
            action          TEXT        NOT NULL,
            details         JSONB       NOT NULL DEFAULT '{}'::jsonb,
            at              TIMESTAMPTZ NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION reject_append_only_mutation() RETURNS trigger AS $$
        BEGIN
            RAISE EXCEPTION '% is append-only', TG_TABLE_NAME;
        END;
        $$ LANGUAGE plpgsql;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    for table in APPEND_ONLY_TABLES {
        let trigger = format!("{table}_append_only");
        sqlx::query(&format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE TRIGGER {trigger} BEFORE UPDATE OR DELETE ON {table} \
             FOR EACH ROW EXECUTE FUNCTION reject_append_only_mutation()"
        ))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
