//! Reading ingestion pipeline.
//!
//! validate → filter to the organization's units → drop duplicate
//! deliveries → atomic insert (with unit cache refresh) → one evaluation
//! per touched unit using its latest reading → `reading` events.
//!
//! Once readings are committed nothing downstream can undo them: an
//! evaluation failure for one unit is logged and counted, and the other
//! units are still evaluated.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    emit_best_effort, latest_per_unit, validate_batch, validate_reading, AlertEvaluator,
    EngineError, EngineResult, EvaluationOutcome, IngestSummary, NewReading, Pagination,
    RawReading, ReadingSource, RealtimeEmitter, RealtimeEvent, SensorReading, Store,
    StoredReading, TimeRange,
};

// ---

pub const MAX_PAGE_SIZE: u32 = 1000;

/// Body of a manual temperature log entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManualReadingInput {
    // ---
    pub temperature: f64,
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Defaults to the time the entry is received.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualReadingOutcome {
    pub reading: SensorReading,
    /// `None` when evaluation failed; the reading is stored regardless.
    pub evaluation: Option<EvaluationOutcome>,
}

#[derive(Clone)]
pub struct ReadingIngestionPipeline {
    store: Arc<dyn Store>,
    evaluator: AlertEvaluator,
    emitter: Arc<dyn RealtimeEmitter>,
    max_batch_size: usize,
}

impl ReadingIngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        evaluator: AlertEvaluator,
        emitter: Arc<dyn RealtimeEmitter>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            evaluator,
            emitter,
            max_batch_size,
        }
    }

    /// Ingest a batch of raw readings for `organization_id`.
    pub async fn ingest_bulk_readings(
        &self,
        organization_id: Uuid,
        raw: &[RawReading],
    ) -> EngineResult<IngestSummary> {
        // ---
        if raw.is_empty() {
            debug!(organization_id = %organization_id, "Empty batch, nothing to ingest");
            return Ok(IngestSummary::default());
        }

        let received_at = Utc::now();
        let readings = validate_batch(raw, self.max_batch_size, received_at)?;
        self.persist_and_evaluate(organization_id, readings, received_at)
            .await
    }

    /// Scope, dedup, insert and evaluate a validated batch.
    async fn persist_and_evaluate(
        &self,
        organization_id: Uuid,
        readings: Vec<NewReading>,
        received_at: DateTime<Utc>,
    ) -> EngineResult<IngestSummary> {
        // ---
        let mut summary = IngestSummary::default();
        if readings.is_empty() {
            return Ok(summary);
        }

        let submitted = readings.len();
        let unit_ids: Vec<Uuid> = readings
            .iter()
            .map(|r| r.unit_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let owned = self
            .store
            .units_in_organization(organization_id, &unit_ids)
            .await?;

        let readings: Vec<NewReading> = readings
            .into_iter()
            .filter(|r| owned.contains(&r.unit_id))
            .collect();
        summary.filtered = submitted - readings.len();

        if readings.is_empty() {
            info!(
                organization_id = %organization_id,
                filtered = summary.filtered,
                "Batch rejected, no reading references a unit of the organization"
            );
            return Err(EngineError::NoValidUnits(organization_id));
        }

        let readings = dedup_deliveries(readings);
        let survivors = readings.len();

        let rows: Vec<StoredReading> = readings
            .into_iter()
            .map(|r| StoredReading::from_new(r, received_at))
            .collect();

        let inserted = self.store.insert_readings(rows).await?;
        summary.inserted = inserted.len();
        summary.duplicates = submitted - summary.filtered - inserted.len();

        info!(
            organization_id = %organization_id,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            filtered = summary.filtered,
            "Readings persisted"
        );
        debug!(
            in_batch_duplicates = submitted - summary.filtered - survivors,
            "Duplicate deliveries dropped before insert"
        );

        for (unit_id, latest) in latest_per_unit(&inserted) {
            summary.units_evaluated += 1;
            match self.evaluator.evaluate(organization_id, latest).await {
                Ok(outcome) => {
                    summary.alerts_triggered += usize::from(outcome.alert_created);
                    summary.alerts_escalated += usize::from(outcome.alert_escalated);
                }
                Err(e) => {
                    summary.evaluation_failures += 1;
                    error!(
                        organization_id = %organization_id,
                        unit_id = %unit_id,
                        "Alert evaluation failed, reading kept but unit not evaluated: {}",
                        e
                    );
                }
            }
        }

        for reading in &inserted {
            emit_best_effort(
                self.emitter.as_ref(),
                organization_id,
                RealtimeEvent::reading(reading),
            )
            .await;
        }

        Ok(summary)
    }

    /// Single-reading convenience path.
    pub async fn ingest_reading(
        &self,
        organization_id: Uuid,
        raw: RawReading,
    ) -> EngineResult<IngestSummary> {
        self.ingest_bulk_readings(organization_id, std::slice::from_ref(&raw))
            .await
    }

    /// Record a manually logged temperature for one unit and evaluate it.
    pub async fn create_manual_reading(
        &self,
        organization_id: Uuid,
        unit_id: Uuid,
        input: ManualReadingInput,
    ) -> EngineResult<ManualReadingOutcome> {
        // ---
        let received_at = Utc::now();
        let raw = RawReading {
            unit_id: unit_id.to_string(),
            device_id: None,
            temperature: input.temperature,
            humidity: input.humidity,
            battery_percent: None,
            signal_strength: None,
            recorded_at: input.recorded_at.unwrap_or(received_at).to_rfc3339(),
            source: ReadingSource::Manual.as_str().to_string(),
        };
        let reading = validate_reading(&raw, received_at).map_err(EngineError::Validation)?;

        self.require_unit(organization_id, unit_id).await?;

        let mut inserted = self
            .store
            .insert_readings(vec![StoredReading::from_new(reading, received_at)])
            .await?;
        let stored = inserted
            .pop()
            .ok_or_else(|| EngineError::Store(anyhow::anyhow!("manual reading was not inserted")))?;

        info!(organization_id = %organization_id, unit_id = %unit_id, "Manual reading recorded");

        let evaluation = match self.evaluator.evaluate(organization_id, &stored).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    organization_id = %organization_id,
                    unit_id = %unit_id,
                    "Alert evaluation failed for manual reading: {}",
                    e
                );
                None
            }
        };

        emit_best_effort(
            self.emitter.as_ref(),
            organization_id,
            RealtimeEvent::reading(&stored),
        )
        .await;

        Ok(ManualReadingOutcome {
            reading: SensorReading::from(&stored),
            evaluation,
        })
    }

    /// Readings of the organization, newest first, with temperatures back in
    /// decimal degrees. An empty range is an empty result, not an error.
    pub async fn query_readings(
        &self,
        organization_id: Uuid,
        unit_id: Option<Uuid>,
        range: TimeRange,
        page: Pagination,
    ) -> EngineResult<Vec<SensorReading>> {
        // ---
        if let Some(unit_id) = unit_id {
            self.require_unit(organization_id, unit_id).await?;
        }

        let page = Pagination {
            limit: page.limit.clamp(1, MAX_PAGE_SIZE),
            offset: page.offset,
        };

        let rows = self
            .store
            .query_readings(organization_id, unit_id, range, page)
            .await?;
        Ok(rows.iter().map(SensorReading::from).collect())
    }

    async fn require_unit(&self, organization_id: Uuid, unit_id: Uuid) -> EngineResult<()> {
        match self.store.get_unit(unit_id).await? {
            Some(unit) if unit.organization_id == organization_id => Ok(()),
            _ => Err(EngineError::unit_not_found(unit_id)),
        }
    }
}

/// Drop repeated deliveries of the same device event inside one batch.
/// Manual readings have no device id and are never considered duplicates.
fn dedup_deliveries(readings: Vec<NewReading>) -> Vec<NewReading> {
    // ---
    let mut seen = HashSet::new();
    readings
        .into_iter()
        .filter(|r| match &r.device_id {
            Some(device_id) => seen.insert((device_id.clone(), r.recorded_at)),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::emitter::{EventType, MockRealtimeEmitter, RecordingEmitter};
    use crate::store::memory::MemoryStore;
    use crate::{AlarmStatus, ThresholdConfig};
    use chrono::{Duration, TimeZone};
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        store: Arc<MemoryStore>,
        emitter: Arc<RecordingEmitter>,
        pipeline: ReadingIngestionPipeline,
        org: Uuid,
        site: Uuid,
    }

    fn t(offset_secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs)
    }

    fn fixture() -> Fixture {
        // ---
        let store = Arc::new(MemoryStore::new());
        let org = store.add_organization(ThresholdConfig {
            min_temp: Some(0),
            max_temp: Some(800),
            confirm_seconds: Some(600),
            hysteresis_margin: Some(100),
        });
        let site = store.add_site(org, ThresholdConfig::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let pipeline = pipeline_with(store.clone(), emitter.clone());

        Fixture {
            store,
            emitter,
            pipeline,
            org,
            site,
        }
    }

    fn pipeline_with(store: Arc<MemoryStore>, emitter: Arc<dyn RealtimeEmitter>) -> ReadingIngestionPipeline {
        let evaluator = AlertEvaluator::new(store.clone(), emitter.clone(), 300);
        ReadingIngestionPipeline::new(store, evaluator, emitter, 1000)
    }

    fn raw(unit: Uuid, temperature: f64, offset_secs: i64) -> RawReading {
        RawReading {
            unit_id: unit.to_string(),
            device_id: None,
            temperature,
            humidity: None,
            battery_percent: None,
            signal_strength: None,
            recorded_at: t(offset_secs).to_rfc3339(),
            source: "sensor".to_string(),
        }
    }

    fn from_device(mut r: RawReading, device: &str) -> RawReading {
        r.device_id = Some(device.to_string());
        r
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        // ---
        let f = fixture();
        let summary = f.pipeline.ingest_bulk_readings(f.org, &[]).await.unwrap();
        assert_eq!(summary, IngestSummary::default());
        assert!(f.emitter.events().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reading_rejects_whole_batch_before_writing() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());
        let mut bad = raw(unit, 4.0, 0);
        bad.battery_percent = Some(140.0);

        let err = f
            .pipeline
            .ingest_bulk_readings(f.org, &[raw(unit, 4.0, 0), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(f.store.reading_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_unit_is_dropped_and_alone_fails() {
        // ---
        let f = fixture();
        let mine = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());
        let other_org = f.store.add_organization(ThresholdConfig::default());
        let other_site = f.store.add_site(other_org, ThresholdConfig::default());
        let theirs = f.store.add_unit(other_site, "Freezer", ThresholdConfig::default());

        let err = f
            .pipeline
            .ingest_bulk_readings(f.org, &[raw(theirs, 4.0, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoValidUnits(org) if org == f.org));

        let summary = f
            .pipeline
            .ingest_bulk_readings(
                f.org,
                &[raw(theirs, 4.0, 0), raw(mine, 4.0, 0), raw(Uuid::new_v4(), 4.0, 0)],
            )
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.filtered, 2);
        assert_eq!(f.store.reading_count(), 1);
    }

    #[tokio::test]
    async fn test_latest_recorded_reading_drives_cache_and_evaluation() {
        // ---
        let f = fixture();
        let units: Vec<Uuid> = (0..5)
            .map(|i| f.store.add_unit(f.site, &format!("Unit {i}"), ThresholdConfig::default()))
            .collect();
        let unit_a = units[0];

        // Unit A needs confirm_seconds = 0 to alert on a single evaluation.
        f.store.set_unit_thresholds(
            unit_a,
            ThresholdConfig {
                confirm_seconds: Some(0),
                ..Default::default()
            },
        );

        let mut batch = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            for j in 0..10 {
                let offset = i64::from(j) * 60;
                let temp = if *unit == unit_a && j == 9 { 20.0 } else { 2.0 + i as f64 };
                batch.push(raw(*unit, temp, offset));
            }
        }
        // A's newest (breaching) reading goes first, its oldest (safe) one last.
        let newest = batch.iter().position(|r| r.temperature == 20.0).unwrap();
        let newest = batch.remove(newest);
        batch.insert(0, newest);
        let oldest = batch
            .iter()
            .position(|r| r.unit_id == unit_a.to_string() && r.recorded_at == t(0).to_rfc3339())
            .unwrap();
        let oldest = batch.remove(oldest);
        batch.push(oldest);
        assert_eq!(batch.len(), 50);

        let summary = f.pipeline.ingest_bulk_readings(f.org, &batch).await.unwrap();
        assert_eq!(summary.inserted, 50);
        assert_eq!(summary.units_evaluated, 5);
        assert_eq!(summary.alerts_triggered, 1);
        assert_eq!(summary.evaluation_failures, 0);

        let unit = f.store.unit(unit_a).unwrap();
        assert_eq!(unit.last_temperature, Some(2000));
        assert_eq!(unit.last_reading_at, Some(t(540)));

        let state = f.store.alarm_state(unit_a).await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::AlarmActive);

        for unit in &units[1..] {
            let state = f.store.alarm_state(*unit).await.unwrap().unwrap();
            assert_eq!(state.status, AlarmStatus::Ok);
        }

        assert_eq!(f.emitter.count(EventType::Reading), 50);
        assert_eq!(f.emitter.count(EventType::AlertStateChange), 1);
    }

    #[tokio::test]
    async fn test_confirm_time_across_calls() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());

        for (offset, expected) in [(0, 0), (300, 0), (650, 1)] {
            let summary = f
                .pipeline
                .ingest_reading(f.org, raw(unit, 9.0, offset))
                .await
                .unwrap();
            assert_eq!(summary.alerts_triggered, expected, "at t={offset}");
        }

        for offset in [700, 760, 820] {
            let summary = f
                .pipeline
                .ingest_reading(f.org, raw(unit, 9.5, offset))
                .await
                .unwrap();
            assert_eq!(summary.alerts_triggered, 0);
        }
        assert_eq!(f.store.open_alert_count(unit), 1);
    }

    #[tokio::test]
    async fn test_units_in_one_batch_are_independent() {
        // ---
        let f = fixture();
        let org = f.store.add_organization(ThresholdConfig::default());
        let site = f.store.add_site(org, ThresholdConfig::default());
        let u1 = f.store.add_unit(
            site,
            "Cooler",
            ThresholdConfig {
                min_temp: Some(0),
                max_temp: Some(800),
                confirm_seconds: Some(0),
                hysteresis_margin: Some(100),
            },
        );
        // Nothing configured at any level.
        let u2 = f.store.add_unit(site, "Unconfigured", ThresholdConfig::default());

        let summary = f
            .pipeline
            .ingest_bulk_readings(org, &[raw(u1, 12.0, 0), raw(u2, 12.0, 0)])
            .await
            .unwrap();

        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.units_evaluated, 2);
        assert_eq!(summary.alerts_triggered, 1);
        assert_eq!(summary.evaluation_failures, 1);
        assert_eq!(f.store.open_alert_count(u1), 1);
        assert_eq!(f.store.open_alert_count(u2), 0);
        assert_eq!(f.store.unit(u2).unwrap().last_temperature, Some(1200));
    }

    #[tokio::test]
    async fn test_duplicate_device_deliveries_are_skipped() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());
        let r = from_device(raw(unit, 4.0, 0), "A84041000181C85B");

        let summary = f
            .pipeline
            .ingest_bulk_readings(f.org, &[r.clone(), r.clone()])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.duplicates, 1);

        let summary = f.pipeline.ingest_reading(f.org, r).await.unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.units_evaluated, 0);
        assert_eq!(f.store.reading_count(), 1);
    }

    #[tokio::test]
    async fn test_emitter_failure_does_not_fail_ingestion() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());

        let mut mock = MockRealtimeEmitter::new();
        mock.expect_emit()
            .returning(|_, _| Err(anyhow::anyhow!("relay unavailable")));
        let pipeline = pipeline_with(f.store.clone(), Arc::new(mock));

        let summary = assert_ok!(pipeline.ingest_reading(f.org, raw(unit, 4.0, 0)).await);
        assert_eq!(summary.inserted, 1);
    }

    #[tokio::test]
    async fn test_manual_reading_is_evaluated_and_scoped() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(
            f.site,
            "Reach-in",
            ThresholdConfig {
                confirm_seconds: Some(0),
                ..Default::default()
            },
        );

        let outcome = f
            .pipeline
            .create_manual_reading(
                f.org,
                unit,
                ManualReadingInput {
                    temperature: 3.7,
                    humidity: None,
                    recorded_at: Some(t(0)),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.reading.temperature, 3.7);
        assert_eq!(outcome.reading.source, ReadingSource::Manual);
        assert_eq!(outcome.evaluation.unwrap().status, AlarmStatus::Ok);

        let outcome = f
            .pipeline
            .create_manual_reading(
                f.org,
                unit,
                ManualReadingInput {
                    temperature: 11.0,
                    humidity: None,
                    recorded_at: Some(t(60)),
                },
            )
            .await
            .unwrap();
        assert!(outcome.evaluation.unwrap().alert_created);

        let other_org = f.store.add_organization(ThresholdConfig::default());
        let err = assert_err!(
            f.pipeline
                .create_manual_reading(
                    other_org,
                    unit,
                    ManualReadingInput {
                        temperature: 4.0,
                        humidity: None,
                        recorded_at: None,
                    },
                )
                .await
        );
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_query_round_trips_and_scopes() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(f.site, "Cooler", ThresholdConfig::default());
        f.pipeline
            .ingest_bulk_readings(f.org, &[raw(unit, 3.7, 0), raw(unit, -1.25, 60)])
            .await
            .unwrap();

        let readings = f
            .pipeline
            .query_readings(f.org, Some(unit), TimeRange::default(), Pagination::default())
            .await
            .unwrap();
        let temps: Vec<f64> = readings.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![-1.25, 3.7]);

        let empty = f
            .pipeline
            .query_readings(
                f.org,
                Some(unit),
                TimeRange {
                    from: Some(t(3600)),
                    to: None,
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert!(empty.is_empty());

        let err = f
            .pipeline
            .query_readings(f.org, Some(Uuid::new_v4()), TimeRange::default(), Pagination::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let page = f
            .pipeline
            .query_readings(f.org, None, TimeRange::default(), Pagination { limit: 1, offset: 1 })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].temperature, 3.7);
    }

    #[tokio::test]
    async fn test_future_stamped_reading_cannot_freeze_the_unit() {
        // ---
        let f = fixture();
        let unit = f.store.add_unit(
            f.site,
            "Prep fridge",
            ThresholdConfig {
                confirm_seconds: Some(0),
                ..ThresholdConfig::default()
            },
        );

        let mut skewed = raw(unit, 4.0, 0);
        skewed.recorded_at = "2099-01-01T00:00:00Z".to_string();
        let err = assert_err!(f.pipeline.ingest_bulk_readings(f.org, &[skewed]).await);
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(f.store.reading_count(), 0);

        let manual = ManualReadingInput {
            temperature: 4.0,
            humidity: None,
            recorded_at: Some(Utc::now() + Duration::days(365)),
        };
        let err = assert_err!(f.pipeline.create_manual_reading(f.org, unit, manual).await);
        assert!(matches!(err, EngineError::Validation(_)));

        let mut breach = raw(unit, 20.0, 0);
        breach.recorded_at = (Utc::now() - Duration::seconds(5)).to_rfc3339();
        let summary = assert_ok!(f.pipeline.ingest_bulk_readings(f.org, &[breach]).await);
        assert_eq!(summary.alerts_triggered, 1);

        let state = f.store.alarm_state(unit).await.unwrap().unwrap();
        assert_eq!(state.status, AlarmStatus::AlarmActive);
        assert_eq!(f.store.unit(unit).unwrap().last_temperature, Some(2000));
    }
}
