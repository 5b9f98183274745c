//! Real-time event publishing.
//!
//! The engine only knows the [`RealtimeEmitter`] capability. Delivery is
//! best effort: a failed publish is logged and never fails the operation
//! that produced the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{Alert, AuditAction, EvaluationOutcome, SensorReading, StoredReading};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    #[serde(rename = "reading")]
    Reading,
    #[serde(rename = "alert.stateChange")]
    AlertStateChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Reading => "reading",
            EventType::AlertStateChange => "alert.stateChange",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEvent {
    // ---
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl RealtimeEvent {
    // ---
    pub fn reading(reading: &StoredReading) -> Self {
        RealtimeEvent {
            event_type: EventType::Reading,
            payload: json!(SensorReading::from(reading)),
            emitted_at: Utc::now(),
        }
    }

    pub fn alert_state_change(outcome: &EvaluationOutcome, alert: Option<&Alert>) -> Self {
        RealtimeEvent {
            event_type: EventType::AlertStateChange,
            payload: json!({
                "unit_id": outcome.unit_id,
                "from": outcome.previous_status,
                "to": outcome.status,
                "alert_created": outcome.alert_created,
                "alert_escalated": outcome.alert_escalated,
                "alert": alert,
            }),
            emitted_at: Utc::now(),
        }
    }

    /// Human transition on an alert (acknowledge / resolve).
    pub fn alert_lifecycle(alert: &Alert, action: AuditAction) -> Self {
        RealtimeEvent {
            event_type: EventType::AlertStateChange,
            payload: json!({
                "unit_id": alert.unit_id,
                "action": action,
                "alert": alert,
            }),
            emitted_at: Utc::now(),
        }
    }
}

/// Fire-and-forget publish to an organization-scoped channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealtimeEmitter: Send + Sync {
    async fn emit(&self, organization_id: Uuid, event: RealtimeEvent) -> anyhow::Result<()>;
}

/// Publish and swallow the error after logging it.
pub async fn emit_best_effort(emitter: &dyn RealtimeEmitter, organization_id: Uuid, event: RealtimeEvent) {
    // ---
    let event_type = event.event_type;
    if let Err(e) = emitter.emit(organization_id, event).await {
        warn!(
            organization_id = %organization_id,
            event_type = event_type.as_str(),
            "Realtime emit failed: {:#}",
            e
        );
    }
}

/// Emitter used when no realtime relay is configured: events only go to
/// the log.
#[derive(Debug, Default, Clone)]
pub struct LogEmitter;

#[async_trait]
impl RealtimeEmitter for LogEmitter {
    async fn emit(&self, organization_id: Uuid, event: RealtimeEvent) -> anyhow::Result<()> {
        debug!(
            organization_id = %organization_id,
            event_type = event.event_type.as_str(),
            payload = %event.payload,
            "Realtime event"
        );
        Ok(())
    }
}

/// Posts events to a realtime relay at `{base_url}/orgs/{organization_id}/events`.
#[derive(Debug, Clone)]
pub struct HttpEmitter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmitter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn channel_url(&self, organization_id: Uuid) -> String {
        format!("{}/orgs/{}/events", self.base_url, organization_id)
    }
}

#[async_trait]
impl RealtimeEmitter for HttpEmitter {
    async fn emit(&self, organization_id: Uuid, event: RealtimeEvent) -> anyhow::Result<()> {
        // ---
        let url = self.channel_url(organization_id);
        self.client
            .post(&url)
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Emitter that keeps every event in memory, for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: std::sync::Mutex<Vec<(Uuid, RealtimeEvent)>>,
}

#[cfg(test)]
impl RecordingEmitter {
    pub fn events(&self) -> Vec<(Uuid, RealtimeEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.event_type == event_type)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl RealtimeEmitter for RecordingEmitter {
    async fn emit(&self, organization_id: Uuid, event: RealtimeEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((organization_id, event));
        Ok(())
    }
}
