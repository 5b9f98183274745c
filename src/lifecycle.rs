//! Human-driven alert transitions: acknowledge and resolve.
//!
//! Alerts are only ever created by the state machine; this module moves
//! them forward. Every operation is scoped to the caller's organization and
//! a foreign alert is indistinguishable from a missing one.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    emit_best_effort, AcknowledgeOutcome, Alert, AuditAction, AuditEntry, CorrectiveAction,
    CorrectiveActionInput, EngineError, EngineResult, RealtimeEmitter, RealtimeEvent,
    ResolveOutcome, Store,
};

// ---

/// Result of an acknowledge call as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcknowledgeResult {
    pub alert: Alert,
    /// `false` when the alert had already been acknowledged.
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveResult {
    pub alert: Alert,
    pub corrective_action: Option<CorrectiveAction>,
    /// `false` when the alert had already been resolved.
    pub changed: bool,
}

#[derive(Clone)]
pub struct AlertLifecycleManager {
    store: Arc<dyn Store>,
    emitter: Arc<dyn RealtimeEmitter>,
}

impl AlertLifecycleManager {
    // ---
    pub fn new(store: Arc<dyn Store>, emitter: Arc<dyn RealtimeEmitter>) -> Self {
        Self { store, emitter }
    }

    /// Load an alert only if it belongs to `organization_id`.
    pub async fn verify_alert_access(&self, alert_id: Uuid, organization_id: Uuid) -> EngineResult<Alert> {
        match self.store.get_alert(alert_id).await? {
            Some(alert) if alert.organization_id == organization_id => Ok(alert),
            _ => Err(EngineError::alert_not_found(alert_id)),
        }
    }

    /// `active` → `acknowledged`. Acknowledging twice is a no-op reported
    /// through `changed`; acknowledging a resolved alert is a conflict.
    pub async fn acknowledge_alert(
        &self,
        organization_id: Uuid,
        alert_id: Uuid,
        user_id: Uuid,
        notes: Option<String>,
    ) -> EngineResult<AcknowledgeResult> {
        // ---
        self.verify_alert_access(alert_id, organization_id).await?;

        let audit = AuditEntry {
            alert_id,
            organization_id,
            actor: user_id,
            action: AuditAction::Acknowledged,
            details: json!({ "notes": notes }),
            at: Utc::now(),
        };

        let outcome = self
            .store
            .acknowledge_alert(alert_id, user_id, notes, audit)
            .await?
            .ok_or_else(|| EngineError::alert_not_found(alert_id))?;

        match outcome {
            AcknowledgeOutcome::Acknowledged(alert) => {
                info!(
                    target: "audit",
                    organization_id = %organization_id,
                    alert_id = %alert_id,
                    actor = %user_id,
                    action = AuditAction::Acknowledged.as_str(),
                    "Alert acknowledged"
                );
                let event = RealtimeEvent::alert_lifecycle(&alert, AuditAction::Acknowledged);
                emit_best_effort(self.emitter.as_ref(), organization_id, event).await;
                Ok(AcknowledgeResult { alert, changed: true })
            }
            AcknowledgeOutcome::AlreadyAcknowledged(alert) => {
                info!(alert_id = %alert_id, "Alert already acknowledged");
                Ok(AcknowledgeResult { alert, changed: false })
            }
            AcknowledgeOutcome::AlreadyResolved(_) => {
                warn!(alert_id = %alert_id, "Acknowledge rejected, alert already resolved");
                Err(EngineError::Conflict(format!("alert {alert_id} is already resolved")))
            }
        }
    }

    /// `active | acknowledged` → `resolved`, optionally recording a
    /// corrective action, and reset the unit to `ok`. Resolving again
    /// returns the terminal alert unchanged.
    pub async fn resolve_alert(
        &self,
        organization_id: Uuid,
        alert_id: Uuid,
        user_id: Uuid,
        corrective_action: Option<CorrectiveActionInput>,
    ) -> EngineResult<ResolveResult> {
        // ---
        self.verify_alert_access(alert_id, organization_id).await?;

        if let Some(action) = &corrective_action {
            if action.description.trim().is_empty() || action.action_taken.trim().is_empty() {
                return Err(EngineError::Validation(
                    "corrective action needs a description and the action taken".to_string(),
                ));
            }
        }

        let audit = AuditEntry {
            alert_id,
            organization_id,
            actor: user_id,
            action: AuditAction::Resolved,
            details: json!({ "corrective_action": corrective_action }),
            at: Utc::now(),
        };

        let outcome = self
            .store
            .resolve_alert(alert_id, user_id, corrective_action, audit)
            .await?
            .ok_or_else(|| EngineError::alert_not_found(alert_id))?;

        match outcome {
            ResolveOutcome::Resolved { alert, corrective_action } => {
                info!(
                    target: "audit",
                    organization_id = %organization_id,
                    alert_id = %alert_id,
                    actor = %user_id,
                    action = AuditAction::Resolved.as_str(),
                    corrective_action_id = ?corrective_action.as_ref().map(|a| a.id),
                    "Alert resolved"
                );
                let event = RealtimeEvent::alert_lifecycle(&alert, AuditAction::Resolved);
                emit_best_effort(self.emitter.as_ref(), organization_id, event).await;
                Ok(ResolveResult {
                    alert,
                    corrective_action,
                    changed: true,
                })
            }
            ResolveOutcome::AlreadyResolved(alert) => {
                info!(alert_id = %alert_id, "Alert already resolved");
                Ok(ResolveResult {
                    alert,
                    corrective_action: None,
                    changed: false,
                })
            }
        }
    }
}
