//! Wire types for backend-originated operation events.
//!
//! The native bridge process itself lives elsewhere; this module only fixes
//! the event shape it emits and maps each event onto the manager's public
//! API. Field names stay camelCase on the wire to match the backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::manager::OperationManager;
use crate::operation::{ProgressKind, ProgressUpdate};

/// A backend-originated event for one tracked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    Progress {
        operation_id: String,
        progress: BridgeProgress,
    },
    Complete {
        operation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Error {
        operation_id: String,
        error: String,
    },
    Cancelled {
        operation_id: String,
    },
}

impl BridgeEvent {
    /// The operation this event targets.
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Progress { operation_id, .. }
            | Self::Complete { operation_id, .. }
            | Self::Error { operation_id, .. }
            | Self::Cancelled { operation_id } => operation_id,
        }
    }
}

/// Count-based progress as the backend reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeProgress {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BridgeProgress {
    /// Convert to a partial progress update. A zero `total` yields an
    /// indeterminate update (the backend does not know the extent yet).
    pub fn to_update(&self) -> ProgressUpdate {
        let mut update = if self.total == 0 {
            ProgressUpdate {
                kind: Some(ProgressKind::Indeterminate),
                ..Default::default()
            }
        } else {
            ProgressUpdate::percent(self.current as f64 / self.total as f64 * 100.0)
        };
        update.message = self.message.clone();
        update
    }
}

/// Route a backend event onto the manager.
pub fn apply_bridge_event(manager: &OperationManager, event: BridgeEvent) {
    debug!(operation_id = %event.operation_id(), "applying bridge event");
    match event {
        BridgeEvent::Progress {
            operation_id,
            progress,
        } => manager.update_progress(&operation_id, progress.to_update()),
        BridgeEvent::Complete {
            operation_id,
            result,
        } => manager.complete(&operation_id, result),
        BridgeEvent::Error {
            operation_id,
            error,
        } => manager.fail(&operation_id, error),
        BridgeEvent::Cancelled { operation_id } => manager.cancel(&operation_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_wire_shape() {
        let json = r#"{
            "type": "progress",
            "operationId": "op-9",
            "progress": { "current": 3, "total": 12, "message": "indexing" }
        }"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();

        match &event {
            BridgeEvent::Progress {
                operation_id,
                progress,
            } => {
                assert_eq!(operation_id, "op-9");
                assert_eq!(progress.current, 3);
                assert_eq!(progress.message.as_deref(), Some("indexing"));
            }
            other => panic!("expected progress event, got {other:?}"),
        }

        let round = serde_json::to_value(&event).unwrap();
        assert_eq!(round["type"], "progress");
        assert_eq!(round["operationId"], "op-9");
    }

    #[test]
    fn test_progress_maps_to_percentage() {
        let progress = BridgeProgress {
            current: 3,
            total: 12,
            message: None,
        };
        let update = progress.to_update();
        assert_eq!(update.kind, Some(ProgressKind::Determinate));
        assert_eq!(update.value, Some(25.0));
    }

    #[test]
    fn test_zero_total_is_indeterminate() {
        let progress = BridgeProgress {
            current: 5,
            total: 0,
            message: Some("scanning".into()),
        };
        let update = progress.to_update();
        assert_eq!(update.kind, Some(ProgressKind::Indeterminate));
        assert_eq!(update.value, None);
        assert_eq!(update.message.as_deref(), Some("scanning"));
    }

    #[test]
    fn test_error_event_shape() {
        let json = r#"{ "type": "error", "operationId": "op-2", "error": "backend crashed" }"#;
        let event: BridgeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            BridgeEvent::Error {
                operation_id: "op-2".into(),
                error: "backend crashed".into(),
            }
        );
    }
}
