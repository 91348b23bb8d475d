//! Operation state model: statuses, escalation levels, progress, and the
//! subscriber-visible snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::{EscalationEntry, EscalationOverride};

/// Lifecycle status of a tracked operation.
///
/// Operations are created already `Running`; the three terminal states admit
/// no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Whether this is a terminal status (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Feedback intensity tier, chosen purely by elapsed duration.
///
/// The derived ordering (`None < Inline < Overlay < Modal`) is load-bearing:
/// an operation's level only ever moves upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    Inline,
    Overlay,
    Modal,
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Inline => write!(f, "inline"),
            Self::Overlay => write!(f, "overlay"),
            Self::Modal => write!(f, "modal"),
        }
    }
}

/// Whether progress is a known fraction or just "busy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Indeterminate,
    Determinate,
}

/// Current progress of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub kind: ProgressKind,
    /// Percentage in `0.0..=100.0`; only meaningful for determinate progress.
    pub value: Option<f64>,
    pub message: Option<String>,
}

impl Progress {
    /// The initial progress of every new operation.
    pub fn indeterminate() -> Self {
        Self {
            kind: ProgressKind::Indeterminate,
            value: None,
            message: None,
        }
    }

    /// Apply a partial update: supplied fields overwrite, others retain
    /// their prior value. Values are clamped to `0..=100`.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(kind) = update.kind {
            self.kind = kind;
        }
        if let Some(value) = update.value {
            self.value = Some(value.clamp(0.0, 100.0));
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
    }
}

/// Field-wise partial of [`Progress`].
///
/// Rapid updates within one throttle window merge last-writer-wins per
/// field before being applied as a single mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressUpdate {
    pub kind: Option<ProgressKind>,
    pub value: Option<f64>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// A determinate percentage update.
    pub fn percent(value: f64) -> Self {
        Self {
            kind: Some(ProgressKind::Determinate),
            value: Some(value),
            message: None,
        }
    }

    /// A message-only update.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach a message to this update.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Merge a newer partial over this one; the newer update's defined
    /// fields win.
    pub fn merge(&mut self, newer: ProgressUpdate) {
        if newer.kind.is_some() {
            self.kind = newer.kind;
        }
        if newer.value.is_some() {
            self.value = newer.value;
        }
        if newer.message.is_some() {
            self.message = newer.message;
        }
    }
}

/// The subscriber-visible state of one tracked operation.
///
/// Subscribers receive a clone of this on every mutation. `started_at` is
/// monotonic and feeds timer/cleanup math; `started_at_utc` is the
/// wall-clock counterpart for logs and serialization.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub status: OperationStatus,
    pub escalation_level: EscalationLevel,
    pub progress: Progress,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    /// Set only on terminal transition to `Failed`.
    pub error: Option<String>,
    /// Set only on terminal transition to `Completed`. For operations with
    /// children this is the aggregated [`AggregatedResult`] shape.
    pub result: Option<Value>,
    pub parent_id: Option<String>,
    pub child_ids: Vec<String>,
    pub operation_type: Option<String>,
    pub component_id: Option<String>,
    /// Resolved configuration captured at start; later resolver changes do
    /// not retroactively affect a running operation.
    pub config: EscalationEntry,
}

impl Operation {
    /// Elapsed time since the operation started.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.started_at)
    }
}

/// Terminal outcome of a child operation, embedded in its parent's
/// aggregated result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildOutcome {
    pub id: String,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChildOutcome {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
        }
    }
}

/// The result shape stored on a completed parent: its own result plus a
/// summary of every child. Operations with no children store their own
/// result unwrapped instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub children: Vec<ChildOutcome>,
}

/// Options for starting a new operation.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Explicit id; generated (UUID v4) when absent.
    pub id: Option<String>,
    /// Scope key for per-operation-type configuration overrides.
    pub operation_type: Option<String>,
    /// Scope key for per-component configuration overrides.
    pub component_id: Option<String>,
    /// Parent operation: the child's token derives from the parent's, and
    /// cancelling the parent cascades here.
    pub parent_id: Option<String>,
    /// Extra partial configuration merged over the resolved entry, for this
    /// operation only.
    pub config: Option<EscalationOverride>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn operation_type(mut self, ty: impl Into<String>) -> Self {
        self.operation_type = Some(ty.into());
        self
    }

    pub fn component_id(mut self, id: impl Into<String>) -> Self {
        self.component_id = Some(id.into());
        self
    }

    pub fn parent_id(mut self, id: impl Into<String>) -> Self {
        self.parent_id = Some(id.into());
        self
    }

    pub fn config(mut self, config: crate::config::EscalationOverride) -> Self {
        self.config = Some(config);
        self
    }
}
