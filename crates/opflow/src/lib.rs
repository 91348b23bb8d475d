//! Operation lifecycle tracking and loading-feedback escalation.
//!
//! This library tracks asynchronous operations initiated by a UI and
//! decides, purely from elapsed duration and hierarchical configuration,
//! how aggressively to surface feedback (nothing → inline indicator →
//! overlay → blocking modal). It provides:
//!
//! - **Manager**: the central registry and state machine — start, progress,
//!   complete/fail/cancel, duration-driven escalation timers, per-operation
//!   subscribers, and time-bounded cleanup ([`manager`])
//! - **Cancellation**: cooperative tokens forming an explicit tree; a
//!   parent's `cancel()` cascades to every descendant ([`token`])
//! - **Configuration**: three-tier threshold resolution — component >
//!   operation-type > global, coalesced per field ([`config`])
//! - **Throttling**: progress updates coalesced to at most one applied
//!   mutation per ~16.67ms window ([`progress`])
//! - **Bridge**: wire types for backend-originated operation events
//!   ([`bridge`])
//!
//! The manager never runs the tracked work itself: callers perform the
//! actual I/O or computation and report into the tracker through the handle
//! returned by [`OperationManager::start`]. Cancellation is cooperative —
//! signaling only.
//!
//! # Example
//!
//! ```rust,ignore
//! use opflow::{OperationManager, ProgressUpdate, StartOptions};
//!
//! let manager = OperationManager::new();
//! let handle = manager.start(StartOptions::new().operation_type("network"));
//!
//! let sub = manager.subscribe(handle.id(), |op| {
//!     println!("{} is {} at level {}", op.id, op.status, op.escalation_level);
//! });
//!
//! handle.update_progress(ProgressUpdate::percent(40.0).with_message("fetching"));
//! handle.complete(Some(serde_json::json!({ "rows": 128 })));
//! sub.unsubscribe();
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod manager;
pub mod operation;
pub mod progress;
pub mod token;

pub use bridge::{apply_bridge_event, BridgeEvent, BridgeProgress};
pub use config::{
    EscalationConfig, EscalationEntry, EscalationOverride, EscalationResolver, ResolverSnapshot,
};
pub use error::ConfigError;
pub use manager::{
    default_manager, reset_default_manager, OperationHandle, OperationManager, Subscription,
    DEFAULT_CLEANUP_MAX_AGE,
};
pub use operation::{
    AggregatedResult, ChildOutcome, EscalationLevel, Operation, OperationStatus, Progress,
    ProgressKind, ProgressUpdate, StartOptions,
};
pub use progress::{ProgressThrottle, ThrottleAction, DEFAULT_THROTTLE_INTERVAL};
pub use token::{CancellationToken, OnCancelHandle};
