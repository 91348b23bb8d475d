//! The operation manager: registry, state machine, escalation timers,
//! progress throttling, and cancellation cascade.
//!
//! One [`OperationManager`] owns all of its maps — there is no ambient
//! singleton. A process-wide default instance exists only as a convenience
//! factory ([`default_manager`]) with explicit reset support for tests.
//!
//! # Concurrency
//!
//! All registry mutation happens under a single mutex, so state transitions
//! are sequentially consistent in a multi-threaded host. Subscriber and
//! cancellation callbacks run on the caller's stack *after* the lock is
//! released: per-operation notifications stay synchronous and ordered, and
//! callbacks are free to call back into the manager.
//!
//! All waiting is expressed as spawned sleep tasks (escalation thresholds,
//! the optional timeout, throttle flushes); the manager itself never blocks.
//! Methods that arm timers must be called from within a Tokio runtime.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EscalationEntry, EscalationOverride, EscalationResolver, ResolverSnapshot};
use crate::error::ConfigError;
use crate::operation::{
    AggregatedResult, ChildOutcome, EscalationLevel, Operation, OperationStatus, Progress,
    ProgressKind, ProgressUpdate, StartOptions,
};
use crate::progress::{ProgressThrottle, ThrottleAction, DEFAULT_THROTTLE_INTERVAL};
use crate::token::CancellationToken;

/// Default age bound for [`OperationManager::cleanup`].
pub const DEFAULT_CLEANUP_MAX_AGE: Duration = Duration::from_millis(5000);

type SubscriberFn = Arc<dyn Fn(&Operation) + Send + Sync>;

struct ThrottleLane {
    throttle: ProgressThrottle,
    flush: Option<JoinHandle<()>>,
}

/// Registry maps, all keyed by operation id. Entries are created on start,
/// mutated in place, and removed only by `cleanup`.
#[derive(Default)]
struct Registry {
    operations: HashMap<String, Operation>,
    timers: HashMap<String, Vec<JoinHandle<()>>>,
    throttles: HashMap<String, ThrottleLane>,
    subscribers: HashMap<String, Vec<(u64, SubscriberFn)>>,
    tokens: HashMap<String, CancellationToken>,
    resolver: EscalationResolver,
    next_subscriber_id: u64,
}

struct Shared {
    registry: Mutex<Registry>,
    throttle_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Callbacks run outside the lock, so poisoning is theoretical;
        // recover rather than propagate.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Tracks the lifecycle of asynchronous operations and decides, from elapsed
/// duration and resolved configuration, how aggressively the UI should
/// surface feedback.
///
/// The manager never executes the tracked work: callers perform it and
/// report `update_progress`/`complete`/`fail` through the returned
/// [`OperationHandle`].
#[derive(Clone)]
pub struct OperationManager {
    shared: Arc<Shared>,
}

impl OperationManager {
    pub fn new() -> Self {
        Self::with_throttle_interval(DEFAULT_THROTTLE_INTERVAL)
    }

    /// Create a manager with a custom progress-throttle cadence (tests).
    pub fn with_throttle_interval(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                throttle_interval: interval,
            }),
        }
    }

    /// Start tracking a new operation.
    ///
    /// The operation begins `Running` at escalation level `None` with
    /// indeterminate progress. If `parent_id` names a live operation, the
    /// new operation's token derives from the parent's and the parent's
    /// `child_ids` view is updated (notifying the parent's subscribers).
    pub fn start(&self, options: StartOptions) -> OperationHandle {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut parent_to_notify = None;
        let token;
        {
            let mut reg = self.shared.lock();

            let mut entry = reg
                .resolver
                .resolve(options.operation_type.as_deref(), options.component_id.as_deref());
            if let Some(partial) = &options.config {
                partial.merge_into(&mut entry);
            }

            token = match options
                .parent_id
                .as_deref()
                .and_then(|pid| reg.tokens.get(pid))
            {
                Some(parent_token) => parent_token.child_token(),
                None => CancellationToken::new(),
            };

            if let Some(pid) = options.parent_id.as_deref() {
                if let Some(parent) = reg.operations.get_mut(pid) {
                    parent.child_ids.push(id.clone());
                    parent_to_notify = Some(pid.to_string());
                }
            }

            let now = Instant::now();
            reg.operations.insert(
                id.clone(),
                Operation {
                    id: id.clone(),
                    status: OperationStatus::Running,
                    escalation_level: EscalationLevel::None,
                    progress: Progress::indeterminate(),
                    started_at: now,
                    started_at_utc: Utc::now(),
                    error: None,
                    result: None,
                    parent_id: options.parent_id.clone(),
                    child_ids: Vec::new(),
                    operation_type: options.operation_type.clone(),
                    component_id: options.component_id.clone(),
                    config: entry,
                },
            );
            reg.tokens.insert(id.clone(), token.clone());
            reg.throttles.insert(
                id.clone(),
                ThrottleLane {
                    throttle: ProgressThrottle::new(self.shared.throttle_interval, now),
                    flush: None,
                },
            );

            // Nested rule: a child whose parent already carries armed timers
            // inherits the parent's visible cadence and arms nothing.
            let inherits_cadence = options
                .parent_id
                .as_deref()
                .and_then(|pid| reg.timers.get(pid))
                .map(|handles| !handles.is_empty())
                .unwrap_or(false);
            let handles = if inherits_cadence {
                Vec::new()
            } else {
                arm_timers(&self.shared, &id, &entry, now)
            };
            reg.timers.insert(id.clone(), handles);

            debug!(
                operation_id = %id,
                parent_id = options.parent_id.as_deref().unwrap_or(""),
                inherits_cadence,
                "operation started"
            );
        }

        if let Some(pid) = parent_to_notify {
            notify(&self.shared, &pid);
        }
        notify(&self.shared, &id);

        OperationHandle {
            id,
            token,
            manager: self.clone(),
        }
    }

    /// Snapshot of one operation's current state.
    pub fn get(&self, id: &str) -> Option<Operation> {
        self.shared.lock().operations.get(id).cloned()
    }

    /// Number of tracked operations (running and terminal, pre-cleanup).
    pub fn len(&self) -> usize {
        self.shared.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().operations.is_empty()
    }

    /// Number of operations still running.
    pub fn running_count(&self) -> usize {
        self.shared
            .lock()
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Running)
            .count()
    }

    /// Apply a partial progress update, throttled to the manager's cadence.
    ///
    /// Updates arriving within one throttle window are merged field-wise and
    /// applied as a single mutation when the window reopens. No-op unless
    /// the operation is running.
    pub fn update_progress(&self, id: &str, update: ProgressUpdate) {
        update_progress_inner(&self.shared, id, update);
    }

    /// Transition to `Completed`. No-op unless the operation is running.
    ///
    /// A parent's stored result aggregates its children's terminal
    /// `{id, status, result, error}` tuples; childless operations store
    /// `result` unwrapped. Progress snaps to determinate 100%.
    pub fn complete(&self, id: &str, result: Option<Value>) {
        complete_inner(&self.shared, id, result);
    }

    /// Transition to `Failed` with `error`. No-op unless running.
    pub fn fail(&self, id: &str, error: impl Into<String>) {
        fail_inner(&self.shared, id, error.into());
    }

    /// Cancel an operation and, transitively, every descendant.
    ///
    /// The operation's token is cancelled first (the cooperative signal
    /// cascades through derived tokens), then tracked state flips to
    /// `Cancelled` and every listed child is cancelled in turn — so a
    /// descendant that never inspects its token still ends up `Cancelled`.
    pub fn cancel(&self, id: &str) {
        cancel_inner(&self.shared, id);
    }

    /// Register a callback invoked synchronously on every state mutation of
    /// `id`, in subscription order.
    ///
    /// The callback is invoked immediately with the current snapshot, so
    /// late subscribers never miss the present state. A panicking callback
    /// is isolated and logged; delivery to the others continues.
    pub fn subscribe(
        &self,
        id: &str,
        callback: impl Fn(&Operation) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: SubscriberFn = Arc::new(callback);
        let (snapshot, subscriber_id) = {
            let mut reg = self.shared.lock();
            let subscriber_id = reg.next_subscriber_id;
            reg.next_subscriber_id += 1;
            reg.subscribers
                .entry(id.to_string())
                .or_default()
                .push((subscriber_id, Arc::clone(&callback)));
            (reg.operations.get(id).cloned(), subscriber_id)
        };
        if let Some(snapshot) = &snapshot {
            invoke_subscriber(&callback, subscriber_id, snapshot);
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            operation_id: id.to_string(),
            subscriber_id,
        }
    }

    /// Remove terminal operations older than `max_age`, releasing every
    /// associated map entry. This is the only reclamation path; a
    /// long-running process must call it periodically.
    ///
    /// Returns the number of operations removed. See
    /// [`DEFAULT_CLEANUP_MAX_AGE`].
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut reg = self.shared.lock();
        let stale: Vec<String> = reg
            .operations
            .values()
            .filter(|op| op.status.is_terminal() && op.age(now) > max_age)
            .map(|op| op.id.clone())
            .collect();
        for id in &stale {
            reg.operations.remove(id);
            reg.subscribers.remove(id);
            teardown_locked(&mut reg, id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "cleanup swept stale operations");
        }
        stale.len()
    }

    // --- configuration pass-throughs -------------------------------------

    /// Merge a partial into the global escalation configuration; rejects a
    /// merge that violates the threshold ordering without mutating state.
    ///
    /// Running operations keep the configuration captured at their start.
    pub fn set_global_config(&self, partial: EscalationOverride) -> Result<(), ConfigError> {
        self.shared.lock().resolver.set_global(partial)
    }

    /// Store a per-operation-type override (unvalidated until resolved).
    pub fn set_operation_type_config(
        &self,
        operation_type: impl Into<String>,
        partial: EscalationOverride,
    ) {
        self.shared
            .lock()
            .resolver
            .set_operation_type(operation_type, partial);
    }

    /// Store a per-component override (unvalidated until resolved).
    pub fn set_component_config(&self, component_id: impl Into<String>, partial: EscalationOverride) {
        self.shared.lock().resolver.set_component(component_id, partial);
    }

    /// Resolve the configuration for an (operation type, component) pair:
    /// component > operation-type > global, coalesced per field.
    pub fn resolve_config(
        &self,
        operation_type: Option<&str>,
        component_id: Option<&str>,
    ) -> EscalationEntry {
        self.shared.lock().resolver.resolve(operation_type, component_id)
    }

    /// Export the three-layer configuration for persistence.
    pub fn export_config(&self) -> ResolverSnapshot {
        self.shared.lock().resolver.export()
    }

    /// Import a three-layer configuration; the global layer is re-validated.
    pub fn import_config(&self, snapshot: ResolverSnapshot) -> Result<(), ConfigError> {
        self.shared.lock().resolver.import(snapshot)
    }
}

impl Default for OperationManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`OperationManager::start`]: the operation id, its
/// cancellation token, and bound lifecycle methods.
#[derive(Clone)]
pub struct OperationHandle {
    id: String,
    token: CancellationToken,
    manager: OperationManager,
}

impl OperationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The cooperative cancellation token for this operation. The work
    /// being tracked should poll it or register a callback.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn update_progress(&self, update: ProgressUpdate) {
        self.manager.update_progress(&self.id, update);
    }

    pub fn complete(&self, result: Option<Value>) {
        self.manager.complete(&self.id, result);
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.manager.fail(&self.id, error);
    }

    pub fn cancel(&self) {
        self.manager.cancel(&self.id);
    }

    /// Current snapshot, if not yet swept by cleanup.
    pub fn state(&self) -> Option<Operation> {
        self.manager.get(&self.id)
    }
}

/// Handle returned by [`OperationManager::subscribe`].
pub struct Subscription {
    shared: Weak<Shared>,
    operation_id: String,
    subscriber_id: u64,
}

impl Subscription {
    /// Stop receiving notifications.
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut reg = shared.lock();
        if let Some(subs) = reg.subscribers.get_mut(&self.operation_id) {
            subs.retain(|(id, _)| *id != self.subscriber_id);
        }
    }
}

// --- internal transitions (free functions so timer tasks can run them
// through a Weak<Shared> without keeping the manager alive) --------------

fn arm_timers(
    shared: &Arc<Shared>,
    id: &str,
    entry: &EscalationEntry,
    armed_at: Instant,
) -> Vec<JoinHandle<()>> {
    let levels = [
        (
            entry.inline_enabled,
            entry.config.inline_threshold_ms,
            EscalationLevel::Inline,
        ),
        (
            entry.overlay_enabled,
            entry.config.overlay_threshold_ms,
            EscalationLevel::Overlay,
        ),
        (
            entry.modal_enabled,
            entry.config.modal_threshold_ms,
            EscalationLevel::Modal,
        ),
    ];

    let mut handles = Vec::new();
    for (enabled, threshold_ms, level) in levels {
        if !enabled {
            continue;
        }
        // Deadline fixed at arm time so a late first poll cannot skew it.
        let deadline = armed_at + Duration::from_millis(threshold_ms);
        let weak = Arc::downgrade(shared);
        let id = id.to_string();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                escalate(&shared, &id, level);
            }
        }));
    }

    if let Some(timeout_ms) = entry.config.timeout_ms {
        let deadline = armed_at + Duration::from_millis(timeout_ms);
        let weak = Arc::downgrade(shared);
        let id = id.to_string();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                fail_inner(&shared, &id, format!("Operation timed out after {timeout_ms}ms"));
            }
        }));
    }

    handles
}

/// Advance `id` to `level` if it is still running and `level` is strictly
/// higher than its current level. Duplicate or out-of-order timer firing
/// never regresses the level.
fn escalate(shared: &Arc<Shared>, id: &str, level: EscalationLevel) {
    {
        let mut reg = shared.lock();
        let Some(op) = reg.operations.get_mut(id) else {
            return;
        };
        if op.status != OperationStatus::Running || level <= op.escalation_level {
            return;
        }
        op.escalation_level = level;
        debug!(operation_id = %id, level = %level, "operation escalated");
    }
    notify(shared, id);
}

fn update_progress_inner(shared: &Arc<Shared>, id: &str, update: ProgressUpdate) {
    let mut applied = false;
    let mut schedule_at = None;
    {
        let mut reg = shared.lock();
        match reg.operations.get(id) {
            Some(op) if op.status == OperationStatus::Running => {}
            _ => return,
        }
        let now = Instant::now();
        let action = match reg.throttles.get_mut(id) {
            Some(lane) => {
                let action = lane.throttle.submit(now, update);
                if matches!(action, ThrottleAction::Apply(_)) {
                    // The merge we are about to apply subsumes any deferred
                    // flush still in flight.
                    if let Some(handle) = lane.flush.take() {
                        handle.abort();
                    }
                }
                action
            }
            None => return,
        };
        match action {
            ThrottleAction::Apply(merged) => {
                if let Some(op) = reg.operations.get_mut(id) {
                    op.progress.apply(&merged);
                    applied = true;
                }
            }
            ThrottleAction::Scheduled { fire_at } => schedule_at = Some(fire_at),
            ThrottleAction::Coalesced => {}
        }
    }

    if let Some(fire_at) = schedule_at {
        let weak = Arc::downgrade(shared);
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            if let Some(shared) = weak.upgrade() {
                flush_progress(&shared, &task_id);
            }
        });
        let mut reg = shared.lock();
        match reg.throttles.get_mut(id) {
            Some(lane) => lane.flush = Some(handle),
            // Torn down while we were spawning.
            None => handle.abort(),
        }
    }

    if applied {
        notify(shared, id);
    }
}

/// Deferred throttle flush: apply the buffered merge and notify.
fn flush_progress(shared: &Arc<Shared>, id: &str) {
    {
        let mut reg = shared.lock();
        match reg.operations.get(id) {
            Some(op) if op.status == OperationStatus::Running => {}
            _ => return,
        }
        let now = Instant::now();
        let merged = match reg.throttles.get_mut(id) {
            Some(lane) => {
                lane.flush = None;
                lane.throttle.flush(now)
            }
            None => None,
        };
        let Some(merged) = merged else {
            return;
        };
        if let Some(op) = reg.operations.get_mut(id) {
            op.progress.apply(&merged);
            debug!(operation_id = %id, "throttled progress flushed");
        }
    }
    notify(shared, id);
}

fn complete_inner(shared: &Arc<Shared>, id: &str, result: Option<Value>) {
    {
        let mut reg = shared.lock();
        let child_ids = match reg.operations.get(id) {
            Some(op) if op.status == OperationStatus::Running => op.child_ids.clone(),
            _ => return,
        };
        // Parent results always embed a summary of their children.
        let stored = if child_ids.is_empty() {
            result
        } else {
            let children: Vec<ChildOutcome> = child_ids
                .iter()
                .filter_map(|cid| reg.operations.get(cid))
                .map(ChildOutcome::from_operation)
                .collect();
            Some(
                serde_json::to_value(AggregatedResult { result, children })
                    .unwrap_or(Value::Null),
            )
        };
        if let Some(op) = reg.operations.get_mut(id) {
            op.status = OperationStatus::Completed;
            op.result = stored;
            op.progress.kind = ProgressKind::Determinate;
            op.progress.value = Some(100.0);
        }
        teardown_locked(&mut reg, id);
        debug!(operation_id = %id, "operation completed");
    }
    notify(shared, id);
}

fn fail_inner(shared: &Arc<Shared>, id: &str, error: String) {
    {
        let mut reg = shared.lock();
        match reg.operations.get_mut(id) {
            Some(op) if op.status == OperationStatus::Running => {
                op.status = OperationStatus::Failed;
                op.error = Some(error.clone());
            }
            _ => return,
        }
        teardown_locked(&mut reg, id);
        warn!(operation_id = %id, error = %error, "operation failed");
    }
    notify(shared, id);
}

fn cancel_inner(shared: &Arc<Shared>, id: &str) {
    let token;
    let child_ids;
    {
        let mut reg = shared.lock();
        match reg.operations.get_mut(id) {
            Some(op) if op.status == OperationStatus::Running => {
                op.status = OperationStatus::Cancelled;
                child_ids = op.child_ids.clone();
            }
            _ => return,
        }
        // Keep the token out of teardown's dispose path: its callbacks must
        // fire, not drop.
        token = reg.tokens.remove(id);
        teardown_locked(&mut reg, id);
        debug!(operation_id = %id, children = child_ids.len(), "operation cancelled");
    }

    // Cooperative signal first (cascades through derived tokens), outside
    // the lock so cancel callbacks may re-enter the manager.
    if let Some(token) = token {
        token.cancel();
    }
    notify(shared, id);

    // Then the explicit state cascade: every listed child flips to
    // Cancelled even if its work never inspected the token.
    for child_id in child_ids {
        cancel_inner(shared, &child_id);
    }
}

/// Abort timers, drop throttle state, and dispose the token for `id`.
fn teardown_locked(reg: &mut Registry, id: &str) {
    if let Some(handles) = reg.timers.remove(id) {
        for handle in handles {
            handle.abort();
        }
    }
    if let Some(lane) = reg.throttles.remove(id) {
        if let Some(handle) = lane.flush {
            handle.abort();
        }
    }
    if let Some(token) = reg.tokens.remove(id) {
        token.dispose();
    }
}

/// Deliver the current snapshot of `id` to its subscribers, in subscription
/// order, on the calling stack.
fn notify(shared: &Arc<Shared>, id: &str) {
    let (snapshot, subscribers) = {
        let reg = shared.lock();
        let Some(op) = reg.operations.get(id) else {
            return;
        };
        (
            op.clone(),
            reg.subscribers.get(id).cloned().unwrap_or_default(),
        )
    };
    for (subscriber_id, callback) in &subscribers {
        invoke_subscriber(callback, *subscriber_id, &snapshot);
    }
}

/// Invoke one subscriber, isolating a panic so the remaining callbacks
/// still receive the notification.
fn invoke_subscriber(callback: &SubscriberFn, subscriber_id: u64, snapshot: &Operation) {
    let result = catch_unwind(AssertUnwindSafe(|| callback(snapshot)));
    if result.is_err() {
        warn!(
            operation_id = %snapshot.id,
            subscriber_id,
            "subscriber callback panicked; continuing delivery"
        );
    }
}

// --- process-wide convenience instance ----------------------------------

static DEFAULT_MANAGER: Lazy<RwLock<OperationManager>> =
    Lazy::new(|| RwLock::new(OperationManager::new()));

/// The process-wide convenience manager. Prefer constructing and passing an
/// explicit [`OperationManager`]; this exists for call sites with no way to
/// thread one through.
pub fn default_manager() -> OperationManager {
    DEFAULT_MANAGER
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Replace the process-wide manager with a fresh one. Test isolation only.
pub fn reset_default_manager() {
    *DEFAULT_MANAGER.write().unwrap_or_else(|e| e.into_inner()) = OperationManager::new();
}
