//! Progress-update throttling with deferred merge.
//!
//! Each operation owns one [`ProgressThrottle`], a small state machine:
//!
//! ```text
//! Idle ──submit (window open)──▶ apply immediately, stay Idle
//! Idle ──submit (window closed)──▶ Deferred(pending, fire_at)
//! Deferred ──submit──▶ Deferred (coalesce into pending)
//! Deferred ──flush at fire_at──▶ apply pending merge, back to Idle
//! ```
//!
//! The manager drives it: an `Apply` action mutates state right away, a
//! `Scheduled` action spawns one sleep task for the remaining window, and
//! `Coalesced` means a flush is already on its way. At most one applied
//! mutation lands per throttle window regardless of call rate.

use std::time::Duration;

use tokio::time::Instant;

use crate::operation::ProgressUpdate;

/// Default throttle cadence, approximating 60 Hz.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_micros(16_667);

/// What the manager must do with a submitted update.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleAction {
    /// Window open: apply this (already merged) update now.
    Apply(ProgressUpdate),
    /// Window closed and nothing pending: schedule a flush at `fire_at`.
    Scheduled { fire_at: Instant },
    /// Window closed, flush already scheduled: update merged into pending.
    Coalesced,
}

/// Per-operation throttle state.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_applied: Instant,
    pending: Option<ProgressUpdate>,
}

impl ProgressThrottle {
    /// Create a throttle anchored at `now` (the operation's start), so the
    /// first window opens one interval after start.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_applied: now,
            pending: None,
        }
    }

    /// Submit a partial update at `now`.
    pub fn submit(&mut self, now: Instant, update: ProgressUpdate) -> ThrottleAction {
        if now.duration_since(self.last_applied) >= self.interval {
            // Window open: fold any pending merge in and apply at once.
            let merged = match self.pending.take() {
                Some(mut pending) => {
                    pending.merge(update);
                    pending
                }
                None => update,
            };
            self.last_applied = now;
            return ThrottleAction::Apply(merged);
        }

        let fire_at = self.last_applied + self.interval;
        match self.pending.as_mut() {
            Some(pending) => {
                pending.merge(update);
                ThrottleAction::Coalesced
            }
            None => {
                self.pending = Some(update);
                ThrottleAction::Scheduled { fire_at }
            }
        }
    }

    /// Take the pending merge, marking it applied at `now`. Returns `None`
    /// when nothing is pending (e.g. an immediate apply raced the flush).
    pub fn flush(&mut self, now: Instant) -> Option<ProgressUpdate> {
        let pending = self.pending.take()?;
        self.last_applied = now;
        Some(pending)
    }

    /// Whether a deferred merge is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::ProgressKind;

    const INTERVAL: Duration = Duration::from_millis(16);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_submit_after_window_applies_immediately() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        let action = throttle.submit(t0 + ms(20), ProgressUpdate::percent(10.0));
        assert!(matches!(action, ThrottleAction::Apply(_)));
    }

    #[test]
    fn test_submit_within_window_defers() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        let action = throttle.submit(t0 + ms(5), ProgressUpdate::percent(10.0));
        assert_eq!(
            action,
            ThrottleAction::Scheduled {
                fire_at: t0 + INTERVAL
            }
        );
        assert!(throttle.has_pending());
    }

    #[test]
    fn test_second_submit_within_window_coalesces() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        throttle.submit(t0 + ms(2), ProgressUpdate::percent(10.0).with_message("a"));
        let action = throttle.submit(t0 + ms(4), ProgressUpdate::percent(30.0));
        assert_eq!(action, ThrottleAction::Coalesced);

        let flushed = throttle.flush(t0 + INTERVAL).unwrap();
        // Last writer wins per field; message survives from the first call.
        assert_eq!(flushed.value, Some(30.0));
        assert_eq!(flushed.message.as_deref(), Some("a"));
        assert_eq!(flushed.kind, Some(ProgressKind::Determinate));
    }

    #[test]
    fn test_flush_returns_to_idle() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        throttle.submit(t0 + ms(5), ProgressUpdate::percent(10.0));
        assert!(throttle.flush(t0 + INTERVAL).is_some());
        assert!(!throttle.has_pending());
        assert!(throttle.flush(t0 + INTERVAL).is_none());
    }

    #[test]
    fn test_apply_folds_in_pending_merge() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        throttle.submit(t0 + ms(5), ProgressUpdate::percent(10.0).with_message("early"));
        let action = throttle.submit(t0 + ms(20), ProgressUpdate::percent(50.0));

        match action {
            ThrottleAction::Apply(update) => {
                assert_eq!(update.value, Some(50.0));
                assert_eq!(update.message.as_deref(), Some("early"));
            }
            other => panic!("expected Apply, got {other:?}"),
        }
        assert!(!throttle.has_pending());
    }

    #[test]
    fn test_window_reopens_after_apply() {
        let t0 = Instant::now();
        let mut throttle = ProgressThrottle::new(INTERVAL, t0);

        throttle.submit(t0 + ms(20), ProgressUpdate::percent(10.0));
        // 5ms after the last apply: closed again.
        let action = throttle.submit(t0 + ms(25), ProgressUpdate::percent(20.0));
        assert!(matches!(action, ThrottleAction::Scheduled { .. }));
    }
}
