//! Cooperative cancellation tokens with parent → child cascade.
//!
//! Tokens form an explicit tree: every token is a node in a shared arena,
//! and `cancel()` walks the node's descendants (parent before child) so the
//! cascade cost and ordering stay deterministic. Cancelling a child never
//! touches its parent.
//!
//! The signal is purely cooperative — nothing is interrupted. Holders either
//! poll [`CancellationToken::is_cancelled`] or register a callback with
//! [`CancellationToken::on_cancel`], which runs exactly once, synchronously,
//! at the moment cancellation happens (or immediately if the token is
//! already cancelled).

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

type CancelCallback = Box<dyn FnOnce() + Send>;

struct TokenNode {
    cancelled: bool,
    children: Vec<usize>,
    callbacks: Vec<(u64, CancelCallback)>,
}

struct TokenArena {
    nodes: Vec<TokenNode>,
    next_callback_id: u64,
}

impl TokenArena {
    fn alloc(&mut self, cancelled: bool) -> usize {
        self.nodes.push(TokenNode {
            cancelled,
            children: Vec::new(),
            callbacks: Vec::new(),
        });
        self.nodes.len() - 1
    }
}

/// A cooperative cancellation signal, derivable into child tokens whose
/// cancellation cascades from the parent.
///
/// Cloning yields another handle to the same node; `child_token` creates a
/// new node below it.
#[derive(Clone)]
pub struct CancellationToken {
    arena: Arc<Mutex<TokenArena>>,
    node: usize,
}

impl CancellationToken {
    /// Create a fresh root token.
    pub fn new() -> Self {
        let arena = TokenArena {
            nodes: vec![TokenNode {
                cancelled: false,
                children: Vec::new(),
                callbacks: Vec::new(),
            }],
            next_callback_id: 0,
        };
        Self {
            arena: Arc::new(Mutex::new(arena)),
            node: 0,
        }
    }

    /// Derive a child token. Cancelling `self` cancels the child (and all of
    /// its descendants); cancelling the child leaves `self` untouched.
    ///
    /// A child derived from an already-cancelled token is born cancelled.
    pub fn child_token(&self) -> Self {
        let mut arena = self.lock();
        let cancelled = arena.nodes[self.node].cancelled;
        let child = arena.alloc(cancelled);
        arena.nodes[self.node].children.push(child);
        Self {
            arena: Arc::clone(&self.arena),
            node: child,
        }
    }

    /// Whether this token has been cancelled (directly or via an ancestor).
    pub fn is_cancelled(&self) -> bool {
        self.lock().nodes[self.node].cancelled
    }

    /// Cancel this token and every descendant token, exactly once.
    ///
    /// Idempotent: repeated calls have no additional effect. Registered
    /// callbacks run synchronously on the caller's stack, parent before
    /// child, after the internal lock is released.
    pub fn cancel(&self) {
        let fired = {
            let mut arena = self.lock();
            if arena.nodes[self.node].cancelled {
                return;
            }
            // Bounded pre-order walk; drain callbacks while locked, run after.
            let mut fired: Vec<CancelCallback> = Vec::new();
            let mut stack = vec![self.node];
            while let Some(idx) = stack.pop() {
                let node = &mut arena.nodes[idx];
                if !node.cancelled {
                    node.cancelled = true;
                    fired.extend(node.callbacks.drain(..).map(|(_, cb)| cb));
                    // Reverse so pop() visits children in registration order.
                    stack.extend(node.children.iter().rev().copied());
                }
            }
            fired
        };
        debug!(callbacks = fired.len(), "cancellation token cancelled");
        for cb in fired {
            cb();
        }
    }

    /// Register `cb` to run once when this token is cancelled.
    ///
    /// If the token is already cancelled, `cb` runs immediately on this call
    /// stack — registrations never miss the signal. The returned handle
    /// removes a not-yet-fired callback.
    pub fn on_cancel(&self, cb: impl FnOnce() + Send + 'static) -> OnCancelHandle {
        let id = {
            let mut arena = self.lock();
            if arena.nodes[self.node].cancelled {
                drop(arena);
                cb();
                return OnCancelHandle::noop();
            }
            let id = arena.next_callback_id;
            arena.next_callback_id += 1;
            arena.nodes[self.node].callbacks.push((id, Box::new(cb)));
            id
        };
        OnCancelHandle {
            arena: Arc::downgrade(&self.arena),
            node: self.node,
            callback_id: Some(id),
        }
    }

    /// Drop this token's pending callbacks without cancelling.
    ///
    /// Used on terminal transitions where the signal will never fire.
    pub fn dispose(&self) {
        self.lock().nodes[self.node].callbacks.clear();
    }

    fn lock(&self) -> MutexGuard<'_, TokenArena> {
        // A panicking callback cannot poison this lock (callbacks run after
        // unlock), but recover rather than propagate just in case.
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("node", &self.node)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle returned by [`CancellationToken::on_cancel`]; unsubscribes the
/// callback if it has not fired yet.
pub struct OnCancelHandle {
    arena: Weak<Mutex<TokenArena>>,
    node: usize,
    callback_id: Option<u64>,
}

impl OnCancelHandle {
    fn noop() -> Self {
        Self {
            arena: Weak::new(),
            node: 0,
            callback_id: None,
        }
    }

    /// Remove the registered callback. No effect if it already fired (or ran
    /// immediately at registration time).
    pub fn unsubscribe(self) {
        let (Some(arena), Some(id)) = (self.arena.upgrade(), self.callback_id) else {
            return;
        };
        let mut arena = arena.lock().unwrap_or_else(|e| e.into_inner());
        let node = self.node;
        arena.nodes[node].callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_sets_flag() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_cancel_after_cancellation_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_callback() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let handle = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.unsubscribe();
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parent_cancel_cascades_to_descendants() {
        let root = CancellationToken::new();
        let child = root.child_token();
        let grandchild = child.child_token();

        root.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let root = CancellationToken::new();
        let child = root.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_sibling_unaffected_by_child_cancel() {
        let root = CancellationToken::new();
        let a = root.child_token();
        let b = root.child_token();

        a.cancel();
        assert!(!b.is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_descendant_callbacks_fire_on_parent_cancel() {
        let root = CancellationToken::new();
        let child = root.child_token();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        child.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        root.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_of_cancelled_token_is_born_cancelled() {
        let root = CancellationToken::new();
        root.cancel();

        let child = root.child_token();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_dispose_drops_callbacks_without_firing() {
        let token = CancellationToken::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        token.dispose();
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
