//! Rendezvous between a paused generator and an out-of-band approve/reject.
//!
//! One process-wide map keyed by `(session_id, tool_call_id)` — with the
//! `hitl:` and `proposal:` namespaces kept distinct — holds single-shot
//! waiters. The stream engine persists the pending row, **registers** its
//! waiter, emits the SSE prompt, and then blocks (bounded); the HTTP router
//! resolves the row and signals through [`ApprovalGate::resolve`].
//! Registration happens before the prompt is emitted, so a resolve that
//! races the emit still finds its waiter. On timeout the engine marks the
//! row denied/rejected itself. Waiters are always deregistered on exit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Decision delivered to a waiting generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Denied,
}

/// Outcome of one wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Decision(Decision),
    TimedOut,
}

/// Namespace of a waiter key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    Hitl,
    Proposal,
}

impl GateKind {
    fn prefix(&self) -> &'static str {
        match self {
            GateKind::Hitl => "hitl",
            GateKind::Proposal => "proposal",
        }
    }
}

fn key(kind: GateKind, session_id: &str, tool_call_id: &str) -> String {
    format!("{}:{}:{}", kind.prefix(), session_id, tool_call_id)
}

type WaiterMap = Arc<DashMap<String, oneshot::Sender<Decision>>>;

/// A registered, not-yet-awaited waiter. Consume with
/// [`wait`](PendingDecision::wait); dropping it unregisters implicitly on
/// the next resolve miss.
pub struct PendingDecision {
    key: String,
    rx: oneshot::Receiver<Decision>,
    waiters: WaiterMap,
}

impl PendingDecision {
    /// Blocks until resolved or `timeout` elapses. The waiter is removed on
    /// every exit path, so a late resolve after timeout finds nothing.
    pub async fn wait(self, timeout: Duration) -> WaitOutcome {
        let outcome = match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(decision)) => WaitOutcome::Decision(decision),
            // Sender dropped without a decision, or timer fired.
            Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
        };
        self.waiters.remove(&self.key);
        debug!(key = %self.key, ?outcome, "approval wait finished");
        outcome
    }
}

/// Process-global approval gate.
#[derive(Default)]
pub struct ApprovalGate {
    waiters: WaiterMap,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for this key. Call before emitting the prompt so
    /// no resolve can slip between emit and wait. `(session, tool_call)`
    /// pairs are unique by construction; a duplicate registration replaces a
    /// stale waiter whose generator is gone.
    pub fn register(
        &self,
        kind: GateKind,
        session_id: &str,
        tool_call_id: &str,
    ) -> PendingDecision {
        let key = key(kind, session_id, tool_call_id);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key.clone(), tx);
        PendingDecision {
            key,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Signals the waiter for this key. Returns false when no generator is
    /// waiting (already resolved, timed out, or never registered).
    pub fn resolve(
        &self,
        kind: GateKind,
        session_id: &str,
        tool_call_id: &str,
        decision: Decision,
    ) -> bool {
        let key = key(kind, session_id, tool_call_id);
        match self.waiters.remove(&key) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Number of registered waiters (diagnostics).
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a resolve that lands before wait begins is still
    /// delivered — registration, not waiting, claims the key.
    #[tokio::test]
    async fn resolve_before_wait_is_not_lost() {
        let gate = ApprovalGate::new();
        let pending = gate.register(GateKind::Hitl, "s1", "call_1");
        assert!(gate.resolve(GateKind::Hitl, "s1", "call_1", Decision::Approved));
        let outcome = pending.wait(Duration::from_secs(1)).await;
        assert_eq!(outcome, WaitOutcome::Decision(Decision::Approved));
        assert_eq!(gate.pending(), 0);
    }

    /// **Scenario**: resolve wakes a parked waiter with the decision.
    #[tokio::test]
    async fn resolve_wakes_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        let pending = gate.register(GateKind::Hitl, "s1", "call_1");
        let waiter = tokio::spawn(pending.wait(Duration::from_secs(5)));
        tokio::task::yield_now().await;
        assert!(gate.resolve(GateKind::Hitl, "s1", "call_1", Decision::Denied));
        assert_eq!(
            waiter.await.unwrap(),
            WaitOutcome::Decision(Decision::Denied)
        );
    }

    /// **Scenario**: namespaces are distinct — a proposal resolve does not
    /// reach a HITL waiter for the same tuple.
    #[tokio::test]
    async fn namespaces_are_distinct() {
        let gate = ApprovalGate::new();
        let pending = gate.register(GateKind::Hitl, "s1", "call_1");
        assert!(!gate.resolve(GateKind::Proposal, "s1", "call_1", Decision::Approved));
        let outcome = pending.wait(Duration::from_millis(20)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    /// **Scenario**: timeout removes the waiter; a late resolve finds nothing.
    #[tokio::test]
    async fn timeout_deregisters() {
        let gate = ApprovalGate::new();
        let pending = gate.register(GateKind::Proposal, "s1", "call_2");
        let outcome = pending.wait(Duration::from_millis(10)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(gate.pending(), 0);
        assert!(!gate.resolve(GateKind::Proposal, "s1", "call_2", Decision::Denied));
    }

    /// **Scenario**: re-registering the same key replaces the stale waiter.
    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let gate = ApprovalGate::new();
        let stale = gate.register(GateKind::Hitl, "s1", "call_3");
        let fresh = gate.register(GateKind::Hitl, "s1", "call_3");
        assert!(gate.resolve(GateKind::Hitl, "s1", "call_3", Decision::Approved));
        assert_eq!(
            fresh.wait(Duration::from_millis(50)).await,
            WaitOutcome::Decision(Decision::Approved)
        );
        // The stale waiter's sender was dropped on replacement.
        assert_eq!(
            stale.wait(Duration::from_millis(10)).await,
            WaitOutcome::TimedOut
        );
    }
}
