//! The in-memory operation table.
//!
//! One `Operation` tracks one submitted job across its target set. Entries
//! follow single-writer discipline: only the worker that owns an operation
//! mutates it, everyone else reads a cloned snapshot through the lock. A
//! periodic sweep evicts settled operations after the retention window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use berth_protocol::protocol::{
    OperationKind, OperationSnapshot, OperationState, Outcome, OutcomeCounters, TargetOutcome,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::runtime::CancelToken;

/// One tracked asynchronous job spanning one or more containers.
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Fixed at submission, never mutated afterwards.
    pub targets: Vec<String>,
    pub counters: OutcomeCounters,
    /// Append-only, one entry per failed container.
    pub errors: Vec<String>,
    pub results: HashMap<String, TargetOutcome>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancel: CancelToken,
}

impl Operation {
    pub fn new(kind: OperationKind, targets: Vec<String>) -> Self {
        Self {
            id: format!("op-{}", Uuid::new_v4().simple()),
            kind,
            state: OperationState::Pending,
            targets,
            counters: OutcomeCounters::default(),
            errors: Vec::new(),
            results: HashMap::new(),
            created_at: Utc::now(),
            completed_at: None,
            cancel: CancelToken::new(),
        }
    }

    /// Fold one settled container into the aggregate state.
    pub fn record(&mut self, name: &str, outcome: TargetOutcome) {
        self.counters.record(outcome.outcome);
        if outcome.outcome == Outcome::Failed {
            let detail = outcome.detail.as_deref().unwrap_or("unknown failure");
            self.errors.push(format!("{}: {}", name, detail));
        }
        self.results.insert(name.to_string(), outcome);
    }

    /// Transition into a terminal state.
    pub fn finalize(&mut self, state: OperationState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            targets: self.targets.clone(),
            counters: self.counters,
            errors: self.errors.clone(),
            results: self.results.clone(),
            created_at: self.created_at.timestamp(),
            completed_at: self.completed_at.map(|t| t.timestamp()),
        }
    }
}

pub type SharedOperation = Arc<RwLock<Operation>>;

/// Arena-style map of operations keyed by opaque id.
#[derive(Default)]
pub struct OperationTable {
    entries: DashMap<String, SharedOperation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, operation: Operation) -> SharedOperation {
        let id = operation.id.clone();
        let entry = Arc::new(RwLock::new(operation));
        self.entries.insert(id, entry.clone());
        entry
    }

    pub fn get(&self, id: &str) -> Option<SharedOperation> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// A value copy for pollers, never a live reference.
    pub fn snapshot(&self, id: &str) -> Option<OperationSnapshot> {
        self.get(id).map(|entry| entry.read().snapshot())
    }

    /// Flip the cancel token of a pending/running operation. Returns `None`
    /// for unknown ids; cancelling a settled operation is a no-op.
    pub fn cancel(&self, id: &str) -> Option<()> {
        let entry = self.get(id)?;
        let operation = entry.read();
        if !operation.is_terminal() {
            operation.cancel.cancel();
        }
        Some(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop settled operations older than the retention window.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                let operation = entry.value().read();
                operation.is_terminal()
                    && operation.completed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            debug!("evicting settled operation {}", id);
            self.entries.remove(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(kind: Outcome, detail: Option<&str>) -> TargetOutcome {
        TargetOutcome {
            outcome: kind,
            detail: detail.map(|d| d.to_string()),
            scripts: Vec::new(),
        }
    }

    #[test]
    fn record_tallies_counters_and_errors() {
        let mut op = Operation::new(OperationKind::StopAll, vec!["a".into(), "b".into()]);
        op.record("a", outcome(Outcome::Stopped, None));
        op.record("b", outcome(Outcome::Failed, Some("pre_stop exhausted 3 attempts")));

        assert_eq!(op.counters.stopped, 1);
        assert_eq!(op.counters.failed, 1);
        assert_eq!(op.counters.total(), 2);
        assert_eq!(op.errors.len(), 1);
        assert!(op.errors[0].starts_with("b: "));
    }

    #[test]
    fn snapshot_is_a_value_copy() {
        let table = OperationTable::new();
        let entry = table.insert(Operation::new(OperationKind::Start, vec!["web".into()]));

        let before = table.snapshot(&entry.read().id).unwrap();
        assert_eq!(before.counters.total(), 0);

        entry.write().record("web", outcome(Outcome::Started, None));

        // The earlier snapshot is unaffected; a fresh one sees the update.
        assert_eq!(before.counters.total(), 0);
        let after = table.snapshot(&before.id).unwrap();
        assert_eq!(after.counters.started, 1);
    }

    #[test]
    fn unknown_id_has_no_snapshot() {
        let table = OperationTable::new();
        assert!(table.snapshot("op-missing").is_none());
        assert!(table.cancel("op-missing").is_none());
    }

    #[test]
    fn cancel_terminal_operation_is_noop() {
        let table = OperationTable::new();
        let entry = table.insert(Operation::new(OperationKind::Stop, vec![]));
        let id = entry.read().id.clone();
        entry.write().finalize(OperationState::Completed);

        assert!(table.cancel(&id).is_some());
        assert!(!entry.read().cancel.is_cancelled());
    }

    #[test]
    fn eviction_only_touches_expired_terminal_operations() {
        let table = OperationTable::new();

        let settled = table.insert(Operation::new(OperationKind::Stop, vec![]));
        {
            let mut op = settled.write();
            op.finalize(OperationState::Completed);
            op.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        }
        let settled_id = settled.read().id.clone();

        let fresh = table.insert(Operation::new(OperationKind::Stop, vec![]));
        fresh.write().finalize(OperationState::Completed);
        let fresh_id = fresh.read().id.clone();

        let running = table.insert(Operation::new(OperationKind::Start, vec!["a".into()]));
        running.write().state = OperationState::Running;
        let running_id = running.read().id.clone();

        let evicted = table.evict_expired(Duration::from_secs(3600));
        assert_eq!(evicted, 1);
        assert!(table.snapshot(&settled_id).is_none());
        assert!(table.snapshot(&fresh_id).is_some());
        assert!(table.snapshot(&running_id).is_some());
    }

    #[test]
    fn ids_are_unique() {
        let a = Operation::new(OperationKind::Start, vec![]);
        let b = Operation::new(OperationKind::Start, vec![]);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("op-"));
    }
}
