//! Asynchronous operation orchestration.
//!
//! `submit` allocates an operation, hands the target set to a background
//! worker and returns the id immediately. The worker fans targets out under
//! the per-operation concurrency bound, folds each settled container into
//! the shared counters, and drives the operation to a terminal state.
//! Per-target failures never fail the operation; only an unreachable
//! container runtime does.

use std::sync::Arc;
use std::time::Duration;

use berth_protocol::protocol::{
    OperationKind, OperationSnapshot, OperationState, Outcome, TargetOutcome,
};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ResolvedContainer, Settings};
use crate::executor::{ExecContext, ScriptLedger, execute};
use crate::operation::{Operation, OperationTable, SharedOperation};
use crate::runtime::{ContainerRuntime, RuntimeError};

const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    table: Arc<OperationTable>,
    ledger: ScriptLedger,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: Settings) -> Self {
        Self {
            runtime,
            settings,
            table: Arc::new(OperationTable::new()),
            ledger: ScriptLedger::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Operations currently held in the table, any state.
    pub fn operation_count(&self) -> usize {
        self.table.len()
    }

    /// Validate, allocate and hand off an operation; returns its id at once.
    ///
    /// An empty target set yields an immediately completed operation with
    /// zero counters — a valid answer, not an error.
    pub fn submit(
        &self,
        kind: OperationKind,
        targets: Vec<ResolvedContainer>,
        sequential: bool,
    ) -> String {
        let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
        let mut operation = Operation::new(kind, names);
        let id = operation.id.clone();

        if targets.is_empty() {
            debug!("operation {} ({}) has no targets, completing", id, kind);
            operation.finalize(OperationState::Completed);
            self.table.insert(operation);
            return id;
        }

        info!(
            "operation {} ({}) submitted for {} target(s)",
            id,
            kind,
            targets.len()
        );

        let entry = self.table.insert(operation);
        let runtime = self.runtime.clone();
        let settings = self.settings.clone();
        let ledger = self.ledger.clone();
        tokio::spawn(run_operation(
            entry, runtime, settings, ledger, targets, kind, sequential,
        ));

        id
    }

    pub fn status(&self, id: &str) -> Option<OperationSnapshot> {
        self.table.snapshot(id)
    }

    /// Best-effort cancellation. `None` for unknown ids; a settled operation
    /// is left untouched.
    pub fn cancel(&self, id: &str) -> Option<()> {
        self.table.cancel(id)
    }

    /// Periodically drop settled operations past the retention window.
    pub fn spawn_eviction_sweep(&self) -> JoinHandle<()> {
        let table = self.table.clone();
        let retention = self.settings.retention;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = table.evict_expired(retention);
                if evicted > 0 {
                    debug!("evicted {} settled operation(s)", evicted);
                }
            }
        })
    }
}

/// The background worker owning one operation. Single-writer: nothing else
/// mutates the entry while this runs.
async fn run_operation(
    entry: SharedOperation,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    ledger: ScriptLedger,
    targets: Vec<ResolvedContainer>,
    kind: OperationKind,
    sequential: bool,
) {
    let (id, cancel) = {
        let mut op = entry.write();
        op.state = OperationState::Running;
        (op.id.clone(), op.cancel.clone())
    };

    let ctx = ExecContext {
        runtime: &runtime,
        settings: &settings,
        ledger: &ledger,
        cancel: &cancel,
    };

    let mut abort: Option<String> = None;

    if sequential {
        for target in &targets {
            if cancel.is_cancelled() || abort.is_some() {
                break;
            }
            let result = execute(&ctx, target, kind).await;
            settle(&entry, &target.name, result, &mut abort);
        }
    } else {
        let limit = settings.concurrency.min(targets.len()).max(1);
        for chunk in targets.chunks(limit) {
            if cancel.is_cancelled() || abort.is_some() {
                break;
            }
            let futures = chunk.iter().map(|target| {
                let ctx = &ctx;
                async move { (target.name.as_str(), execute(ctx, target, kind).await) }
            });
            for (name, result) in join_all(futures).await {
                settle(&entry, name, result, &mut abort);
            }
        }
    }

    // Fold whatever never ran so the counters still sum to the target count.
    let mut op = entry.write();
    if !op.errors.is_empty() || abort.is_some() {
        warn!(
            "operation {} finished with {} error(s)",
            id,
            op.errors.len()
        );
    }
    let unsettled: Vec<String> = op
        .targets
        .iter()
        .filter(|name| !op.results.contains_key(*name))
        .cloned()
        .collect();
    for name in unsettled {
        let detail = match &abort {
            Some(message) => format!("aborted: {}", message),
            None => "operation cancelled".to_string(),
        };
        op.record(
            &name,
            TargetOutcome {
                outcome: Outcome::Failed,
                detail: Some(detail),
                scripts: Vec::new(),
            },
        );
    }

    let state = if abort.is_some() {
        OperationState::Error
    } else {
        OperationState::Completed
    };
    op.finalize(state);
    info!("operation {} settled as {}", id, state);
}

/// Fold one executor result into the operation.
fn settle(
    entry: &SharedOperation,
    name: &str,
    result: std::result::Result<TargetOutcome, RuntimeError>,
    abort: &mut Option<String>,
) {
    match result {
        Ok(outcome) => entry.write().record(name, outcome),
        Err(RuntimeError::Unavailable(message)) => {
            error!("container runtime unreachable, aborting operation: {}", message);
            if abort.is_none() {
                *abort = Some(message);
            }
        }
        Err(RuntimeError::Failed { message, .. }) => {
            entry.write().record(
                name,
                TargetOutcome {
                    outcome: Outcome::Failed,
                    detail: Some(message),
                    scripts: Vec::new(),
                },
            );
        }
    }
}
