//! Drives one container through its full transition.
//!
//! Per container the sequence is strictly runtime action, then a bounded
//! wait for the observable running state, then lifecycle scripts. Failures
//! at the action or observe step short-circuit: scripts are skipped and the
//! underlying message is preserved verbatim for the operator. Only
//! `RuntimeError::Unavailable` escapes as an error; every other failure is a
//! `failed` outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_protocol::protocol::{OperationKind, Outcome, ScriptPhase, TargetOutcome};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{ResolvedContainer, Settings};
use crate::runtime::{
    CancelToken, ContainerRuntime, ContainerState, Result, RuntimeError, StopResult,
};
use crate::scripts::{PhaseReport, ScriptRunContext, run_phase};

const OBSERVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Records which container instance already ran its `post_start` scripts,
/// keyed by container name. A second start of the same instance is
/// idempotent; a fresh instance re-arms the scripts. Success only — a failed
/// initialization can be retried by the next start.
#[derive(Clone, Default)]
pub struct ScriptLedger(Arc<DashMap<String, String>>);

impl ScriptLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ran(&self, name: &str, instance: &str) -> bool {
        self.0
            .get(name)
            .map(|entry| entry.value() == instance)
            .unwrap_or(false)
    }

    pub fn record(&self, name: &str, instance: &str) {
        self.0.insert(name.to_string(), instance.to_string());
    }

    pub fn clear(&self, name: &str) {
        self.0.remove(name);
    }
}

/// Shared inputs for executing targets of one operation.
pub struct ExecContext<'a> {
    pub runtime: &'a Arc<dyn ContainerRuntime>,
    pub settings: &'a Settings,
    pub ledger: &'a ScriptLedger,
    pub cancel: &'a CancelToken,
}

impl ExecContext<'_> {
    fn script_ctx(&self) -> ScriptRunContext<'_> {
        ScriptRunContext {
            runtime: self.runtime.as_ref(),
            settings: self.settings,
            cancel: self.cancel,
        }
    }
}

/// Execute one container transition and classify how it settled.
pub async fn execute(
    ctx: &ExecContext<'_>,
    target: &ResolvedContainer,
    kind: OperationKind,
) -> Result<TargetOutcome> {
    match kind {
        OperationKind::Start | OperationKind::GroupStart => start(ctx, target).await,
        OperationKind::Stop | OperationKind::GroupStop | OperationKind::StopAll => {
            stop(ctx, target).await
        }
        OperationKind::Restart | OperationKind::RestartAll => restart(ctx, target).await,
        OperationKind::Cleanup | OperationKind::CleanupAll => cleanup(ctx, target).await,
    }
}

fn settled(outcome: Outcome) -> TargetOutcome {
    TargetOutcome {
        outcome,
        detail: None,
        scripts: Vec::new(),
    }
}

fn failed(detail: impl Into<String>) -> TargetOutcome {
    TargetOutcome {
        outcome: Outcome::Failed,
        detail: Some(detail.into()),
        scripts: Vec::new(),
    }
}

/// Fold a finished phase into the outcome for a target that otherwise
/// settled as `success`.
fn with_scripts(success: Outcome, report: PhaseReport) -> TargetOutcome {
    if report.failed {
        TargetOutcome {
            outcome: Outcome::Failed,
            detail: report.failure,
            scripts: report.results,
        }
    } else {
        TargetOutcome {
            outcome: success,
            detail: None,
            scripts: report.results,
        }
    }
}

async fn start(ctx: &ExecContext<'_>, target: &ResolvedContainer) -> Result<TargetOutcome> {
    let name = target.name.as_str();

    if let ContainerState::Running { instance } = ctx.runtime.inspect(name).await? {
        if ctx.ledger.ran(name, &instance) {
            debug!("{} already running, scripts already ran for this instance", name);
            return Ok(settled(Outcome::AlreadyRunning));
        }
        let report = run_post_start(ctx, target).await?;
        if !report.failed {
            ctx.ledger.record(name, &instance);
        }
        return Ok(with_scripts(Outcome::AlreadyRunning, report));
    }

    bring_up(ctx, target, Outcome::Started).await
}

async fn restart(ctx: &ExecContext<'_>, target: &ResolvedContainer) -> Result<TargetOutcome> {
    let name = target.name.as_str();

    if ctx.runtime.inspect(name).await?.is_running() {
        info!("stopping {} for restart", name);
        match ctx.runtime.stop(name).await {
            Ok(_) => {}
            Err(RuntimeError::Failed { message, .. }) => return Ok(failed(message)),
            Err(other) => return Err(other),
        }
        ctx.ledger.clear(name);
    }

    bring_up(ctx, target, Outcome::Restarted).await
}

/// Shared tail of start/restart: runtime action, observe, post_start.
async fn bring_up(
    ctx: &ExecContext<'_>,
    target: &ResolvedContainer,
    success: Outcome,
) -> Result<TargetOutcome> {
    let name = target.name.as_str();

    match ctx.runtime.ensure_started(name, target.spec.as_ref()).await {
        Ok(()) => {}
        Err(RuntimeError::Failed { message, .. }) => return Ok(failed(message)),
        Err(other) => return Err(other),
    }

    let instance = match wait_until_running(ctx, name).await? {
        Some(instance) => instance,
        None => {
            return Ok(failed(format!(
                "did not reach running state within {}",
                crate::config::format_duration(&ctx.settings.observe_timeout)
            )));
        }
    };

    let report = run_post_start(ctx, target).await?;
    if !report.failed {
        ctx.ledger.record(name, &instance);
    }
    Ok(with_scripts(success, report))
}

async fn stop(ctx: &ExecContext<'_>, target: &ResolvedContainer) -> Result<TargetOutcome> {
    let name = target.name.as_str();

    match ctx.runtime.inspect(name).await? {
        ContainerState::Absent | ContainerState::Exited => {
            // Nothing to stop — and not an error.
            return Ok(settled(Outcome::NotRunning));
        }
        ContainerState::Running { .. } => {}
    }

    // pre_stop runs before the runtime stop: backups need a live container.
    let report = run_pre_stop(ctx, target).await?;
    ctx.ledger.clear(name);

    match ctx.runtime.stop(name).await {
        Ok(StopResult::Stopped) => Ok(with_scripts(Outcome::Stopped, report)),
        Ok(StopResult::NotFound) => Ok(with_scripts(Outcome::NotRunning, report)),
        Err(RuntimeError::Failed { message, .. }) => Ok(TargetOutcome {
            outcome: Outcome::Failed,
            detail: Some(message),
            scripts: report.results,
        }),
        Err(other) => Err(other),
    }
}

async fn cleanup(ctx: &ExecContext<'_>, target: &ResolvedContainer) -> Result<TargetOutcome> {
    let name = target.name.as_str();

    let mut scripts = Vec::new();
    if ctx.runtime.inspect(name).await?.is_running() {
        let report = run_pre_stop(ctx, target).await?;
        ctx.ledger.clear(name);
        if report.failed {
            // Removal is irreversible; only a clean stop sequence earns it.
            let _ = ctx.runtime.stop(name).await;
            return Ok(TargetOutcome {
                outcome: Outcome::Failed,
                detail: report.failure,
                scripts: report.results,
            });
        }
        scripts = report.results;
        match ctx.runtime.stop(name).await {
            Ok(_) => {}
            Err(RuntimeError::Failed { message, .. }) => {
                return Ok(TargetOutcome {
                    outcome: Outcome::Failed,
                    detail: Some(message),
                    scripts,
                });
            }
            Err(other) => return Err(other),
        }
    } else {
        ctx.ledger.clear(name);
    }

    match ctx.runtime.remove(name, true).await {
        Ok(()) => Ok(TargetOutcome {
            outcome: Outcome::Removed,
            detail: None,
            scripts,
        }),
        Err(RuntimeError::Failed { message, .. }) => Ok(TargetOutcome {
            outcome: Outcome::Failed,
            detail: Some(message),
            scripts,
        }),
        Err(other) => Err(other),
    }
}

async fn run_post_start(
    ctx: &ExecContext<'_>,
    target: &ResolvedContainer,
) -> Result<PhaseReport> {
    run_phase(
        &ctx.script_ctx(),
        &target.name,
        &target.shell,
        ScriptPhase::PostStart,
        target.scripts_for(ScriptPhase::PostStart),
    )
    .await
}

async fn run_pre_stop(ctx: &ExecContext<'_>, target: &ResolvedContainer) -> Result<PhaseReport> {
    run_phase(
        &ctx.script_ctx(),
        &target.name,
        &target.shell,
        ScriptPhase::PreStop,
        target.scripts_for(ScriptPhase::PreStop),
    )
    .await
}

/// Poll until the container is in a state where scripts can execute, bounded
/// by the configured observe timeout. Returns the instance id.
async fn wait_until_running(ctx: &ExecContext<'_>, name: &str) -> Result<Option<String>> {
    let deadline = Instant::now() + ctx.settings.observe_timeout;
    loop {
        if let ContainerState::Running { instance } = ctx.runtime.inspect(name).await? {
            return Ok(Some(instance));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(OBSERVE_POLL_INTERVAL.min(ctx.settings.observe_timeout)).await;
    }
}
