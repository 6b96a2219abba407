//! Lifecycle script execution with bounded retry and timeout.
//!
//! The runner consumes the ordered script list the config resolver produced
//! (default first, then custom) and records every attempt. An exhausted
//! default script does not stop the custom script from running: operators
//! rely on backup/cleanup side effects even when initialization is broken.

use std::time::Instant;

use berth_protocol::protocol::{ScriptPhase, ScriptResult};
use tracing::{debug, info, warn};

use crate::config::{ScriptSource, Settings};
use crate::runtime::{CancelToken, ContainerRuntime, ExecOptions, Result};

/// Shared inputs for one phase run.
pub struct ScriptRunContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub settings: &'a Settings,
    pub cancel: &'a CancelToken,
}

/// Aggregate result of running one phase for one container.
#[derive(Debug, Default)]
pub struct PhaseReport {
    /// Every attempt of every script, in execution order.
    pub results: Vec<ScriptResult>,
    pub failed: bool,
    /// Detail of the first script that exhausted its attempts.
    pub failure: Option<String>,
}

/// Run all scripts of one phase against a running container.
///
/// Scripts run strictly in order; for the same container and phase two
/// scripts are never in flight at once. No scripts is a no-op success.
/// Only `RuntimeError::Unavailable` propagates; everything else is data in
/// the report.
pub async fn run_phase(
    ctx: &ScriptRunContext<'_>,
    container: &str,
    shell: &str,
    phase: ScriptPhase,
    sources: &[ScriptSource],
) -> Result<PhaseReport> {
    let mut report = PhaseReport::default();

    if sources.is_empty() {
        return Ok(report);
    }

    let timeout = ctx.settings.script_timeout(phase);
    let opts = ExecOptions {
        timeout,
        max_output_lines: ctx.settings.max_output_lines,
        cancel: ctx.cancel.clone(),
    };

    for source in sources {
        if ctx.cancel.is_cancelled() {
            report.failed = true;
            report
                .failure
                .get_or_insert_with(|| "operation cancelled".to_string());
            break;
        }

        info!(
            "running {} {} script for {}",
            source.origin.as_str(),
            phase,
            container
        );

        let command = vec![shell.to_string(), "-c".to_string(), source.body.clone()];
        let mut succeeded = false;
        let mut last_detail = String::new();

        for attempt in 1..=ctx.settings.max_attempts {
            let started = Instant::now();
            let exec = ctx.runtime.exec(container, &command, &opts).await?;
            let duration_ms = started.elapsed().as_millis() as u64;

            let result = ScriptResult {
                phase,
                origin: source.origin,
                attempt,
                exit_code: exec.exit_code,
                duration_ms,
                output: exec.output,
                truncated: exec.truncated,
                timed_out: exec.timed_out,
            };
            let ok = result.succeeded();
            last_detail = attempt_detail(&result, ctx.settings, exec.cancelled);
            report.results.push(result);

            if ok {
                succeeded = true;
                break;
            }

            debug!(
                "{} {} script for {} attempt {}/{} failed: {}",
                source.origin.as_str(),
                phase,
                container,
                attempt,
                ctx.settings.max_attempts,
                last_detail
            );

            if exec.cancelled || ctx.cancel.is_cancelled() {
                break;
            }

            if attempt < ctx.settings.max_attempts && !ctx.settings.retry_backoff.is_zero() {
                tokio::time::sleep(ctx.settings.retry_backoff).await;
            }
        }

        if !succeeded {
            report.failed = true;
            if ctx.cancel.is_cancelled() {
                report.failure.get_or_insert_with(|| {
                    format!("{} {} script cancelled", source.origin.as_str(), phase)
                });
                continue;
            }
            warn!(
                "{} {} script for {} exhausted {} attempts",
                source.origin.as_str(),
                phase,
                container,
                ctx.settings.max_attempts
            );
            if report.failure.is_none() {
                report.failure = Some(format!(
                    "{} {} script exhausted {} attempts ({})",
                    source.origin.as_str(),
                    phase,
                    ctx.settings.max_attempts,
                    last_detail
                ));
            }
        }
    }

    Ok(report)
}

fn attempt_detail(result: &ScriptResult, settings: &Settings, cancelled: bool) -> String {
    if cancelled {
        "cancelled".to_string()
    } else if result.timed_out {
        format!(
            "timed out after {}",
            crate::config::format_duration(&settings.script_timeout(result.phase))
        )
    } else {
        match result.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "killed by signal".to_string(),
        }
    }
}
