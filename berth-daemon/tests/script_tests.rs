//! Script runner behavior: retry discipline, ordering, truncation and the
//! default-then-custom failure policy.

mod support;

use std::time::Duration;

use berth_daemon::runtime::CancelToken;
use berth_daemon::scripts::{ScriptRunContext, run_phase};
use berth_protocol::protocol::{ScriptOrigin, ScriptPhase};

use support::{ExecBehavior, FakeRuntime, script, test_settings};

#[tokio::test]
async fn no_scripts_is_a_noop_success() {
    let runtime = FakeRuntime::new();
    let settings = test_settings();
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let report = run_phase(&ctx, "web", "/bin/sh", ScriptPhase::PostStart, &[])
        .await
        .unwrap();

    assert!(!report.failed);
    assert!(report.results.is_empty());
    assert_eq!(runtime.exec_count(), 0);
}

#[tokio::test]
async fn failing_attempts_are_retried_and_all_recorded() {
    let runtime = FakeRuntime::new();
    runtime.on_exec("flaky-init", ExecBehavior::FailTimes(2));
    let settings = test_settings();
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![script(ScriptOrigin::Custom, "flaky-init")];
    let report = run_phase(&ctx, "web", "/bin/sh", ScriptPhase::PostStart, &sources)
        .await
        .unwrap();

    assert!(!report.failed);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[0].exit_code, Some(1));
    assert_eq!(report.results[1].exit_code, Some(1));
    assert_eq!(report.results[2].exit_code, Some(0));
    assert_eq!(report.results[2].attempt, 3);
}

#[tokio::test]
async fn exhausted_default_does_not_block_custom() {
    let runtime = FakeRuntime::new();
    runtime.on_exec("broken-default", ExecBehavior::AlwaysFail);
    let settings = test_settings();
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![
        script(ScriptOrigin::Default, "broken-default"),
        script(ScriptOrigin::Custom, "custom-backup"),
    ];
    let report = run_phase(&ctx, "db", "/bin/sh", ScriptPhase::PreStop, &sources)
        .await
        .unwrap();

    // Default exhausted its three attempts; the custom script still ran.
    assert!(report.failed);
    assert_eq!(report.results.len(), 4);
    assert!(report.results[..3]
        .iter()
        .all(|r| r.origin == ScriptOrigin::Default && r.exit_code == Some(1)));
    let custom = &report.results[3];
    assert_eq!(custom.origin, ScriptOrigin::Custom);
    assert_eq!(custom.exit_code, Some(0));

    let failure = report.failure.unwrap();
    assert!(failure.contains("default"), "failure was: {}", failure);
    assert!(failure.contains("exhausted 3 attempts"));
}

#[tokio::test]
async fn output_truncation_is_signaled_not_silent() {
    let runtime = FakeRuntime::new();
    runtime.on_exec("chatty", ExecBehavior::EmitLines(150));
    let mut settings = test_settings();
    settings.max_output_lines = 100;
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![script(ScriptOrigin::Custom, "chatty")];
    let report = run_phase(&ctx, "web", "/bin/sh", ScriptPhase::PostStart, &sources)
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.output.len(), 100);
    assert!(result.truncated);
}

#[tokio::test]
async fn scripts_for_one_phase_never_overlap() {
    let runtime = FakeRuntime::new();
    runtime.on_exec("staged", ExecBehavior::Delay(Duration::from_millis(25)));
    let settings = test_settings();
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![
        script(ScriptOrigin::Default, "staged one"),
        script(ScriptOrigin::Custom, "staged two"),
    ];
    let report = run_phase(&ctx, "web", "/bin/sh", ScriptPhase::PostStart, &sources)
        .await
        .unwrap();

    assert!(!report.failed);
    assert_eq!(runtime.max_concurrent_execs("web"), 1);

    // Default ran to completion before custom began.
    let log = runtime.exec_log();
    assert_eq!(log.len(), 2);
    assert!(log[0].body.contains("one"));
    assert!(log[1].body.contains("two"));
}

#[tokio::test]
async fn shell_and_body_reach_the_runtime() {
    let runtime = FakeRuntime::new();
    let settings = test_settings();
    let cancel = CancelToken::new();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![script(ScriptOrigin::Custom, "pg_isready -t 30")];
    run_phase(&ctx, "postgres", "/bin/bash", ScriptPhase::PostStart, &sources)
        .await
        .unwrap();

    let log = runtime.exec_log();
    assert_eq!(log[0].container, "postgres");
    assert_eq!(log[0].body, "pg_isready -t 30");
}

#[tokio::test]
async fn cancelled_phase_stops_and_reports_cancellation() {
    let runtime = FakeRuntime::new();
    let settings = test_settings();
    let cancel = CancelToken::new();
    cancel.cancel();
    let ctx = ScriptRunContext {
        runtime: runtime.as_ref(),
        settings: &settings,
        cancel: &cancel,
    };

    let sources = vec![
        script(ScriptOrigin::Default, "never runs"),
        script(ScriptOrigin::Custom, "never runs either"),
    ];
    let report = run_phase(&ctx, "web", "/bin/sh", ScriptPhase::PreStop, &sources)
        .await
        .unwrap();

    assert!(report.failed);
    assert_eq!(runtime.exec_count(), 0);
    assert!(report.failure.unwrap().contains("cancelled"));
}
