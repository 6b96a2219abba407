//! Shared helpers for the daemon test suite: a programmable fake runtime
//! behind the `ContainerRuntime` trait, config builders and wait utilities.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use berth_protocol::protocol::{OperationSnapshot, ScriptOrigin};
use parking_lot::Mutex;

use berth_daemon::config::{
    BerthConfig, ContainerConfig, ContainerSpec, GroupConfig, LifecycleScripts, ResolvedContainer,
    ScriptSource, Settings,
};
use berth_daemon::orchestrator::Orchestrator;
use berth_daemon::runtime::{
    ContainerRuntime, ContainerState, ExecOptions, ExecOutput, Result, RuntimeError, StopResult,
};

/// Settings tuned for fast tests: no backoff, short waits.
pub fn test_settings() -> Settings {
    Settings {
        init_timeout: Duration::from_secs(5),
        halt_timeout: Duration::from_secs(5),
        observe_timeout: Duration::from_secs(2),
        retry_backoff: Duration::ZERO,
        max_attempts: 3,
        max_output_lines: 100,
        concurrency: 8,
        retention: Duration::from_secs(3600),
    }
}

/// A resolved target with a spec and no scripts.
pub fn target(name: &str) -> ResolvedContainer {
    ResolvedContainer {
        name: name.to_string(),
        spec: Some(ContainerSpec {
            image: format!("{}:test", name),
            ..Default::default()
        }),
        shell: "/bin/sh".to_string(),
        post_start: Vec::new(),
        pre_stop: Vec::new(),
    }
}

pub fn target_with_scripts(
    name: &str,
    post_start: Vec<ScriptSource>,
    pre_stop: Vec<ScriptSource>,
) -> ResolvedContainer {
    ResolvedContainer {
        post_start,
        pre_stop,
        ..target(name)
    }
}

pub fn script(origin: ScriptOrigin, body: &str) -> ScriptSource {
    ScriptSource {
        origin,
        body: body.to_string(),
    }
}

/// Poll an operation until it reaches a terminal state.
pub async fn wait_settled(orchestrator: &Orchestrator, id: &str) -> OperationSnapshot {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = orchestrator
            .status(id)
            .unwrap_or_else(|| panic!("operation {} vanished", id));
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "operation {} did not settle in time",
            id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Config with the given container names (no scripts) and groups.
pub fn config_with(names: &[&str], groups: Vec<(&str, GroupConfig)>) -> Arc<BerthConfig> {
    let containers = names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                ContainerConfig {
                    image: format!("{}:test", name),
                    ports: Vec::new(),
                    env: HashMap::new(),
                    volumes: Vec::new(),
                    shell: "/bin/sh".to_string(),
                    scripts: LifecycleScripts::default(),
                },
            )
        })
        .collect();
    let groups = groups
        .into_iter()
        .map(|(name, group)| (name.to_string(), group))
        .collect();
    Arc::new(BerthConfig::from_parts(
        test_settings(),
        containers,
        groups,
        PathBuf::from("."),
    ))
}

pub fn group(members: &[&str], sequential: bool) -> GroupConfig {
    GroupConfig {
        description: Some("test group".to_string()),
        members: members.iter().map(|m| m.to_string()).collect(),
        sequential,
    }
}

/// Scripted behavior for exec calls whose body contains the pattern.
#[derive(Clone)]
pub enum ExecBehavior {
    /// Exit 0.
    Succeed,
    /// Exit 1 for the first `n` matching calls, then exit 0.
    FailTimes(u32),
    /// Exit 1 every time.
    AlwaysFail,
    /// Report a timeout every time.
    Timeout,
    /// Emit this many stdout lines, then exit 0.
    EmitLines(usize),
    /// Sleep, then exit 0.
    Delay(Duration),
}

struct BehaviorSlot {
    pattern: String,
    behavior: ExecBehavior,
    calls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub container: String,
    pub body: String,
}

#[derive(Default)]
struct Containers {
    /// name -> running instance id; `None` means exited.
    entries: HashMap<String, Option<String>>,
}

/// In-memory runtime with programmable exec behavior and concurrency
/// tracking.
pub struct FakeRuntime {
    containers: Mutex<Containers>,
    behaviors: Mutex<Vec<BehaviorSlot>>,
    exec_log: Mutex<Vec<ExecRecord>>,
    unavailable: AtomicBool,
    instance_counter: AtomicU64,
    active_execs: Mutex<HashMap<String, usize>>,
    /// High-water mark of concurrent execs per container.
    max_per_container: Mutex<HashMap<String, usize>>,
    active_total: Mutex<usize>,
    max_total: Mutex<usize>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(Containers::default()),
            behaviors: Mutex::new(Vec::new()),
            exec_log: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            instance_counter: AtomicU64::new(1),
            active_execs: Mutex::new(HashMap::new()),
            max_per_container: Mutex::new(HashMap::new()),
            active_total: Mutex::new(0),
            max_total: Mutex::new(0),
        })
    }

    fn next_instance(&self) -> String {
        format!("i-{}", self.instance_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn add_running(&self, name: &str) {
        let instance = self.next_instance();
        self.containers
            .lock()
            .entries
            .insert(name.to_string(), Some(instance));
    }

    pub fn add_exited(&self, name: &str) {
        self.containers.lock().entries.insert(name.to_string(), None);
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::Release);
    }

    /// Register behavior for exec calls whose script body contains `pattern`.
    /// Slots are matched in registration order; unmatched bodies succeed.
    pub fn on_exec(&self, pattern: &str, behavior: ExecBehavior) {
        self.behaviors.lock().push(BehaviorSlot {
            pattern: pattern.to_string(),
            behavior,
            calls: 0,
        });
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.exec_log.lock().clone()
    }

    pub fn exec_count(&self) -> usize {
        self.exec_log.lock().len()
    }

    pub fn max_concurrent_execs(&self, name: &str) -> usize {
        self.max_per_container
            .lock()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_concurrent_execs_total(&self) -> usize {
        *self.max_total.lock()
    }

    pub fn running_instance(&self, name: &str) -> Option<String> {
        self.containers
            .lock()
            .entries
            .get(name)
            .cloned()
            .flatten()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.containers.lock().entries.contains_key(name)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(RuntimeError::Unavailable("fake runtime is down".to_string()))
        } else {
            Ok(())
        }
    }

    fn enter_exec(&self, name: &str) {
        let mut active = self.active_execs.lock();
        let count = active.entry(name.to_string()).or_insert(0);
        *count += 1;
        let mut max = self.max_per_container.lock();
        let entry = max.entry(name.to_string()).or_insert(0);
        *entry = (*entry).max(*count);

        let mut total = self.active_total.lock();
        *total += 1;
        let mut max_total = self.max_total.lock();
        *max_total = (*max_total).max(*total);
    }

    fn leave_exec(&self, name: &str) {
        if let Some(count) = self.active_execs.lock().get_mut(name) {
            *count = count.saturating_sub(1);
        }
        let mut total = self.active_total.lock();
        *total = total.saturating_sub(1);
    }

    fn decide(&self, body: &str) -> ExecBehavior {
        let mut behaviors = self.behaviors.lock();
        for slot in behaviors.iter_mut() {
            if body.contains(&slot.pattern) {
                slot.calls += 1;
                return match &slot.behavior {
                    ExecBehavior::FailTimes(n) if slot.calls > *n => ExecBehavior::Succeed,
                    other => other.clone(),
                };
            }
        }
        ExecBehavior::Succeed
    }
}

fn ok_exec(exit_code: i32) -> ExecOutput {
    ExecOutput {
        exit_code: Some(exit_code),
        output: Vec::new(),
        truncated: false,
        timed_out: false,
        cancelled: false,
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_started(&self, name: &str, spec: Option<&ContainerSpec>) -> Result<()> {
        self.check_available()?;
        let mut containers = self.containers.lock();
        let existing = containers.entries.get(name).cloned();
        match existing {
            Some(Some(_)) => Ok(()),
            Some(None) => {
                let instance = self.next_instance();
                containers.entries.insert(name.to_string(), Some(instance));
                Ok(())
            }
            None => {
                if spec.is_none() {
                    return Err(RuntimeError::failed(
                        name,
                        "container does not exist and is not defined in the configuration",
                    ));
                }
                let instance = self.next_instance();
                containers.entries.insert(name.to_string(), Some(instance));
                Ok(())
            }
        }
    }

    async fn stop(&self, name: &str) -> Result<StopResult> {
        self.check_available()?;
        let mut containers = self.containers.lock();
        match containers.entries.get_mut(name) {
            Some(slot) => {
                *slot = None;
                Ok(StopResult::Stopped)
            }
            None => Ok(StopResult::NotFound),
        }
    }

    async fn remove(&self, name: &str, _purge_volumes: bool) -> Result<()> {
        self.check_available()?;
        self.containers.lock().entries.remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        self.check_available()?;
        let containers = self.containers.lock();
        match containers.entries.get(name) {
            Some(Some(instance)) => Ok(ContainerState::Running {
                instance: instance.clone(),
            }),
            Some(None) => Ok(ContainerState::Exited),
            None => Ok(ContainerState::Absent),
        }
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let mut names: Vec<String> = self.containers.lock().entries.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn exec(&self, name: &str, command: &[String], opts: &ExecOptions) -> Result<ExecOutput> {
        self.check_available()?;
        let body = command.last().cloned().unwrap_or_default();
        self.exec_log.lock().push(ExecRecord {
            container: name.to_string(),
            body: body.clone(),
        });

        self.enter_exec(name);
        let behavior = self.decide(&body);
        let result = match behavior {
            ExecBehavior::Succeed => ok_exec(0),
            ExecBehavior::AlwaysFail | ExecBehavior::FailTimes(_) => ok_exec(1),
            ExecBehavior::Timeout => ExecOutput {
                exit_code: None,
                output: Vec::new(),
                truncated: false,
                timed_out: true,
                cancelled: false,
            },
            ExecBehavior::EmitLines(n) => {
                let emitted = n.min(opts.max_output_lines);
                ExecOutput {
                    exit_code: Some(0),
                    output: (0..emitted).map(|i| format!("line {}", i)).collect(),
                    truncated: n > opts.max_output_lines,
                    timed_out: false,
                    cancelled: false,
                }
            }
            ExecBehavior::Delay(duration) => {
                tokio::time::sleep(duration).await;
                if opts.cancel.is_cancelled() {
                    ExecOutput {
                        exit_code: None,
                        output: Vec::new(),
                        truncated: false,
                        timed_out: false,
                        cancelled: true,
                    }
                } else {
                    ok_exec(0)
                }
            }
        };
        self.leave_exec(name);
        Ok(result)
    }
}
